#![allow(dead_code)]

use context_scan::{Analyzer, Config, ProjectModel};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, rel: &str, content: &str) -> &Self {
        let path = self.dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
        self
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.target_directory = self.root().to_path_buf();
        config
    }

    pub fn scan(&self) -> ProjectModel {
        self.scan_with(self.config())
    }

    pub fn scan_with(&self, config: Config) -> ProjectModel {
        Analyzer::new(config).unwrap().analyze_project()
    }
}
