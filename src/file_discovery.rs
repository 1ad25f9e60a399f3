use crate::config::Config;
use crate::error::{Diagnostic, ScanError};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub size: u64,
    pub language: Language,
    pub is_test: bool,
}

impl SourceFile {
    /// Forward-slash form of the relative path, stable across platforms.
    pub fn display_path(&self) -> String {
        slash_path(&self.relative_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    Java,
    Unknown,
}

impl Language {
    pub fn from_extension(extension: Option<&str>) -> Self {
        match extension {
            Some("py") | Some("pyi") | Some("pyw") => Self::Python,
            Some("js") | Some("jsx") | Some("mjs") => Self::JavaScript,
            Some("ts") | Some("tsx") => Self::TypeScript,
            Some("rs") => Self::Rust,
            Some("go") => Self::Go,
            Some("java") => Self::Java,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the walk: either a candidate source file or a skipped entry
/// with its reason.
#[derive(Debug, Clone)]
pub enum Discovered {
    File(SourceFile),
    Skipped(Diagnostic),
}

/// Compiled exclusion globs. Patterns without a `/` are matched against every
/// single path component, so `venv` also prunes `a/b/venv`; patterns with a
/// `/` are matched against the root-relative path.
struct ExclusionSet {
    components: GlobSet,
    paths: GlobSet,
}

impl ExclusionSet {
    fn new(patterns: &[String]) -> Self {
        let mut components = GlobSetBuilder::new();
        let mut paths = GlobSetBuilder::new();

        for pattern in patterns {
            let trimmed = pattern.trim_end_matches('/');
            match Glob::new(trimmed) {
                Ok(glob) if trimmed.contains('/') => {
                    paths.add(glob);
                }
                Ok(glob) => {
                    components.add(glob);
                }
                Err(e) => warn!(%pattern, error = %e, "ignoring invalid exclusion pattern"),
            }
        }

        Self {
            components: build_or_empty(components),
            paths: build_or_empty(paths),
        }
    }

    fn matches(&self, name: &str, relative: &str) -> bool {
        self.components.is_match(name) || self.paths.is_match(relative)
    }
}

fn build_or_empty(builder: GlobSetBuilder) -> GlobSet {
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "failed to compile glob set");
        GlobSet::empty()
    })
}

pub struct FileDiscovery {
    config: Config,
    excludes: ExclusionSet,
    test_names: GlobSet,
    gitignore: Option<Gitignore>,
}

impl FileDiscovery {
    pub fn new(config: Config) -> Self {
        let excludes = ExclusionSet::new(&config.exclude_patterns);

        let mut test_names = GlobSetBuilder::new();
        for pattern in &config.analysis.test_file_patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    test_names.add(glob);
                }
                Err(e) => warn!(%pattern, error = %e, "ignoring invalid test file pattern"),
            }
        }

        let gitignore = if config.respect_gitignore {
            load_gitignore(&config.target_directory)
        } else {
            None
        };

        Self {
            excludes,
            test_names: build_or_empty(test_names),
            gitignore,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.target_directory
    }

    /// Lazily walk the root in lexicographic path order. Each call starts a
    /// fresh walk.
    pub fn walk(&self) -> SourceWalk<'_> {
        let inner = WalkDir::new(self.root())
            .follow_links(self.config.follow_links)
            .sort_by_file_name()
            .into_iter();
        SourceWalk {
            discovery: self,
            inner,
        }
    }

    pub fn discover_files(&self) -> (Vec<SourceFile>, Vec<Diagnostic>) {
        let mut files = Vec::new();
        let mut diagnostics = Vec::new();

        for item in self.walk() {
            match item {
                Discovered::File(file) => files.push(file),
                Discovered::Skipped(diag) => {
                    warn!(file = %diag.file.display(), reason = %diag.reason, "skipped entry");
                    diagnostics.push(diag);
                }
            }
        }

        (files, diagnostics)
    }

    fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        path.strip_prefix(self.root()).unwrap_or(path)
    }

    fn excluded_dir(&self, path: &Path) -> Option<&'static str> {
        let name = file_name(path);
        let relative = slash_path(self.relative(path));

        if self.excludes.matches(&name, &relative) {
            return Some("exclusion pattern");
        }
        if path.join("pyvenv.cfg").is_file() {
            return Some("virtual environment");
        }
        if self.is_gitignored(path, true) {
            return Some("gitignore");
        }
        None
    }

    fn is_gitignored(&self, path: &Path, is_dir: bool) -> bool {
        self.gitignore
            .as_ref()
            .map(|gi| gi.matched_path_or_any_parents(path, is_dir).is_ignore())
            .unwrap_or(false)
    }

    fn process_file(&self, entry: &DirEntry) -> Option<Discovered> {
        let path = entry.path();
        let relative = self.relative(path);
        let name = file_name(path);

        if self.excludes.matches(&name, &slash_path(relative)) || self.is_gitignored(path, false) {
            return None;
        }

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|s| s.to_lowercase());
        match extension {
            Some(ref ext) if self.config.file_extensions.contains(ext) => {}
            _ => return None,
        }

        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                let err = ScanError::io(path, std::io::Error::from(e));
                return Some(Discovered::Skipped(Diagnostic::from(err).relative_to(self.root())));
            }
        };

        if size > self.config.max_file_size as u64 {
            let diag = Diagnostic::skipped(
                relative,
                format!("{} bytes exceeds max_file_size {}", size, self.config.max_file_size),
            );
            return Some(Discovered::Skipped(diag));
        }

        Some(Discovered::File(SourceFile {
            path: path.to_path_buf(),
            relative_path: relative.to_path_buf(),
            size,
            language: Language::from_extension(extension.as_deref()),
            is_test: self.is_test_path(relative),
        }))
    }

    pub fn is_test_path(&self, relative: &Path) -> bool {
        if self.test_names.is_match(file_name(relative)) {
            return true;
        }
        relative
            .parent()
            .map(|parent| {
                parent.components().any(|c| match c {
                    Component::Normal(part) => {
                        let part = part.to_string_lossy();
                        self.config.analysis.test_directories.iter().any(|d| *d == part)
                    }
                    _ => false,
                })
            })
            .unwrap_or(false)
    }

    fn walk_error(&self, err: walkdir::Error) -> Diagnostic {
        let path = err
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root().to_path_buf());

        let scan_error = match err.loop_ancestor() {
            Some(ancestor) => ScanError::LinkCycle {
                ancestor: self.relative(ancestor).to_path_buf(),
                path: path.clone(),
            },
            None => ScanError::io(&path, std::io::Error::from(err)),
        };
        Diagnostic::from(scan_error).relative_to(self.root())
    }

    pub fn get_stats(&self, files: &[SourceFile]) -> FileStats {
        let mut stats = FileStats::default();

        for file in files {
            stats.total_files += 1;
            stats.total_size += file.size;
            if file.is_test {
                stats.test_files += 1;
            }
            *stats.languages.entry(file.language.to_string()).or_insert(0) += 1;
        }

        stats
    }
}

/// Lazy, finite walk over candidate source files. Excluded directories are
/// pruned before their contents are read.
pub struct SourceWalk<'a> {
    discovery: &'a FileDiscovery,
    inner: walkdir::IntoIter,
}

impl Iterator for SourceWalk<'_> {
    type Item = Discovered;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Discovered::Skipped(self.discovery.walk_error(err))),
            };

            if entry.depth() == 0 {
                continue;
            }

            if entry.file_type().is_dir() {
                if let Some(reason) = self.discovery.excluded_dir(entry.path()) {
                    debug!(path = %entry.path().display(), reason, "pruning directory");
                    self.inner.skip_current_dir();
                }
                continue;
            }

            if !entry.file_type().is_file() {
                continue;
            }

            if let Some(found) = self.discovery.process_file(&entry) {
                return Some(found);
            }
        }
    }
}

fn load_gitignore(root: &Path) -> Option<Gitignore> {
    let path = root.join(".gitignore");
    if !path.is_file() {
        return None;
    }

    let mut builder = GitignoreBuilder::new(root);
    if let Some(e) = builder.add(&path) {
        warn!(path = %path.display(), error = %e, "cannot read .gitignore");
    }
    match builder.build() {
        Ok(gitignore) => Some(gitignore),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid .gitignore");
            None
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Default)]
pub struct FileStats {
    pub total_files: usize,
    pub total_size: u64,
    pub test_files: usize,
    pub languages: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn discovery_for(dir: &TempDir) -> FileDiscovery {
        let mut config = Config::default();
        config.target_directory = dir.path().to_path_buf();
        FileDiscovery::new(config)
    }

    fn touch(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn relative_paths(files: &[SourceFile]) -> Vec<String> {
        files.iter().map(|f| f.display_path()).collect()
    }

    #[test]
    fn walks_in_lexicographic_order() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "b.py", "");
        touch(&dir, "a/z.py", "");
        touch(&dir, "a.py", "");
        touch(&dir, "a/b/c.py", "");

        let (files, diagnostics) = discovery_for(&dir).discover_files();
        assert!(diagnostics.is_empty());
        assert_eq!(relative_paths(&files), vec!["a/b/c.py", "a/z.py", "a.py", "b.py"]);
    }

    #[test]
    fn prunes_nested_environment_directories() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "app/main.py", "");
        touch(&dir, "app/deep/venv/lib/site.py", "");
        touch(&dir, "app/__pycache__/main.cpython-311.py", "");
        touch(&dir, "custom_env/pyvenv.cfg", "home = /usr");
        touch(&dir, "custom_env/lib/thing.py", "");
        touch(&dir, ".git/hooks/pre.py", "");

        let (files, _) = discovery_for(&dir).discover_files();
        assert_eq!(relative_paths(&files), vec!["app/main.py"]);
    }

    #[test]
    fn path_patterns_match_relative_paths() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "docs/generated/api.py", "");
        touch(&dir, "docs/conf.py", "");

        let mut config = Config::default();
        config.target_directory = dir.path().to_path_buf();
        config.exclude_patterns.push("docs/generated".to_string());
        let (files, _) = FileDiscovery::new(config).discover_files();
        assert_eq!(relative_paths(&files), vec!["docs/conf.py"]);
    }

    #[test]
    fn walk_is_restartable() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "x.py", "");
        touch(&dir, "y.py", "");

        let discovery = discovery_for(&dir);
        let paths = |d: &FileDiscovery| -> Vec<PathBuf> {
            d.walk()
                .filter_map(|item| match item {
                    Discovered::File(f) => Some(f.relative_path),
                    Discovered::Skipped(_) => None,
                })
                .collect()
        };
        let first = paths(&discovery);
        assert_eq!(first.len(), 2);
        assert_eq!(first, paths(&discovery));
    }

    #[test]
    fn oversized_files_become_diagnostics() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "big.py", &"x = 1\n".repeat(100));

        let mut config = Config::default();
        config.target_directory = dir.path().to_path_buf();
        config.max_file_size = 10;
        let (files, diagnostics) = FileDiscovery::new(config).discover_files();
        assert!(files.is_empty());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].file, PathBuf::from("big.py"));
    }

    #[test]
    fn detects_test_files() {
        let dir = TempDir::new().unwrap();
        let discovery = discovery_for(&dir);
        assert!(discovery.is_test_path(Path::new("tests/helpers.py")));
        assert!(discovery.is_test_path(Path::new("pkg/test_auth.py")));
        assert!(discovery.is_test_path(Path::new("conftest.py")));
        assert!(!discovery.is_test_path(Path::new("pkg/contest.py")));
    }

    #[test]
    fn honours_root_gitignore() {
        let dir = TempDir::new().unwrap();
        touch(&dir, ".gitignore", "generated/\nscratch.py\n");
        touch(&dir, "generated/out.py", "");
        touch(&dir, "scratch.py", "");
        touch(&dir, "kept.py", "");

        let (files, _) = discovery_for(&dir).discover_files();
        assert_eq!(relative_paths(&files), vec!["kept.py"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_are_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "pkg/mod.py", "");
        std::os::unix::fs::symlink(dir.path().join("pkg"), dir.path().join("pkg/loop")).unwrap();

        let (files, diagnostics) = discovery_for(&dir).discover_files();
        assert_eq!(relative_paths(&files), vec!["pkg/mod.py"]);
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == crate::error::DiagnosticKind::LinkCycle));
    }
}
