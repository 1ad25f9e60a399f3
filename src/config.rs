use crate::dead_code::Weights;
use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name looked up in the scanned root when no explicit config is given.
pub const CONFIG_FILE_NAME: &str = ".context-scan.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target_directory: PathBuf,
    pub exclude_patterns: Vec<String>,
    pub file_extensions: Vec<String>,
    pub max_file_size: usize,
    pub respect_gitignore: bool,
    pub follow_links: bool,
    pub analysis: AnalysisConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Findings below this confidence are not reported (0-100).
    pub confidence_threshold: u8,
    /// Global scan budget; on expiry the model is returned incomplete.
    pub scan_timeout_ms: Option<u64>,
    /// Indexer worker count; `None` means one per CPU core.
    pub threads: Option<usize>,
    pub test_file_patterns: Vec<String>,
    pub test_directories: Vec<String>,
    /// Dead-code score adjustments; omitted keys keep their defaults.
    pub weights: Weights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub budget: usize,
    pub budget_unit: BudgetUnit,
    pub module_budget: usize,
    pub critical_paths: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetUnit {
    Chars,
    Tokens,
}

/// Rough chars-per-token ratio used when budgets are given in tokens.
pub const CHARS_PER_TOKEN: usize = 4;

impl BudgetUnit {
    pub fn to_chars(self, amount: usize) -> usize {
        match self {
            Self::Chars => amount,
            Self::Tokens => amount.saturating_mul(CHARS_PER_TOKEN),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_directory: PathBuf::from("."),
            exclude_patterns: default_exclude_patterns(),
            file_extensions: vec!["py".to_string()],
            max_file_size: 1024 * 1024, // 1MB
            respect_gitignore: true,
            follow_links: true,
            analysis: AnalysisConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 20,
            scan_timeout_ms: None,
            threads: None,
            test_file_patterns: vec![
                "test_*.py".to_string(),
                "*_test.py".to_string(),
                "conftest.py".to_string(),
            ],
            test_directories: vec![
                "tests".to_string(),
                "test".to_string(),
                "testing".to_string(),
            ],
            weights: Weights::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            budget: 2000,
            budget_unit: BudgetUnit::Tokens,
            module_budget: 1000,
            critical_paths: 3,
        }
    }
}

impl OutputConfig {
    pub fn aggregate_limit(&self) -> usize {
        self.budget_unit.to_chars(self.budget)
    }

    pub fn module_limit(&self) -> usize {
        self.budget_unit.to_chars(self.module_budget)
    }
}

fn default_exclude_patterns() -> Vec<String> {
    [
        // Virtual environments
        "venv", ".venv", "env", "ENV", ".env", "site-packages",
        // Python cache
        "__pycache__", "*.py[cod]",
        // Distribution/build
        "build", "dist", "*.egg-info", ".eggs",
        // Tool caches
        ".mypy_cache", ".pytest_cache", ".ruff_cache", ".cache", ".ipynb_checkpoints",
        // Testing and coverage
        ".tox", ".nox", ".coverage", "htmlcov", ".nyc_output",
        // IDE and system
        ".idea", ".vscode", ".fleet", ".DS_Store",
        // Version control
        ".git", ".svn", ".hg",
        // Package managers
        "node_modules", "vendor",
        // Tool state and scratch
        ".claude", ".next", ".nuxt", "tmp", "temp", "target",
        "*.log", "*.bak", "*.swp", "*~",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Config for `root`: `<root>/.context-scan.toml` when present, defaults otherwise.
    /// The target directory always points at `root`.
    pub fn load(root: &Path) -> crate::Result<Self> {
        let config_path = Self::default_config_path(root);

        let mut config = if config_path.exists() {
            tracing::info!(path = %config_path.display(), "loading configuration");
            Self::from_file(&config_path)?
        } else {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            Self::default()
        };

        config.target_directory = root.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn default_config_path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE_NAME)
    }

    /// Load config from a specific file path
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a file
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.analysis.confidence_threshold > 100 {
            return Err(ScanError::Config(format!(
                "confidence_threshold must be within 0-100, got {}",
                self.analysis.confidence_threshold
            )));
        }
        if self.analysis.threads == Some(0) {
            return Err(ScanError::Config("threads must be at least 1".to_string()));
        }
        if self.output.budget == 0 {
            return Err(ScanError::Config("output budget must be positive".to_string()));
        }
        Ok(())
    }

    /// Create a config file with all available options documented
    pub fn create_documented_config() -> String {
        r#"# context-scan configuration
# Place this file at the root of the scanned project as .context-scan.toml

# Exclusion globs. Patterns without '/' match a single path component at any
# depth (so "venv" prunes nested virtual environments too); patterns with '/'
# match the root-relative path. Directories holding a pyvenv.cfg are always
# skipped.
exclude_patterns = [
    "venv", ".venv", "env", "ENV", ".env", "site-packages",
    "__pycache__", "*.py[cod]",
    "build", "dist", "*.egg-info", ".eggs",
    ".mypy_cache", ".pytest_cache", ".ruff_cache", ".cache", ".ipynb_checkpoints",
    ".tox", ".nox", ".coverage", "htmlcov", ".nyc_output",
    ".idea", ".vscode", ".fleet", ".DS_Store",
    ".git", ".svn", ".hg",
    "node_modules", "vendor",
    ".claude", ".next", ".nuxt", "tmp", "temp", "target",
    "*.log", "*.bak", "*.swp", "*~",
]

# Extensions handed to the indexer (only Python is understood)
file_extensions = ["py"]

# Files above this size (bytes) are skipped with a diagnostic
max_file_size = 1048576

# Honour the root .gitignore
respect_gitignore = true

# Follow symlinks (cycles are detected and reported)
follow_links = true

[analysis]
# Minimum dead-code confidence to report (0-100).
# Buckets: high >= 80, medium >= 60, low >= 20.
confidence_threshold = 20

# Global scan budget in milliseconds; the result is marked incomplete on expiry
# scan_timeout_ms = 30000

# Indexer worker threads (defaults to the number of CPU cores)
# threads = 4

# Test file detection
test_file_patterns = ["test_*.py", "*_test.py", "conftest.py"]
test_directories = ["tests", "test", "testing"]

# Dead-code score adjustments. Only the bucket bounds are fixed, so these can
# be tuned; any key left out keeps its default.
# [analysis.weights]
# base_import = 75
# base_function = 70
# base_variable = 65
# base_class = 60
# unused = 25
# private_unused = 10
# per_self_reference = 8
# per_import_use = 60
# per_cross_reference = 25
# exported = 25
# test_only = 8
# decorated = 20
# conditional_import = 30
# dynamic = 15
# dynamic_cap = 79

[output]
# Size budget of PROJECT.llm; lowest-centrality modules are dropped first
budget = 2000
# "tokens" (4 chars each) or "chars"
budget_unit = "tokens"
# Size budget of each per-module CONTEXT.llm section
module_budget = 1000
# Number of dependency chains listed under @critical_paths
critical_paths = 3
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_config_parses_to_defaults() {
        let parsed: Config = toml::from_str(&Config::create_documented_config()).unwrap();
        let defaults = Config::default();
        assert_eq!(parsed.exclude_patterns, defaults.exclude_patterns);
        assert_eq!(parsed.analysis.confidence_threshold, 20);
        assert_eq!(parsed.output.budget_unit, BudgetUnit::Tokens);
        assert_eq!(parsed.output.aggregate_limit(), 8000);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str("[output]\nbudget = 500\nbudget_unit = \"chars\"\n").unwrap();
        assert_eq!(parsed.output.aggregate_limit(), 500);
        assert_eq!(parsed.file_extensions, vec!["py".to_string()]);
        assert_eq!(parsed.analysis.test_directories.len(), 3);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = Config::default();
        config.analysis.confidence_threshold = 60;
        config.analysis.weights.decorated = 30;
        config.output.critical_paths = 5;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.analysis.confidence_threshold, 60);
        assert_eq!(loaded.analysis.weights.decorated, 30);
        assert_eq!(loaded.analysis.weights.unused, 25);
        assert_eq!(loaded.output.critical_paths, 5);
        assert_eq!(loaded.analysis.scan_timeout_ms, None);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.analysis.confidence_threshold = 101;
        assert!(matches!(config.validate(), Err(ScanError::Config(_))));
    }
}
