use crate::file_discovery::slash_path;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Everything that can go wrong while scanning. None of these abort a scan:
/// each one is turned into a [`Diagnostic`] and the pipeline keeps going with
/// whatever it has.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("parse error: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("io error: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("symlink cycle back to {}", ancestor.display())]
    LinkCycle { path: PathBuf, ancestor: PathBuf },

    #[error("{} names normalize to '{key}': {}", members.len(), members.join(", "))]
    AmbiguousConflict { key: String, members: Vec<String> },

    #[error("output needs {actual} chars but the budget is {limit}")]
    BudgetExceeded { limit: usize, actual: usize },

    #[error("scan timed out after {elapsed_ms}ms with {pending} files not indexed")]
    ScanTimeout { elapsed_ms: u128, pending: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ScanError {
    pub fn parse(path: &Path, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> DiagnosticKind {
        match self {
            Self::Parse { .. } => DiagnosticKind::ParseError,
            Self::Io { .. } => DiagnosticKind::IoError,
            Self::LinkCycle { .. } => DiagnosticKind::LinkCycle,
            Self::AmbiguousConflict { .. } => DiagnosticKind::AmbiguousConflict,
            Self::BudgetExceeded { .. } => DiagnosticKind::BudgetExceeded,
            Self::ScanTimeout { .. } => DiagnosticKind::ScanTimeout,
            Self::Config(_) => DiagnosticKind::Config,
        }
    }

    fn subject(&self) -> PathBuf {
        match self {
            Self::Parse { path, .. } | Self::Io { path, .. } | Self::LinkCycle { path, .. } => {
                path.clone()
            }
            Self::AmbiguousConflict { key, .. } => PathBuf::from(key),
            Self::BudgetExceeded { .. } => PathBuf::from("PROJECT.llm"),
            Self::ScanTimeout { .. } | Self::Config(_) => PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    ParseError,
    IoError,
    LinkCycle,
    ImportCycle,
    SkippedFile,
    AmbiguousConflict,
    BudgetExceeded,
    ScanTimeout,
    Config,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ParseError => "parse-error",
            Self::IoError => "io-error",
            Self::LinkCycle => "link-cycle",
            Self::ImportCycle => "import-cycle",
            Self::SkippedFile => "skipped-file",
            Self::AmbiguousConflict => "ambiguous-conflict",
            Self::BudgetExceeded => "budget-exceeded",
            Self::ScanTimeout => "scan-timeout",
            Self::Config => "config",
        };
        f.write_str(label)
    }
}

/// One entry of the diagnostics stream that travels next to the documents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: PathBuf,
    pub kind: DiagnosticKind,
    pub reason: String,
}

impl Diagnostic {
    pub fn skipped(file: &Path, reason: impl Into<String>) -> Self {
        Self {
            file: file.to_path_buf(),
            kind: DiagnosticKind::SkippedFile,
            reason: reason.into(),
        }
    }

    /// Cycles are reported, never fatal; the diagnostic is anchored on the
    /// first module of the cycle.
    pub fn import_cycle(modules: &[PathBuf]) -> Self {
        let chain: Vec<String> = modules.iter().map(|m| slash_path(m)).collect();
        Self {
            file: modules.first().cloned().unwrap_or_default(),
            kind: DiagnosticKind::ImportCycle,
            reason: format!("import cycle: {}", chain.join(" -> ")),
        }
    }

    /// Re-anchor the diagnostic on a root-relative path so reports stay
    /// stable across machines.
    pub fn relative_to(mut self, root: &Path) -> Self {
        if let Ok(rel) = self.file.strip_prefix(root) {
            self.file = if rel.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                rel.to_path_buf()
            };
        }
        self
    }
}

impl From<ScanError> for Diagnostic {
    fn from(err: ScanError) -> Self {
        Self {
            file: err.subject(),
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.file.display(), self.kind, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_becomes_parse_diagnostic() {
        let diag: Diagnostic = ScanError::parse(Path::new("/r/a.py"), "syntax error at line 3").into();
        assert_eq!(diag.kind, DiagnosticKind::ParseError);
        assert_eq!(diag.file, PathBuf::from("/r/a.py"));
        assert!(diag.reason.contains("line 3"));
    }

    #[test]
    fn relative_to_strips_root() {
        let diag = Diagnostic::skipped(Path::new("/r/pkg/a.py"), "too large").relative_to(Path::new("/r"));
        assert_eq!(diag.file, PathBuf::from("pkg/a.py"));
        let root = Diagnostic::skipped(Path::new("/r"), "x").relative_to(Path::new("/r"));
        assert_eq!(root.file, PathBuf::from("."));
    }

    #[test]
    fn cycle_reason_uses_forward_slashes() {
        let diag = Diagnostic::import_cycle(&[PathBuf::from("pkg").join("a.py"), PathBuf::from("b.py")]);
        assert_eq!(diag.kind, DiagnosticKind::ImportCycle);
        assert_eq!(diag.reason, "import cycle: pkg/a.py -> b.py");
    }

    #[test]
    fn ambiguous_conflict_lists_members() {
        let err = ScanError::AmbiguousConflict {
            key: "util".into(),
            members: vec!["util".into(), "utils".into(), "Util_".into()],
        };
        assert_eq!(err.to_string(), "3 names normalize to 'util': util, utils, Util_");
        assert_eq!(Diagnostic::from(err).file, PathBuf::from("util"));
    }
}
