pub mod error;
pub mod config;
pub mod file_discovery;
pub mod symbol_indexer;
pub mod dependency_graph;
pub mod conflicts;
pub mod dead_code;
pub mod cache;
pub mod analyzer;
pub mod reporter;

pub use config::Config;
pub use error::{Diagnostic, DiagnosticKind, ScanError};
pub use file_discovery::FileDiscovery;
pub use symbol_indexer::SymbolIndexer;
pub use dependency_graph::{GraphBuilder, ReferenceGraph};
pub use conflicts::ConflictDetector;
pub use dead_code::DeadCodeAnalyzer;
pub use cache::ScanCache;
pub use analyzer::{Analyzer, ProjectModel};
pub use reporter::Reporter;

pub type Result<T> = anyhow::Result<T>;
