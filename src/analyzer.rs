use crate::{
    cache::ScanCache,
    config::Config,
    conflicts::{Conflict, ConflictDetector},
    dead_code::{DeadCodeAnalyzer, DeadCodeReport},
    dependency_graph::{DependencyAnalysis, GraphBuilder, ReferenceGraph},
    error::{Diagnostic, ScanError},
    file_discovery::{FileDiscovery, SourceFile},
    symbol_indexer::{FileIndex, SymbolIndexer},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

pub struct Analyzer {
    config: Config,
    file_discovery: FileDiscovery,
    stop: Arc<AtomicBool>,
}

enum IndexOutcome {
    Indexed(FileIndex),
    Failed(ScanError),
    /// Stop requested or deadline passed before the file was picked up.
    NotStarted,
}

impl Analyzer {
    pub fn new(config: Config) -> crate::Result<Self> {
        config.validate()?;
        let file_discovery = FileDiscovery::new(config.clone());

        Ok(Self {
            config,
            file_discovery,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Setting the flag makes workers stop taking new files; the scan then
    /// returns an incomplete model.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// One-shot scan with a private cache.
    pub fn analyze_project(&self) -> ProjectModel {
        let mut cache = ScanCache::init();
        let model = self.analyze_with_cache(&mut cache);
        cache.teardown();
        model
    }

    pub fn analyze_with_cache(&self, cache: &mut ScanCache) -> ProjectModel {
        let started = Instant::now();
        let deadline = self
            .config
            .analysis
            .scan_timeout_ms
            .map(|ms| started + Duration::from_millis(ms));
        let root = self.file_discovery.root().to_path_buf();

        info!(root = %root.display(), "discovering files");
        let (mut sources, mut diagnostics) = self.file_discovery.discover_files();
        sources.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let file_stats = self.file_discovery.get_stats(&sources);

        let mut slots: Vec<Option<Arc<FileIndex>>> = sources.iter().map(|f| cache.lookup(f)).collect();
        let cached_files = slots.iter().filter(|s| s.is_some()).count();
        let pending: Vec<&SourceFile> = sources
            .iter()
            .zip(&slots)
            .filter(|(_, slot)| slot.is_none())
            .map(|(file, _)| file)
            .collect();

        info!(files = sources.len(), cached = cached_files, "indexing symbols");
        let outcomes = self.index_files_parallel(&pending, deadline);

        let mut failed_files = 0;
        let mut not_started = 0;
        let mut outcomes = outcomes.into_iter();
        for (slot, file) in slots.iter_mut().zip(&sources) {
            if slot.is_some() {
                continue;
            }
            match outcomes.next() {
                Some(IndexOutcome::Indexed(index)) => {
                    let index = Arc::new(index);
                    cache.insert(file, Arc::clone(&index));
                    *slot = Some(index);
                }
                Some(IndexOutcome::Failed(err)) => {
                    failed_files += 1;
                    diagnostics.push(err.into());
                }
                Some(IndexOutcome::NotStarted) | None => not_started += 1,
            }
        }

        let incomplete = not_started > 0;
        if incomplete {
            let timed_out = deadline.is_some_and(|d| Instant::now() >= d);
            let diagnostic = if timed_out {
                Diagnostic::from(ScanError::ScanTimeout {
                    elapsed_ms: started.elapsed().as_millis(),
                    pending: not_started,
                })
            } else {
                Diagnostic::skipped(Path::new("."), format!("scan cancelled with {not_started} files not indexed"))
            };
            warn!(%diagnostic, "scan incomplete");
            diagnostics.push(diagnostic);
        }

        let files: Vec<Arc<FileIndex>> = slots.into_iter().flatten().collect();
        let live: HashSet<PathBuf> = sources.iter().map(|f| f.path.clone()).collect();
        cache.retain(&live);

        info!(modules = files.len(), "building reference graph");
        let graph = GraphBuilder::new(&files).build_graph();
        for cycle in &graph.cycles {
            diagnostics.push(Diagnostic::import_cycle(cycle));
        }

        let conflicts = ConflictDetector::new(&sources, &graph).detect();
        diagnostics.extend(conflicts.iter().filter_map(Conflict::diagnostic));

        info!("scoring dead code");
        let dead_code = DeadCodeAnalyzer::new(self.config.analysis.confidence_threshold)
            .with_weights(self.config.analysis.weights.clone())
            .analyze(&files, &graph);

        diagnostics.sort();
        diagnostics.dedup();

        let stats = ScanStats {
            discovered_files: sources.len(),
            indexed_files: files.len(),
            cached_files,
            failed_files,
            skipped_files: not_started,
            test_files: file_stats.test_files,
            total_size: file_stats.total_size,
            total_lines: files.iter().map(|f| f.line_count).sum(),
            total_symbols: files.iter().map(|f| f.symbols.len()).sum(),
            total_references: graph.references.len(),
            languages: file_stats.languages.clone(),
        };

        info!(
            modules = stats.indexed_files,
            conflicts = conflicts.len(),
            findings = dead_code.findings.len(),
            diagnostics = diagnostics.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scan finished"
        );

        ProjectModel {
            name: project_name(&root),
            root,
            files,
            graph,
            conflicts,
            dead_code,
            diagnostics,
            stats,
            incomplete,
        }
    }

    fn index_files_parallel(&self, files: &[&SourceFile], deadline: Option<Instant>) -> Vec<IndexOutcome> {
        if files.is_empty() {
            return Vec::new();
        }

        let run = || {
            let chunk_size = std::cmp::max(1, files.len() / rayon::current_num_threads());
            files
                .par_chunks(chunk_size)
                .map(|chunk| {
                    let mut indexer = match SymbolIndexer::new() {
                        Ok(indexer) => Some(indexer),
                        Err(e) => {
                            warn!(error = %e, "cannot create indexer");
                            None
                        }
                    };
                    chunk
                        .iter()
                        .map(|file| self.index_one(indexer.as_mut(), file, deadline))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
                .into_iter()
                .flatten()
                .collect()
        };

        match self.build_pool() {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    fn index_one(&self, indexer: Option<&mut SymbolIndexer>, file: &SourceFile, deadline: Option<Instant>) -> IndexOutcome {
        if self.stop.load(Ordering::Relaxed) || deadline.is_some_and(|d| Instant::now() >= d) {
            return IndexOutcome::NotStarted;
        }
        let Some(indexer) = indexer else {
            return IndexOutcome::Failed(ScanError::parse(&file.relative_path, "python grammar unavailable"));
        };

        match indexer.index_file(file) {
            Ok(index) => {
                debug!(
                    file = %file.display_path(),
                    symbols = index.symbols.len(),
                    references = index.references.len(),
                    "indexed"
                );
                IndexOutcome::Indexed(index)
            }
            Err(e) => {
                warn!(file = %file.display_path(), error = %e, "skipping file");
                IndexOutcome::Failed(e)
            }
        }
    }

    fn build_pool(&self) -> Option<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.analysis.threads.unwrap_or(0))
            .stack_size(WORKER_STACK_SIZE)
            .thread_name(|i| format!("context-scan-{i}"))
            .build()
            .map_err(|e| warn!(error = %e, "falling back to the global thread pool"))
            .ok()
    }
}

fn project_name(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .as_deref()
        .and_then(|p| p.file_name())
        .or_else(|| root.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub discovered_files: usize,
    pub indexed_files: usize,
    pub cached_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    pub test_files: usize,
    pub total_size: u64,
    pub total_lines: usize,
    pub total_symbols: usize,
    pub total_references: usize,
    pub languages: BTreeMap<String, usize>,
}

/// Everything one scan produced. Built fresh on every run.
#[derive(Debug, Clone)]
pub struct ProjectModel {
    pub name: String,
    pub root: PathBuf,
    /// Indexed modules in root-relative path order.
    pub files: Vec<Arc<FileIndex>>,
    pub graph: ReferenceGraph,
    pub conflicts: Vec<Conflict>,
    pub dead_code: DeadCodeReport,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: ScanStats,
    pub incomplete: bool,
}

impl ProjectModel {
    pub fn file(&self, relative: &Path) -> Option<&FileIndex> {
        self.files
            .iter()
            .find(|f| f.file.relative_path == relative)
            .map(Arc::as_ref)
    }

    pub fn dependency_analysis(&self) -> DependencyAnalysis {
        self.graph.analyze_dependencies()
    }

    pub fn print_summary(&self) {
        println!("📊 Project Scan Summary: {}", self.name);
        println!("==========================");

        println!("\n📁 Files:");
        println!("  Discovered: {}", self.stats.discovered_files);
        println!("  Indexed: {} ({} from cache)", self.stats.indexed_files, self.stats.cached_files);
        println!("  Failed: {}", self.stats.failed_files);
        println!("  Test files: {}", self.stats.test_files);
        println!("  Lines: {}", self.stats.total_lines);
        if self.incomplete {
            println!("  ⚠️  Incomplete: {} files were not indexed", self.stats.skipped_files);
        }

        println!("\n🔗 Dependencies:");
        self.dependency_analysis().print_summary();

        println!("\n🔀 Conflicts: {}", self.conflicts.len());
        for conflict in &self.conflicts {
            println!("  [{}] {}", conflict.severity, conflict.issue);
        }

        let summary = &self.dead_code.summary;
        println!("\n🧹 Dead code:");
        println!("  High: {}  Medium: {}  Low: {}", summary.high, summary.medium, summary.low);
        println!("  Test-only: {}  Empty files: {}", summary.test_only, summary.empty_files);

        if !self.diagnostics.is_empty() {
            println!("\n⚠️  Diagnostics ({}):", self.diagnostics.len());
            for diagnostic in &self.diagnostics {
                println!("  {}", diagnostic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn analyzer_for(dir: &TempDir) -> Analyzer {
        let mut config = Config::default();
        config.target_directory = dir.path().to_path_buf();
        Analyzer::new(config).unwrap()
    }

    fn write(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn parse_failures_become_diagnostics() {
        let dir = TempDir::new().unwrap();
        write(&dir, "good.py", "def ok():\n    pass\n");
        write(&dir, "bad.py", "def broken(:\n");

        let model = analyzer_for(&dir).analyze_project();
        assert_eq!(model.stats.indexed_files, 1);
        assert_eq!(model.stats.failed_files, 1);
        assert!(model
            .diagnostics
            .iter()
            .any(|d| d.kind == crate::error::DiagnosticKind::ParseError && d.file == Path::new("bad.py")));
        assert!(!model.incomplete);
    }

    #[test]
    fn stop_flag_yields_incomplete_model() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.py", "x = 1\n");
        write(&dir, "b.py", "y = 2\n");

        let analyzer = analyzer_for(&dir);
        analyzer.stop_handle().store(true, Ordering::Relaxed);
        let model = analyzer.analyze_project();
        assert!(model.incomplete);
        assert_eq!(model.stats.skipped_files, 2);
        assert!(model.files.is_empty());
    }

    #[test]
    fn zero_timeout_reports_one_timeout_diagnostic() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.py", "x = 1\n");
        write(&dir, "b.py", "y = 2\n");

        let mut config = Config::default();
        config.target_directory = dir.path().to_path_buf();
        config.analysis.scan_timeout_ms = Some(0);
        let model = Analyzer::new(config).unwrap().analyze_project();

        assert!(model.incomplete);
        let timeouts = model
            .diagnostics
            .iter()
            .filter(|d| d.kind == crate::error::DiagnosticKind::ScanTimeout)
            .count();
        assert_eq!(timeouts, 1);
    }

    #[test]
    fn cache_serves_unchanged_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.py", "def f():\n    pass\n");

        let analyzer = analyzer_for(&dir);
        let mut cache = ScanCache::init();
        let first = analyzer.analyze_with_cache(&mut cache);
        let second = analyzer.analyze_with_cache(&mut cache);
        assert_eq!(first.stats.cached_files, 0);
        assert_eq!(second.stats.cached_files, 1);
        assert_eq!(second.dead_code.findings, first.dead_code.findings);
        cache.teardown();
    }
}
