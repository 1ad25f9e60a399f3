use crate::{
    analyzer::{ProjectModel, ScanStats},
    config::OutputConfig,
    conflicts::Conflict,
    dead_code::{DeadCodeFinding, DeadCodeReport},
    dependency_graph::DependencyAnalysis,
    error::{Diagnostic, ScanError},
    file_discovery::slash_path,
    symbol_indexer::{FileIndex, Symbol, SymbolKind},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const PROJECT_DOCUMENT: &str = "PROJECT.llm";
pub const CONTEXT_DOCUMENT: &str = "CONTEXT.llm";

/// The rendered aggregate document and what had to give way to fit it.
#[derive(Debug, Clone)]
pub struct ProjectDocument {
    pub text: String,
    /// Modules left out to meet the budget, in drop order.
    pub dropped: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ProjectDocument {
    pub fn is_truncated(&self) -> bool {
        !self.dropped.is_empty()
    }
}

pub struct Reporter<'a> {
    model: &'a ProjectModel,
    output: OutputConfig,
    critical_paths: Vec<Vec<PathBuf>>,
}

impl<'a> Reporter<'a> {
    pub fn new(model: &'a ProjectModel, output: &OutputConfig) -> Self {
        Self {
            critical_paths: model.graph.critical_paths(output.critical_paths),
            model,
            output: output.clone(),
        }
    }

    /// PROJECT.llm, bounded by the aggregate budget. Modules with the fewest
    /// importers are dropped first; the smallest drop count that fits wins.
    pub fn project_document(&self) -> ProjectDocument {
        let limit = self.output.aggregate_limit();
        let order = self.drop_order();
        let render = |k: usize| -> String {
            let dropped: BTreeSet<&Path> = order[..k].iter().map(PathBuf::as_path).collect();
            self.render_project(&dropped)
        };
        let fits = |k: usize| char_len(&render(k)) <= limit;

        let document = |k: usize, diagnostics: Vec<Diagnostic>| ProjectDocument {
            text: render(k),
            dropped: order[..k].to_vec(),
            diagnostics,
        };

        if fits(0) {
            return document(0, Vec::new());
        }

        let n = order.len();
        if !fits(n) {
            let actual = char_len(&render(n));
            warn!(limit, actual, "aggregate document exceeds budget even without modules");
            let diagnostic: Diagnostic = ScanError::BudgetExceeded { limit, actual }.into();
            return document(n, vec![diagnostic]);
        }

        let (mut lo, mut hi) = (1, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if fits(mid) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        // marker width changes with the count, so the search is not strictly monotone
        let mut k = lo;
        while k > 1 && fits(k - 1) {
            k -= 1;
        }

        info!(dropped = k, modules = n, "aggregate document truncated");
        document(k, Vec::new())
    }

    /// Lowest in-degree first; among equals the lexicographically greatest path.
    fn drop_order(&self) -> Vec<PathBuf> {
        let mut order: Vec<(usize, &PathBuf)> = self
            .model
            .files
            .iter()
            .map(|f| {
                let path = &f.file.relative_path;
                (self.model.graph.in_degree(path), path)
            })
            .collect();
        order.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)));
        order.into_iter().map(|(_, p)| p.clone()).collect()
    }

    fn render_project(&self, dropped: &BTreeSet<&Path>) -> String {
        let model = self.model;
        let graph = &model.graph;
        let kept = |p: &Path| !dropped.contains(p);

        let mut doc = format!("@project: {}\n", model.name);
        doc.push_str(&format!(
            "@files: {} discovered, {} indexed, {} failed\n",
            model.stats.discovered_files, model.stats.indexed_files, model.stats.failed_files
        ));
        doc.push_str(&format!("@modules: {}\n", model.files.len()));
        if model.incomplete {
            doc.push_str(&format!("@incomplete: {} files not indexed\n", model.stats.skipped_files));
        }

        let mut architecture = Vec::new();
        let mut dependency_graph = Vec::new();
        for file in &model.files {
            let path = file.file.relative_path.as_path();
            if !kept(path) {
                continue;
            }
            let deps: Vec<String> = graph
                .dependencies(path)
                .into_iter()
                .filter(|d| kept(d.file.as_path()))
                .map(|d| slash_path(&d.file))
                .collect();
            if deps.is_empty() {
                architecture.push(format!("- {}", slash_path(path)));
            } else {
                architecture.push(format!("- {} [@deps: {}]", slash_path(path), deps.join(", ")));
                dependency_graph.push(format!("{} -> {}", slash_path(path), deps.join(", ")));
            }
        }
        push_section(&mut doc, "@architecture:", architecture);
        push_section(&mut doc, "@dependency_graph:", dependency_graph);

        push_section(
            &mut doc,
            "@conflicts:",
            model.conflicts.iter().map(conflict_line).collect(),
        );

        let cycles = graph
            .cycles
            .iter()
            .filter(|cycle| cycle.iter().all(|p| kept(p.as_path())))
            .map(|cycle| {
                let mut names: Vec<String> = cycle.iter().map(|p| slash_path(p)).collect();
                if let Some(first) = names.first().cloned() {
                    names.push(first);
                }
                format!("- {}", names.join(" -> "))
            })
            .collect();
        push_section(&mut doc, "@cycles:", cycles);

        let summary = &model.dead_code.summary;
        doc.push_str(&format!(
            "\n@dead_code: high={} medium={} low={} test_only={} empty_files={}\n",
            summary.high, summary.medium, summary.low, summary.test_only, summary.empty_files
        ));

        let paths = self
            .critical_paths
            .iter()
            .filter(|chain| chain.iter().all(|p| kept(p.as_path())))
            .map(|chain| {
                let names: Vec<String> = chain.iter().map(|p| slash_path(p)).collect();
                format!("- {}", names.join(" -> "))
            })
            .collect();
        push_section(&mut doc, "@critical_paths:", paths);

        if !dropped.is_empty() {
            doc.push_str(&format!("\n@truncated: {} modules omitted\n", dropped.len()));
        }

        doc
    }

    /// CONTEXT.llm section for one module, bounded by the module budget.
    /// Whatever room the header leaves is shared by deps, exports and
    /// findings; each list is cut with `... N more`.
    pub fn module_document(&self, file: &FileIndex) -> String {
        let limit = self.output.module_limit();
        let path = file.file.relative_path.as_path();

        let mut doc = format!("@module: {}\n", file.module_name);
        doc.push_str(&format!("@path: {}\n", slash_path(path)));

        let fixed = char_len(&doc) + "@deps: []\n@exports:\n@dead_code:\n".len();
        let mut remaining = limit.saturating_sub(fixed);

        let deps: Vec<String> = self
            .model
            .graph
            .dependencies(path)
            .into_iter()
            .map(|d| d.module_name.clone())
            .collect();
        let deps = bounded(deps, remaining / 3, INLINE_SEPARATOR).join(", ");
        remaining -= char_len(&deps);
        doc.push_str(&format!("@deps: [{deps}]\n"));

        let exports = bounded(export_entries(file), remaining / 2, LINE_SEPARATOR);
        remaining -= exports.iter().map(|e| char_len(e) + 1).sum::<usize>();
        doc.push_str("@exports:\n");
        for entry in &exports {
            doc.push_str(entry);
            doc.push('\n');
        }

        let findings: Vec<String> = self
            .model
            .dead_code
            .for_file(path)
            .map(finding_line)
            .collect();
        doc.push_str("@dead_code:\n");
        for entry in bounded(findings, remaining, LINE_SEPARATOR) {
            doc.push_str(&entry);
            doc.push('\n');
        }

        doc
    }

    /// Module documents concatenated per directory, keyed by root-relative
    /// directory (`.` for the root).
    pub fn directory_documents(&self) -> BTreeMap<PathBuf, String> {
        let mut grouped: BTreeMap<PathBuf, String> = BTreeMap::new();
        for file in &self.model.files {
            let dir = file
                .file
                .relative_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let section = self.module_document(file);
            let doc = grouped.entry(dir).or_default();
            if !doc.is_empty() {
                doc.push('\n');
            }
            doc.push_str(&section);
        }
        grouped
    }

    /// Write PROJECT.llm at `root` and one CONTEXT.llm per directory.
    pub fn write_documents(&self, root: &Path, project: &ProjectDocument) -> crate::Result<Vec<PathBuf>> {
        let mut written = Vec::new();

        let project_path = root.join(PROJECT_DOCUMENT);
        fs::write(&project_path, &project.text)?;
        written.push(project_path);

        for (dir, content) in self.directory_documents() {
            let target = root.join(&dir);
            fs::create_dir_all(&target)?;
            let context_path = target.join(CONTEXT_DOCUMENT);
            let content = if context_path.is_file() {
                merge_context(&fs::read_to_string(&context_path)?, &content)
            } else {
                content
            };
            fs::write(&context_path, content)?;
            written.push(context_path);
        }

        info!(documents = written.len(), "documents written");
        Ok(written)
    }

    pub fn generate_report(&self) -> Report {
        let graph = &self.model.graph;
        let modules = self
            .model
            .files
            .iter()
            .map(|file| {
                let path = file.file.relative_path.as_path();
                ModuleReport {
                    path: path.to_path_buf(),
                    module_name: file.module_name.clone(),
                    is_test: file.file.is_test,
                    lines: file.line_count,
                    symbols: file.symbols.len(),
                    exports: export_names(file),
                    dependencies: graph.dependencies(path).into_iter().map(|d| d.file.clone()).collect(),
                    dependents: graph.dependents(path).into_iter().map(|d| d.file.clone()).collect(),
                    external_imports: graph
                        .external_imports
                        .get(path)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default(),
                }
            })
            .collect();

        Report {
            project_name: self.model.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            incomplete: self.model.incomplete,
            stats: self.model.stats.clone(),
            dependency_analysis: graph.analyze_dependencies(),
            modules,
            conflicts: self.model.conflicts.clone(),
            cycles: graph.cycles.clone(),
            critical_paths: self.critical_paths.clone(),
            dead_code: self.model.dead_code.clone(),
            diagnostics: self.model.diagnostics.clone(),
        }
    }

    pub fn export_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(&self.generate_report())?)
    }
}

/// Serializable view of a [`ProjectModel`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Report {
    pub project_name: String,
    pub version: String,
    pub incomplete: bool,
    pub stats: ScanStats,
    pub dependency_analysis: DependencyAnalysis,
    pub modules: Vec<ModuleReport>,
    pub conflicts: Vec<Conflict>,
    pub cycles: Vec<Vec<PathBuf>>,
    pub critical_paths: Vec<Vec<PathBuf>>,
    pub dead_code: DeadCodeReport,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleReport {
    pub path: PathBuf,
    pub module_name: String,
    pub is_test: bool,
    pub lines: usize,
    pub symbols: usize,
    pub exports: Vec<String>,
    pub dependencies: Vec<PathBuf>,
    pub dependents: Vec<PathBuf>,
    pub external_imports: Vec<String>,
}

fn push_section(doc: &mut String, header: &str, lines: Vec<String>) {
    doc.push('\n');
    doc.push_str(header);
    doc.push('\n');
    if lines.is_empty() {
        doc.push_str("- none\n");
    }
    for line in lines {
        doc.push_str(&line);
        doc.push('\n');
    }
}

fn conflict_line(conflict: &Conflict) -> String {
    format!(
        "- {{issue: {}, members: [{}], suggested_primary: {}, severity: {}}}",
        conflict.issue,
        conflict.member_names().join(", "),
        conflict.suggested_primary.as_deref().unwrap_or("none"),
        conflict.severity
    )
}

fn finding_line(finding: &DeadCodeFinding) -> String {
    format!(
        "- {{symbol: {}, kind: {}, line: {}, confidence: {}, bucket: {}, evidence: [{}]}}",
        finding.symbol,
        finding.kind,
        finding.line,
        finding.confidence,
        finding.bucket,
        finding.evidence.join(", ")
    )
}

fn is_public(symbol: &Symbol) -> bool {
    !symbol.is_private && !symbol.is_dunder()
}

/// `__all__` when declared, otherwise the public top-level surface.
fn export_names(file: &FileIndex) -> Vec<String> {
    if let Some(all) = &file.exports {
        return all.clone();
    }
    file.symbols
        .iter()
        .filter(|s| s.is_top_level() && is_public(s))
        .filter(|s| s.id.kind != SymbolKind::Import || s.is_exported)
        .map(|s| s.name.clone())
        .collect()
}

fn export_entries(file: &FileIndex) -> Vec<String> {
    if let Some(all) = &file.exports {
        return all.iter().map(|name| format!("- {name}")).collect();
    }

    let mut entries = Vec::new();
    for symbol in file.symbols.iter().filter(|s| s.is_top_level() && is_public(s)) {
        match symbol.id.kind {
            SymbolKind::Class => {
                let prefix = format!("{}.", symbol.id.qualified_name);
                let mut entry = format!("- class {}", symbol.name);
                for method in file.symbols.iter().filter(|m| {
                    m.id.kind == SymbolKind::Function
                        && is_public(m)
                        && m.id.qualified_name.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('.'))
                }) {
                    entry.push_str(&format!("\n  - {}()", method.name));
                }
                entries.push(entry);
            }
            SymbolKind::Function => entries.push(format!("- {}()", symbol.name)),
            SymbolKind::Variable => entries.push(format!("- {}", symbol.name)),
            SymbolKind::Import if symbol.is_exported => entries.push(format!("- {}", symbol.name)),
            SymbolKind::Import => {}
        }
    }
    entries
}

/// Sections of CONTEXT.llm regenerated on every update.
const GENERATED_SECTIONS: [&str; 5] = ["module", "path", "deps", "exports", "dead_code"];

static SECTION_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@([A-Za-z_][A-Za-z0-9_]*):").expect("Invalid section header regex"));

/// Rebuild an existing CONTEXT.llm: hand-written sections (and any text
/// before the first section) are kept in their original order, generated
/// sections are replaced by `generated`.
fn merge_context(existing: &str, generated: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut keep_current = true;

    for line in existing.lines() {
        if let Some(caps) = SECTION_HEADER.captures(line) {
            if keep_current && !current.trim().is_empty() {
                kept.push(current.trim_end().to_string());
            }
            current.clear();
            keep_current = !GENERATED_SECTIONS.contains(&&caps[1]);
        }
        current.push_str(line);
        current.push('\n');
    }
    if keep_current && !current.trim().is_empty() {
        kept.push(current.trim_end().to_string());
    }

    if kept.is_empty() {
        return generated.to_string();
    }
    format!("{}\n\n{}", kept.join("\n\n"), generated)
}

const LINE_SEPARATOR: usize = 1;
const INLINE_SEPARATOR: usize = 2;

/// Keep entries while they fit `budget` chars, each followed by a separator
/// of `separator` chars, replacing the rest with a `... N more` entry. The
/// marker is left out when even it does not fit.
fn bounded(entries: Vec<String>, budget: usize, separator: usize) -> Vec<String> {
    let total = entries.len();
    let mut kept = Vec::new();
    let mut used = 0;

    for (i, entry) in entries.into_iter().enumerate() {
        let cost = char_len(&entry) + separator;
        let left = total - i - 1;
        let marker = if left > 0 { char_len(&more_marker(left)) + separator } else { 0 };
        if used + cost + marker > budget {
            let cut = more_marker(total - i);
            if used + char_len(&cut) + separator <= budget {
                kept.push(cut);
            }
            return kept;
        }
        used += cost;
        kept.push(entry);
    }
    kept
}

fn more_marker(count: usize) -> String {
    format!("... {count} more")
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
