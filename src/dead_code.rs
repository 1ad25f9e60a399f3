use crate::dependency_graph::{ReferenceGraph, SymbolUsage};
use crate::symbol_indexer::{FileIndex, ScopeKind, Symbol, SymbolKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Score adjustments. Only the bucket bounds are fixed; these may be tuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub base_import: i32,
    pub base_function: i32,
    pub base_variable: i32,
    pub base_class: i32,
    pub unused: i32,
    pub private_unused: i32,
    pub per_self_reference: i32,
    /// Per in-file use of an import; one use must sink it below the report floor.
    pub per_import_use: i32,
    pub per_cross_reference: i32,
    pub exported: i32,
    pub test_only: i32,
    pub decorated: i32,
    pub conditional_import: i32,
    pub dynamic: i32,
    pub dynamic_cap: i32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            base_import: 75,
            base_function: 70,
            base_variable: 65,
            base_class: 60,
            unused: 25,
            private_unused: 10,
            per_self_reference: 8,
            per_import_use: 60,
            per_cross_reference: 25,
            exported: 25,
            // equal to the self-file penalty so one more reference never raises a score
            test_only: 8,
            decorated: 20,
            conditional_import: 30,
            dynamic: 15,
            dynamic_cap: 79,
        }
    }
}

impl Weights {
    fn per_self_file(&self, kind: Option<SymbolKind>) -> i32 {
        match kind {
            Some(SymbolKind::Import) => self.per_import_use,
            _ => self.per_self_reference,
        }
    }

    fn base(&self, kind: SymbolKind) -> i32 {
        match kind {
            SymbolKind::Import => self.base_import,
            SymbolKind::Function => self.base_function,
            SymbolKind::Variable => self.base_variable,
            SymbolKind::Class => self.base_class,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    High,
    Medium,
    Low,
}

impl Bucket {
    /// `None` below 20: too uncertain to report at all.
    pub fn from_confidence(confidence: u8) -> Option<Self> {
        match confidence {
            80..=u8::MAX => Some(Self::High),
            60..=79 => Some(Self::Medium),
            20..=59 => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about one symbol that feed the score.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInput {
    pub kind: Option<SymbolKind>,
    pub usage: SymbolUsage,
    pub is_private: bool,
    pub is_exported: bool,
    pub decorated: bool,
    pub conditional: bool,
    /// The defining file is itself a test file.
    pub in_test_file: bool,
}

impl ScoreInput {
    pub fn for_symbol(symbol: &Symbol, usage: SymbolUsage, in_test_file: bool) -> Self {
        Self {
            kind: Some(symbol.id.kind),
            usage,
            is_private: symbol.is_private,
            is_exported: symbol.is_exported,
            decorated: symbol.decorated,
            conditional: symbol.conditional,
            in_test_file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Score {
    pub confidence: u8,
    pub evidence: Vec<&'static str>,
    pub test_only: bool,
}

pub fn score(input: &ScoreInput, weights: &Weights) -> Score {
    let usage = &input.usage;
    let mut evidence = Vec::new();
    let mut confidence = input.kind.map(|k| weights.base(k)).unwrap_or(weights.base_variable);

    if usage.resolved() == 0 {
        confidence += weights.unused;
        evidence.push("unused");
        if input.is_private {
            confidence += weights.private_unused;
            evidence.push("private-unused");
        }
    }

    if usage.self_file > 0 {
        confidence -= weights.per_self_file(input.kind).saturating_mul(count(usage.self_file));
        if usage.cross_file == 0 {
            evidence.push("self-file-only");
        }
    }

    if usage.cross_file > 0 {
        confidence -= weights.per_cross_reference.saturating_mul(count(usage.cross_file));
        evidence.push("cross-file-references");
    }

    if input.is_exported {
        confidence -= weights.exported;
        evidence.push("exported");
    }

    let test_only = !input.in_test_file && usage.only_from_tests();
    if test_only {
        confidence -= weights.test_only;
        evidence.push("test-only-usage");
    }

    if input.decorated {
        confidence -= weights.decorated;
        evidence.push("decorated");
    }

    if input.conditional && input.kind == Some(SymbolKind::Import) {
        confidence -= weights.conditional_import;
        evidence.push("conditional-import");
    }

    if usage.dynamic > 0 {
        confidence -= weights.dynamic;
        confidence = confidence.min(weights.dynamic_cap);
        evidence.push("dynamic-uncertain");
    }

    Score {
        confidence: confidence.clamp(0, 100) as u8,
        evidence,
        test_only,
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadCodeFinding {
    pub file: PathBuf,
    pub symbol: String,
    pub kind: SymbolKind,
    pub line: usize,
    pub confidence: u8,
    pub bucket: Bucket,
    pub evidence: Vec<String>,
    pub test_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadCodeSummary {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub test_only: usize,
    pub empty_files: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadCodeReport {
    pub findings: Vec<DeadCodeFinding>,
    /// Zero-byte modules other than package markers.
    pub empty_files: Vec<PathBuf>,
    pub summary: DeadCodeSummary,
}

impl DeadCodeReport {
    pub fn for_file<'a>(&'a self, file: &'a std::path::Path) -> impl Iterator<Item = &'a DeadCodeFinding> + 'a {
        self.findings.iter().filter(move |f| f.file == file)
    }

    pub fn in_bucket(&self, bucket: Bucket) -> impl Iterator<Item = &DeadCodeFinding> {
        self.findings.iter().filter(move |f| f.bucket == bucket)
    }

    /// Findings at or above `min_confidence`, keeping the summary in step.
    pub fn filtered(&self, min_confidence: u8) -> Self {
        let findings: Vec<DeadCodeFinding> = self
            .findings
            .iter()
            .filter(|f| f.confidence >= min_confidence)
            .cloned()
            .collect();
        Self {
            summary: summarize(&findings, self.empty_files.len()),
            findings,
            empty_files: self.empty_files.clone(),
        }
    }
}

pub struct DeadCodeAnalyzer {
    threshold: u8,
    weights: Weights,
}

impl DeadCodeAnalyzer {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            weights: Weights::default(),
        }
    }

    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = weights;
        self
    }

    pub fn analyze(&self, files: &[Arc<FileIndex>], graph: &ReferenceGraph) -> DeadCodeReport {
        let mut findings = Vec::new();
        let mut empty_files = Vec::new();

        for file in files {
            if file.file.size == 0 && !file.is_package_init() {
                empty_files.push(file.file.relative_path.clone());
            }

            for symbol in &file.symbols {
                if !is_candidate(symbol, file) {
                    continue;
                }
                let input = ScoreInput::for_symbol(symbol, graph.usage(&symbol.id), file.file.is_test);
                let score = score(&input, &self.weights);
                let Some(bucket) = Bucket::from_confidence(score.confidence) else {
                    continue;
                };
                if score.confidence < self.threshold {
                    continue;
                }

                debug!(
                    file = %file.file.display_path(),
                    symbol = %symbol.id.qualified_name,
                    confidence = score.confidence,
                    "dead code candidate"
                );
                findings.push(DeadCodeFinding {
                    file: file.file.relative_path.clone(),
                    symbol: symbol.id.qualified_name.clone(),
                    kind: symbol.id.kind,
                    line: symbol.line,
                    confidence: score.confidence,
                    bucket,
                    evidence: score.evidence.iter().map(|e| e.to_string()).collect(),
                    test_only: score.test_only,
                });
            }
        }

        findings.sort_by(|a, b| {
            a.file
                .cmp(&b.file)
                .then_with(|| a.line.cmp(&b.line))
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        DeadCodeReport {
            summary: summarize(&findings, empty_files.len()),
            findings,
            empty_files,
        }
    }
}

fn summarize(findings: &[DeadCodeFinding], empty_files: usize) -> DeadCodeSummary {
    let mut summary = DeadCodeSummary {
        empty_files,
        ..DeadCodeSummary::default()
    };
    for finding in findings {
        match finding.bucket {
            Bucket::High => summary.high += 1,
            Bucket::Medium => summary.medium += 1,
            Bucket::Low => summary.low += 1,
        }
        if finding.test_only {
            summary.test_only += 1;
        }
    }
    summary
}

/// Names the runtime or a test framework calls on its own, discards, and
/// function locals.
fn is_candidate(symbol: &Symbol, file: &FileIndex) -> bool {
    if symbol.is_dunder() || matches!(symbol.name.as_str(), "self" | "cls" | "_") {
        return false;
    }
    let local = matches!(symbol.scope, ScopeKind::Function | ScopeKind::Lambda | ScopeKind::Comprehension);
    if local && symbol.id.kind == SymbolKind::Variable {
        return false;
    }
    if file.file.is_test {
        let test_function = symbol.id.kind == SymbolKind::Function && symbol.name.starts_with("test");
        let test_class = symbol.id.kind == SymbolKind::Class && symbol.name.starts_with("Test");
        if test_function || test_class {
            return false;
        }
    }
    true
}
