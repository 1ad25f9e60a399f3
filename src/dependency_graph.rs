use crate::symbol_indexer::{FileIndex, Import, Reference, Resolution, Symbol, SymbolId};
use petgraph::algo::{condensation, toposort};
use petgraph::graph::NodeIndex;
use petgraph::{Directed, Direction, Graph};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Module-level import graph: an edge `a -> b` means `a` imports `b`.
pub type DependencyGraph = Graph<ModuleNode, Edge, Directed>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleNode {
    pub file: PathBuf,
    pub module_name: String,
    pub is_test: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Number of import statements merged into this edge.
    pub weight: usize,
    pub line_numbers: Vec<usize>,
}

/// How often a symbol is referenced, split by where the references come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolUsage {
    pub self_file: usize,
    pub cross_file: usize,
    /// Cross-file references whose site is a test file.
    pub from_tests: usize,
    pub dynamic: usize,
}

impl SymbolUsage {
    pub fn resolved(&self) -> usize {
        self.self_file + self.cross_file
    }

    pub fn only_from_tests(&self) -> bool {
        self.self_file == 0 && self.cross_file > 0 && self.from_tests == self.cross_file
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceGraph {
    pub graph: DependencyGraph,
    pub node_map: BTreeMap<PathBuf, NodeIndex>,
    pub usage: HashMap<SymbolId, SymbolUsage>,
    /// Every reference of the scan with its final resolution, plus one
    /// synthesized reference per `from x import name` that reached a symbol.
    pub references: Vec<Reference>,
    pub external_imports: BTreeMap<PathBuf, BTreeSet<String>>,
    /// Resolved references arriving at each module from other modules.
    pub inbound: BTreeMap<PathBuf, usize>,
    pub cycles: Vec<Vec<PathBuf>>,
}

/// Where an import lands: the internal module and the dotted remainder
/// that names something inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImportTarget {
    module: usize,
    remaining: Vec<String>,
}

pub struct GraphBuilder<'a> {
    files: &'a [Arc<FileIndex>],
    module_index: HashMap<String, usize>,
    module_names: Vec<String>,
}

impl<'a> GraphBuilder<'a> {
    /// `files` must be in root-relative path order; node indices follow it.
    pub fn new(files: &'a [Arc<FileIndex>]) -> Self {
        let mut module_index = HashMap::new();
        for (i, file) in files.iter().enumerate() {
            module_index.entry(file.module_name.clone()).or_insert(i);
        }
        let mut module_names: Vec<String> = module_index.keys().cloned().collect();
        module_names.sort();

        Self {
            files,
            module_index,
            module_names,
        }
    }

    pub fn build_graph(&self) -> ReferenceGraph {
        let mut graph = DependencyGraph::new();
        let mut node_map = BTreeMap::new();
        let mut nodes = Vec::with_capacity(self.files.len());

        for file in self.files {
            let node = graph.add_node(ModuleNode {
                file: file.file.relative_path.clone(),
                module_name: file.module_name.clone(),
                is_test: file.file.is_test,
            });
            node_map.insert(file.file.relative_path.clone(), node);
            nodes.push(node);
        }

        let mut targets: HashMap<(usize, usize), ImportTarget> = HashMap::new();
        let mut edges: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
        let mut external_imports: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();

        for (i, file) in self.files.iter().enumerate() {
            for (j, import) in file.imports.iter().enumerate() {
                match self.resolve_import(i, import) {
                    Some(target) => {
                        if target.module != i {
                            edges.entry((i, target.module)).or_default().push(import.line);
                        }
                        targets.insert((i, j), target);
                    }
                    None => {
                        external_imports
                            .entry(file.file.relative_path.clone())
                            .or_default()
                            .insert(import_label(import));
                    }
                }
            }
        }

        for ((from, to), mut lines) in edges {
            lines.sort_unstable();
            lines.dedup();
            let weight = lines.len();
            graph.add_edge(nodes[from], nodes[to], Edge {
                weight,
                line_numbers: lines,
            });
        }

        let references = self.link_references(&targets);
        let (usage, inbound) = self.aggregate_usage(&references);
        let cycles = find_cycles(&graph)
            .into_iter()
            .map(|cycle| cycle.into_iter().map(|n| graph[n].file.clone()).collect())
            .collect();

        tracing::debug!(
            modules = graph.node_count(),
            edges = graph.edge_count(),
            references = references.len(),
            "reference graph built"
        );

        ReferenceGraph {
            graph,
            node_map,
            usage,
            references,
            external_imports,
            inbound,
            cycles,
        }
    }

    fn resolve_import(&self, importer: usize, import: &Import) -> Option<ImportTarget> {
        let mut parts: Vec<String> = split_dotted(&import.module);
        if let Some(name) = &import.name {
            parts.push(name.clone());
        }
        self.resolve_dotted(importer, import.level, parts)
    }

    /// Longest internal module prefix of the dotted path wins.
    fn resolve_dotted(&self, importer: usize, level: usize, parts: Vec<String>) -> Option<ImportTarget> {
        let mut full = Vec::new();
        if level > 0 {
            let mut base = self.package_parts(importer);
            for _ in 1..level {
                base.pop()?;
            }
            full.extend(base);
        }
        full.extend(parts);

        for len in (1..=full.len()).rev() {
            let candidate = full[..len].join(".");
            if let Some(module) = self.find_module(&candidate, importer, level == 0) {
                return Some(ImportTarget {
                    module,
                    remaining: full[len..].to_vec(),
                });
            }
        }
        None
    }

    /// Exact name, then a sibling in the importer's package, then the
    /// shortest module whose dotted name ends with the candidate.
    fn find_module(&self, candidate: &str, importer: usize, fuzzy: bool) -> Option<usize> {
        if let Some(&module) = self.module_index.get(candidate) {
            return Some(module);
        }
        if !fuzzy {
            return None;
        }

        let package = self.package_parts(importer).join(".");
        if !package.is_empty() {
            if let Some(&module) = self.module_index.get(&format!("{package}.{candidate}")) {
                return Some(module);
            }
        }

        let suffix = format!(".{candidate}");
        self.module_names
            .iter()
            .filter(|name| name.ends_with(&suffix))
            .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
            .and_then(|name| self.module_index.get(name).copied())
    }

    fn package_parts(&self, importer: usize) -> Vec<String> {
        let file = &self.files[importer];
        let mut parts = split_dotted(&file.module_name);
        if file.is_package_init() {
            if file.module_name == "__init__" {
                parts.clear();
            }
        } else {
            parts.pop();
        }
        parts
    }

    fn lookup_symbol(&self, target: &ImportTarget, extra: &[String]) -> Option<&'a Symbol> {
        let path: Vec<&String> = target.remaining.iter().chain(extra.iter()).collect();
        let module = &self.files[target.module];
        if path.len() >= 2 {
            if let Some(symbol) = module.find_qualified(&format!("{}.{}", path[0], path[1])) {
                return Some(symbol);
            }
        }
        path.first().and_then(|first| module.top_level(first))
    }

    fn link_references(&self, targets: &HashMap<(usize, usize), ImportTarget>) -> Vec<Reference> {
        let mut linked = Vec::new();

        for (i, file) in self.files.iter().enumerate() {
            let site_file = &file.file.relative_path;

            // `from x import name` is itself a use of `name` inside x.
            for (j, import) in file.imports.iter().enumerate() {
                if import.name.is_none() {
                    continue;
                }
                let Some(target) = targets.get(&(i, j)) else {
                    continue;
                };
                if let Some(symbol) = self.lookup_symbol(target, &[]) {
                    linked.push(Reference {
                        target: Some(symbol.id.clone()),
                        name: symbol.name.clone(),
                        access: None,
                        site_file: site_file.clone(),
                        site_line: import.line,
                        resolution: Resolution::Resolved,
                    });
                }
            }

            let wildcard_modules: Vec<usize> = file
                .imports
                .iter()
                .enumerate()
                .filter(|(_, import)| import.wildcard)
                .filter_map(|(j, _)| targets.get(&(i, j)))
                .filter(|target| target.remaining.is_empty())
                .map(|target| target.module)
                .collect();

            for reference in &file.references {
                let mut reference = reference.clone();

                if let Some(access) = &reference.access {
                    if let Some(import) = file.imports.get(access.import) {
                        let mut parts = split_dotted(&import.bound_path());
                        parts.extend(access.attributes.iter().cloned());
                        let found = self
                            .resolve_dotted(i, import.level, parts)
                            .and_then(|target| self.lookup_symbol(&target, &[]));
                        if let Some(symbol) = found {
                            reference.target = Some(symbol.id.clone());
                            reference.resolution = Resolution::Resolved;
                        }
                    }
                } else if reference.resolution == Resolution::Unknown && reference.target.is_none() {
                    let found = wildcard_modules
                        .iter()
                        .find_map(|&m| self.files[m].top_level(&reference.name));
                    if let Some(symbol) = found {
                        reference.target = Some(symbol.id.clone());
                        reference.resolution = Resolution::Resolved;
                    }
                }

                linked.push(reference);
            }
        }

        linked
    }

    fn aggregate_usage(
        &self,
        references: &[Reference],
    ) -> (HashMap<SymbolId, SymbolUsage>, BTreeMap<PathBuf, usize>) {
        let mut by_name: HashMap<&str, Vec<&SymbolId>> = HashMap::new();
        let mut test_files = HashSet::new();
        for file in self.files {
            if file.file.is_test {
                test_files.insert(file.file.relative_path.as_path());
            }
            for symbol in &file.symbols {
                by_name.entry(symbol.name.as_str()).or_default().push(&symbol.id);
            }
        }

        let mut usage: HashMap<SymbolId, SymbolUsage> = HashMap::new();
        let mut inbound: BTreeMap<PathBuf, usize> = BTreeMap::new();

        for reference in references {
            match (reference.resolution, &reference.target) {
                (Resolution::Resolved, Some(target)) => {
                    let entry = usage.entry(target.clone()).or_default();
                    if target.file == reference.site_file {
                        entry.self_file += 1;
                    } else {
                        entry.cross_file += 1;
                        if test_files.contains(reference.site_file.as_path()) {
                            entry.from_tests += 1;
                        }
                        *inbound.entry(target.file.clone()).or_default() += 1;
                    }
                }
                (Resolution::DynamicUncertain, Some(target)) => {
                    usage.entry(target.clone()).or_default().dynamic += 1;
                }
                (Resolution::DynamicUncertain, None) => {
                    for id in by_name.get(reference.name.as_str()).into_iter().flatten() {
                        usage.entry((*id).clone()).or_default().dynamic += 1;
                    }
                }
                _ => {}
            }
        }

        (usage, inbound)
    }
}

impl ReferenceGraph {
    pub fn node(&self, file: &Path) -> Option<NodeIndex> {
        self.node_map.get(file).copied()
    }

    pub fn usage(&self, id: &SymbolId) -> SymbolUsage {
        self.usage.get(id).copied().unwrap_or_default()
    }

    pub fn inbound(&self, file: &Path) -> usize {
        self.inbound.get(file).copied().unwrap_or(0)
    }

    /// Modules imported by `file`, in path order.
    pub fn dependencies(&self, file: &Path) -> Vec<&ModuleNode> {
        self.neighbors(file, Direction::Outgoing)
    }

    /// Modules importing `file`, in path order.
    pub fn dependents(&self, file: &Path) -> Vec<&ModuleNode> {
        self.neighbors(file, Direction::Incoming)
    }

    fn neighbors(&self, file: &Path, direction: Direction) -> Vec<&ModuleNode> {
        let Some(node) = self.node(file) else {
            return Vec::new();
        };
        let mut found: Vec<&ModuleNode> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| &self.graph[n])
            .collect();
        found.sort_by(|a, b| a.file.cmp(&b.file));
        found.dedup_by(|a, b| a.file == b.file);
        found
    }

    pub fn in_degree(&self, file: &Path) -> usize {
        self.dependents(file).len()
    }

    /// Longest import chains, one per source of the condensed (acyclic)
    /// graph, longest first. Modules of one cycle collapse to their first path.
    pub fn critical_paths(&self, limit: usize) -> Vec<Vec<PathBuf>> {
        let indices = self.graph.map(|idx, _| idx, |_, _| ());
        let condensed = condensation(indices, true);
        let Ok(order) = toposort(&condensed, None) else {
            return Vec::new();
        };

        let representative = |n: NodeIndex| -> PathBuf {
            condensed[n]
                .iter()
                .map(|&m| self.graph[m].file.clone())
                .min()
                .unwrap_or_default()
        };

        let mut length: HashMap<NodeIndex, usize> = HashMap::new();
        let mut next: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        for &n in order.iter().rev() {
            let best = condensed
                .neighbors(n)
                .map(|m| (length.get(&m).copied().unwrap_or(1), m))
                .max_by(|(la, a), (lb, b)| la.cmp(lb).then_with(|| representative(*b).cmp(&representative(*a))));
            match best {
                Some((len, m)) => {
                    length.insert(n, len + 1);
                    next.insert(n, m);
                }
                None => {
                    length.insert(n, 1);
                }
            }
        }

        let mut chains: Vec<Vec<PathBuf>> = condensed
            .node_indices()
            .filter(|&n| condensed.neighbors_directed(n, Direction::Incoming).next().is_none())
            .filter(|n| length.get(n).copied().unwrap_or(1) > 1)
            .map(|start| {
                let mut chain = vec![representative(start)];
                let mut current = start;
                while let Some(&m) = next.get(&current) {
                    chain.push(representative(m));
                    current = m;
                }
                chain
            })
            .collect();

        chains.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        chains.truncate(limit);
        chains
    }

    pub fn analyze_dependencies(&self) -> DependencyAnalysis {
        let total_modules = self.graph.node_count();
        let total_edges = self.graph.edge_count();

        let mut most_imported: Vec<(String, usize)> = self
            .graph
            .node_indices()
            .map(|n| {
                let count = self.graph.neighbors_directed(n, Direction::Incoming).count();
                (self.graph[n].module_name.clone(), count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        most_imported.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_imported.truncate(5);

        let resolved = self
            .references
            .iter()
            .filter(|r| r.resolution == Resolution::Resolved)
            .count();

        DependencyAnalysis {
            total_modules,
            total_edges,
            external_modules: self
                .external_imports
                .values()
                .flatten()
                .collect::<BTreeSet<_>>()
                .len(),
            total_references: self.references.len(),
            resolved_references: resolved,
            cycles: self.cycles.len(),
            most_imported,
            avg_degree: if total_modules > 0 {
                total_edges as f64 / total_modules as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    pub total_modules: usize,
    pub total_edges: usize,
    pub external_modules: usize,
    pub total_references: usize,
    pub resolved_references: usize,
    pub cycles: usize,
    pub most_imported: Vec<(String, usize)>,
    pub avg_degree: f64,
}

impl DependencyAnalysis {
    pub fn print_summary(&self) {
        println!("Dependency Graph Analysis:");
        println!("  Modules: {}", self.total_modules);
        println!("  Import edges: {}", self.total_edges);
        println!("  External modules: {}", self.external_modules);
        println!("  Average degree: {:.2}", self.avg_degree);
        println!(
            "  References: {} ({} resolved)",
            self.total_references, self.resolved_references
        );
        println!("  Import cycles: {}", self.cycles);

        if !self.most_imported.is_empty() {
            println!("  Most imported:");
            for (module, count) in &self.most_imported {
                println!("    {}: {}", module, count);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

struct Frame {
    node: NodeIndex,
    neighbors: Vec<NodeIndex>,
    next: usize,
}

impl Frame {
    fn new(graph: &DependencyGraph, node: NodeIndex) -> Self {
        let mut neighbors: Vec<NodeIndex> = graph.neighbors(node).collect();
        neighbors.sort_unstable();
        neighbors.dedup();
        Self {
            node,
            neighbors,
            next: 0,
        }
    }
}

/// Three-colour DFS in node order. Each back edge yields the cycle on the
/// current path; rotations of the same cycle are reported once, starting at
/// their lowest node.
fn find_cycles(graph: &DependencyGraph) -> Vec<Vec<NodeIndex>> {
    let mut color = vec![Color::White; graph.node_count()];
    let mut seen: HashSet<Vec<NodeIndex>> = HashSet::new();
    let mut cycles = Vec::new();

    for start in graph.node_indices() {
        if color[start.index()] != Color::White {
            continue;
        }
        color[start.index()] = Color::Gray;
        let mut stack = vec![Frame::new(graph, start)];

        while let Some(frame) = stack.last_mut() {
            let Some(&v) = frame.neighbors.get(frame.next) else {
                color[frame.node.index()] = Color::Black;
                stack.pop();
                continue;
            };
            frame.next += 1;

            match color[v.index()] {
                Color::White => {
                    color[v.index()] = Color::Gray;
                    stack.push(Frame::new(graph, v));
                }
                Color::Gray => {
                    let mut cycle: Vec<NodeIndex> = stack
                        .iter()
                        .map(|f| f.node)
                        .skip_while(|&n| n != v)
                        .collect();
                    if let Some(lowest) = cycle.iter().enumerate().min_by_key(|(_, n)| **n).map(|(i, _)| i) {
                        cycle.rotate_left(lowest);
                    }
                    if seen.insert(cycle.clone()) {
                        cycles.push(cycle);
                    }
                }
                Color::Black => {}
            }
        }
    }

    cycles
}

fn split_dotted(dotted: &str) -> Vec<String> {
    dotted
        .split('.')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn import_label(import: &Import) -> String {
    let dots = ".".repeat(import.level);
    match (&import.name, import.module.is_empty()) {
        (Some(name), true) => format!("{dots}{name}"),
        _ => format!("{dots}{}", import.module),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_discovery::{Language, SourceFile};
    use crate::symbol_indexer::{SymbolIndexer, SymbolKind};

    fn build(sources: &[(&str, &str)]) -> (Vec<Arc<FileIndex>>, ReferenceGraph) {
        let mut indexer = SymbolIndexer::new().unwrap();
        let mut sorted = sources.to_vec();
        sorted.sort();
        let files: Vec<Arc<FileIndex>> = sorted
            .iter()
            .map(|(rel, src)| {
                let file = SourceFile {
                    path: PathBuf::from("/project").join(rel),
                    relative_path: PathBuf::from(rel),
                    size: src.len() as u64,
                    language: Language::Python,
                    is_test: rel.starts_with("tests/"),
                };
                Arc::new(indexer.index_source(&file, src).unwrap())
            })
            .collect();
        let graph = GraphBuilder::new(&files).build_graph();
        (files, graph)
    }

    fn id(file: &str, name: &str, kind: SymbolKind) -> SymbolId {
        SymbolId {
            file: PathBuf::from(file),
            qualified_name: name.to_string(),
            kind,
        }
    }

    #[test]
    fn from_import_links_across_files() {
        let (_, graph) = build(&[
            ("main.py", "from utils import helper\n\nhelper()\n"),
            ("utils.py", "def helper():\n    pass\n\ndef unused():\n    pass\n"),
        ]);
        let helper = graph.usage(&id("utils.py", "helper", SymbolKind::Function));
        assert_eq!(helper.cross_file, 1);
        assert_eq!(graph.usage(&id("utils.py", "unused", SymbolKind::Function)).resolved(), 0);
        assert_eq!(graph.usage(&id("main.py", "helper", SymbolKind::Import)).self_file, 1);
        assert_eq!(graph.dependencies(Path::new("main.py")).len(), 1);
        assert_eq!(graph.inbound(Path::new("utils.py")), 1);
    }

    #[test]
    fn module_attribute_access_resolves() {
        let (_, graph) = build(&[
            ("app/main.py", "import app.services as services\n\nservices.Billing.charge()\n"),
            ("app/__init__.py", ""),
            ("app/services.py", "class Billing:\n    def charge(self):\n        pass\n"),
        ]);
        let charge = graph.usage(&id("app/services.py", "Billing.charge", SymbolKind::Function));
        assert_eq!(charge.cross_file, 1);
    }

    #[test]
    fn relative_and_sibling_imports_resolve() {
        let (_, graph) = build(&[
            ("pkg/__init__.py", ""),
            ("pkg/a.py", "from .b import thing\nimport c\n"),
            ("pkg/b.py", "thing = 1\n"),
            ("pkg/c.py", "x = 2\n"),
        ]);
        let deps: Vec<_> = graph
            .dependencies(Path::new("pkg/a.py"))
            .iter()
            .map(|m| m.module_name.clone())
            .collect();
        assert_eq!(deps, vec!["pkg.b".to_string(), "pkg.c".to_string()]);
        assert!(graph.external_imports.is_empty());
    }

    #[test]
    fn unresolved_imports_are_external() {
        let (_, graph) = build(&[("main.py", "import requests\nfrom os import path\n")]);
        let external = &graph.external_imports[Path::new("main.py")];
        assert!(external.contains("requests"));
        assert!(external.contains("os"));
        assert_eq!(graph.graph.edge_count(), 0);
    }

    #[test]
    fn two_module_cycle_is_reported_once() {
        let (_, graph) = build(&[
            ("a.py", "import b\n"),
            ("b.py", "import a\n"),
        ]);
        assert_eq!(graph.cycles, vec![vec![PathBuf::from("a.py"), PathBuf::from("b.py")]]);
    }

    #[test]
    fn dynamic_name_reference_reaches_every_namesake() {
        let (_, graph) = build(&[
            ("a.py", "def handler():\n    pass\n"),
            ("b.py", "def handler():\n    pass\n\ndef run(o):\n    return getattr(o, 'handler')\n"),
        ]);
        assert_eq!(graph.usage(&id("a.py", "handler", SymbolKind::Function)).dynamic, 1);
        assert_eq!(graph.usage(&id("b.py", "handler", SymbolKind::Function)).dynamic, 1);
    }

    #[test]
    fn test_only_usage_is_tracked() {
        let (_, graph) = build(&[
            ("lib.py", "def fixture_data():\n    return 1\n"),
            ("tests/test_lib.py", "from lib import fixture_data\n\ndef test_it():\n    assert fixture_data()\n"),
        ]);
        let usage = graph.usage(&id("lib.py", "fixture_data", SymbolKind::Function));
        assert!(usage.only_from_tests());
    }

    #[test]
    fn critical_path_follows_longest_chain() {
        let (_, graph) = build(&[
            ("a.py", "import b\nimport d\n"),
            ("b.py", "import c\n"),
            ("c.py", "x = 1\n"),
            ("d.py", "y = 1\n"),
        ]);
        let paths = graph.critical_paths(3);
        assert_eq!(
            paths[0],
            vec![PathBuf::from("a.py"), PathBuf::from("b.py"), PathBuf::from("c.py")]
        );
        assert_eq!(paths.len(), 1);
    }
}
