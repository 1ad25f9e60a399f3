use crate::error::ScanError;
use crate::file_discovery::{Language, SourceFile};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tree_sitter::{Node, Parser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Import,
    Function,
    Class,
    Variable,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Function => "function",
            Self::Class => "class",
            Self::Variable => "variable",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a definition: unique within one scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolId {
    pub file: PathBuf,
    pub qualified_name: String,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Module,
    Class,
    Function,
    Lambda,
    Comprehension,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    pub line: usize,
    /// Kind of the scope the definition lives in.
    pub scope: ScopeKind,
    pub is_private: bool,
    pub is_exported: bool,
    pub decorated: bool,
    /// Import placed inside try/except/if, usually an optional-dependency fallback.
    pub conditional: bool,
    /// Index into [`FileIndex::imports`] for import symbols.
    pub import: Option<usize>,
}

impl Symbol {
    pub fn is_dunder(&self) -> bool {
        is_dunder(&self.name)
    }

    pub fn is_top_level(&self) -> bool {
        self.scope == ScopeKind::Module
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    /// Dotted module as written (without the leading dots of relative imports).
    pub module: String,
    /// Imported member for `from module import name`.
    pub name: Option<String>,
    pub alias: Option<String>,
    /// Number of leading dots; 0 for absolute imports.
    pub level: usize,
    pub line: usize,
    pub conditional: bool,
    pub wildcard: bool,
}

impl Import {
    /// Name the import binds in the importing scope.
    pub fn binding(&self) -> Option<&str> {
        if self.wildcard {
            return None;
        }
        if let Some(alias) = &self.alias {
            return Some(alias);
        }
        match &self.name {
            Some(name) => Some(name),
            None => self.module.split('.').next(),
        }
    }

    /// Dotted path the bound name stands for, relative to `level`.
    /// `import a.b` binds `a`, so its path is `a`; `import a.b as c` binds `a.b`.
    pub fn bound_path(&self) -> String {
        match &self.name {
            Some(name) if self.module.is_empty() => name.clone(),
            Some(name) => format!("{}.{}", self.module, name),
            None if self.alias.is_some() => self.module.clone(),
            None => self.module.split('.').next().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    Resolved,
    DynamicUncertain,
    Unknown,
}

/// Attribute access through an imported name, e.g. `utils.helper` after
/// `import utils`. Resolved across files by the graph builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportAccess {
    pub import: usize,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub target: Option<SymbolId>,
    pub name: String,
    pub access: Option<ImportAccess>,
    pub site_file: PathBuf,
    pub site_line: usize,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIndex {
    pub file: SourceFile,
    pub module_name: String,
    pub symbols: Vec<Symbol>,
    pub imports: Vec<Import>,
    pub references: Vec<Reference>,
    /// Names listed in `__all__`, when the module declares one.
    pub exports: Option<Vec<String>>,
    pub line_count: usize,
}

impl FileIndex {
    pub fn is_package_init(&self) -> bool {
        self.file.relative_path.file_stem().and_then(|s| s.to_str()) == Some("__init__")
    }

    /// Top-level definition bound to `name`.
    pub fn top_level(&self, name: &str) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|s| s.is_top_level() && s.name == name)
    }

    pub fn find_qualified(&self, qualified_name: &str) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|s| s.id.qualified_name == qualified_name)
    }
}

/// Dotted module name for a root-relative path: `pkg/mod.py` → `pkg.mod`,
/// `pkg/__init__.py` → `pkg`.
pub fn module_name_for(relative: &Path) -> String {
    let mut parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if let Some(last) = parts.last_mut() {
        if let Some(stem) = Path::new(last.as_str()).file_stem() {
            *last = stem.to_string_lossy().into_owned();
        }
    }
    if parts.len() > 1 && parts.last().map(String::as_str) == Some("__init__") {
        parts.pop();
    }
    parts.join(".")
}

pub struct SymbolIndexer {
    parser: Parser,
}

impl SymbolIndexer {
    pub fn new() -> Result<Self, ScanError> {
        let mut parser = Parser::new();
        let language: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
        parser.set_language(&language).map_err(|e| ScanError::Parse {
            path: PathBuf::from("<grammar>"),
            reason: format!("cannot load python grammar: {e}"),
        })?;
        Ok(Self { parser })
    }

    pub fn index_file(&mut self, file: &SourceFile) -> Result<FileIndex, ScanError> {
        if file.language != Language::Python {
            return Err(ScanError::parse(
                &file.relative_path,
                format!("unsupported language: {}", file.language),
            ));
        }

        let bytes = std::fs::read(&file.path).map_err(|e| ScanError::io(&file.relative_path, e))?;
        let source = String::from_utf8(bytes)
            .map_err(|e| ScanError::parse(&file.relative_path, format!("not valid UTF-8: {e}")))?;
        self.index_source(file, &source)
    }

    pub fn index_source(&mut self, file: &SourceFile, source: &str) -> Result<FileIndex, ScanError> {
        let tree = self
            .parser
            .parse(source, None)
            .ok_or_else(|| ScanError::parse(&file.relative_path, "parser produced no tree"))?;
        let root = tree.root_node();

        if root.has_error() {
            let line = first_error_line(root).unwrap_or(1);
            return Err(ScanError::parse(
                &file.relative_path,
                format!("syntax error near line {line}"),
            ));
        }

        let mut collector = Collector::new(source.as_bytes(), file);
        collector.collect(root, 0);

        let mut references = Vec::new();
        collector.resolve(root, 0, &mut references);

        Ok(collector.finish(references, source.lines().count()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Binding {
    Symbol(usize),
    /// Parameters, loop targets and similar: they shadow outer names but are not symbols.
    Local,
}

struct Scope {
    kind: ScopeKind,
    parent: Option<usize>,
    prefix: String,
    bindings: HashMap<String, Binding>,
    globals: HashSet<String>,
}

struct Collector<'s> {
    src: &'s [u8],
    file: &'s SourceFile,
    scopes: Vec<Scope>,
    scope_of: HashMap<usize, usize>,
    class_scope: HashMap<usize, usize>,
    symbols: Vec<Symbol>,
    symbol_ids: HashMap<SymbolId, usize>,
    imports: Vec<Import>,
    exports: Option<Vec<String>>,
    exports_line: usize,
}

const CONDITIONAL_BLOCKS: &[&str] = &[
    "try_statement",
    "if_statement",
    "except_clause",
    "except_group_clause",
    "else_clause",
    "elif_clause",
    "finally_clause",
];

const COMPREHENSIONS: &[&str] = &[
    "list_comprehension",
    "set_comprehension",
    "dictionary_comprehension",
    "generator_expression",
];

const STRING_ATTRIBUTE_BUILTINS: &[&str] = &["getattr", "setattr", "hasattr", "delattr"];
const NAMESPACE_BUILTINS: &[&str] = &["globals", "locals", "vars"];

impl<'s> Collector<'s> {
    fn new(src: &'s [u8], file: &'s SourceFile) -> Self {
        Self {
            src,
            file,
            scopes: vec![Scope {
                kind: ScopeKind::Module,
                parent: None,
                prefix: String::new(),
                bindings: HashMap::new(),
                globals: HashSet::new(),
            }],
            scope_of: HashMap::new(),
            class_scope: HashMap::new(),
            symbols: Vec::new(),
            symbol_ids: HashMap::new(),
            imports: Vec::new(),
            exports: None,
            exports_line: 0,
        }
    }

    fn text(&self, node: Node<'_>) -> &'s str {
        node.utf8_text(self.src).unwrap_or("")
    }

    // ---- pass 1: definitions -------------------------------------------

    fn collect(&mut self, node: Node<'_>, scope: usize) {
        match node.kind() {
            "function_definition" => self.collect_function(node, scope, false),
            "class_definition" => self.collect_class(node, scope, false),
            "decorated_definition" => {
                if let Some(def) = node.child_by_field_name("definition") {
                    match def.kind() {
                        "function_definition" => self.collect_function(def, scope, true),
                        "class_definition" => self.collect_class(def, scope, true),
                        _ => self.collect(def, scope),
                    }
                }
            }
            "import_statement" | "import_from_statement" => self.collect_import(node, scope),
            "future_import_statement" => {}
            "global_statement" => {
                for child in named_children(node) {
                    if child.kind() == "identifier" {
                        let name = self.text(child).to_string();
                        self.scopes[scope].globals.insert(name);
                    }
                }
            }
            "assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.bind_targets(left, scope);
                    if scope == 0 && self.text(left) == "__all__" {
                        self.exports_line = line_of(node);
                        let names = node
                            .child_by_field_name("right")
                            .map(|right| self.string_list(right))
                            .unwrap_or_default();
                        self.exports = Some(names);
                    }
                }
                if let Some(right) = node.child_by_field_name("right") {
                    self.collect(right, scope);
                }
            }
            "augmented_assignment" => {
                let left = node.child_by_field_name("left");
                if scope == 0 && left.map(|l| self.text(l)) == Some("__all__") {
                    if let Some(right) = node.child_by_field_name("right") {
                        let extra = self.string_list(right);
                        self.exports.get_or_insert_with(Vec::new).extend(extra);
                    }
                }
                if let Some(right) = node.child_by_field_name("right") {
                    self.collect(right, scope);
                }
            }
            "named_expression" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let text = self.text(name).to_string();
                    self.bind_symbol(scope, &text, SymbolKind::Variable, line_of(name), false, false);
                }
                if let Some(value) = node.child_by_field_name("value") {
                    self.collect(value, scope);
                }
            }
            "for_statement" => {
                let left = node.child_by_field_name("left");
                if let Some(left) = left {
                    self.bind_locals(left, scope);
                }
                for child in children(node) {
                    if Some(child) != left {
                        self.collect(child, scope);
                    }
                }
            }
            "lambda" => {
                let inner = self.push_scope(node, ScopeKind::Lambda, scope, None);
                if let Some(params) = node.child_by_field_name("parameters") {
                    self.bind_params(params, inner);
                }
                if let Some(body) = node.child_by_field_name("body") {
                    self.collect(body, inner);
                }
            }
            kind if COMPREHENSIONS.contains(&kind) => {
                let inner = self.push_scope(node, ScopeKind::Comprehension, scope, None);
                for child in children(node) {
                    if child.kind() == "for_in_clause" {
                        if let Some(left) = child.child_by_field_name("left") {
                            self.bind_locals(left, inner);
                        }
                    }
                    self.collect(child, inner);
                }
            }
            "as_pattern_target" => self.bind_locals(node, scope),
            "except_clause" | "except_group_clause" => {
                if let Some(alias) = self.except_alias(node) {
                    self.bind_locals(alias, scope);
                }
                for child in children(node) {
                    self.collect(child, scope);
                }
            }
            _ => {
                for child in children(node) {
                    self.collect(child, scope);
                }
            }
        }
    }

    fn collect_function(&mut self, node: Node<'_>, scope: usize, decorated: bool) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(name_node).to_string();
        self.bind_symbol(scope, &name, SymbolKind::Function, line_of(name_node), decorated, false);

        let prefix = self.qualify(scope, &name);
        let inner = self.push_scope(node, ScopeKind::Function, scope, Some(prefix));
        if let Some(params) = node.child_by_field_name("parameters") {
            self.bind_params(params, inner);
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.collect(body, inner);
        }
    }

    fn collect_class(&mut self, node: Node<'_>, scope: usize, decorated: bool) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(name_node).to_string();
        let symbol = self.bind_symbol(scope, &name, SymbolKind::Class, line_of(name_node), decorated, false);

        let prefix = self.qualify(scope, &name);
        let inner = self.push_scope(node, ScopeKind::Class, scope, Some(prefix));
        if let Some(symbol) = symbol {
            self.class_scope.insert(symbol, inner);
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.collect(body, inner);
        }
    }

    fn collect_import(&mut self, node: Node<'_>, scope: usize) {
        let conditional = is_conditional(node);
        let line = line_of(node);
        let mut entries = Vec::new();

        if node.kind() == "import_statement" {
            let mut cursor = node.walk();
            for name in node.children_by_field_name("name", &mut cursor) {
                let (module, alias) = self.import_name(name);
                entries.push(Import {
                    module,
                    name: None,
                    alias,
                    level: 0,
                    line,
                    conditional,
                    wildcard: false,
                });
            }
        } else {
            let (module, level) = match node.child_by_field_name("module_name") {
                Some(m) if m.kind() == "relative_import" => {
                    let mut level = 0;
                    let mut module = String::new();
                    for child in children(m) {
                        match child.kind() {
                            "import_prefix" => level = self.text(child).matches('.').count(),
                            "dotted_name" => module = self.text(child).to_string(),
                            _ => {}
                        }
                    }
                    (module, level)
                }
                Some(m) => (self.text(m).to_string(), 0),
                None => (String::new(), 0),
            };

            if children(node).iter().any(|c| c.kind() == "wildcard_import") {
                entries.push(Import {
                    module,
                    name: None,
                    alias: None,
                    level,
                    line,
                    conditional,
                    wildcard: true,
                });
            } else {
                let mut cursor = node.walk();
                let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
                for name in names {
                    let (member, alias) = self.import_name(name);
                    entries.push(Import {
                        module: module.clone(),
                        name: Some(member),
                        alias,
                        level,
                        line,
                        conditional,
                        wildcard: false,
                    });
                }
            }
        }

        for entry in entries {
            let index = self.imports.len();
            let binding = entry.binding().map(str::to_string);
            self.imports.push(entry);
            if let Some(binding) = binding {
                if let Some(symbol) =
                    self.bind_symbol(scope, &binding, SymbolKind::Import, line, false, conditional)
                {
                    self.symbols[symbol].import = Some(index);
                }
            }
        }
    }

    /// `(dotted name, alias)` of a `dotted_name` or `aliased_import` node.
    fn import_name(&self, node: Node<'_>) -> (String, Option<String>) {
        if node.kind() == "aliased_import" {
            let name = node
                .child_by_field_name("name")
                .map(|n| self.text(n).to_string())
                .unwrap_or_default();
            let alias = node.child_by_field_name("alias").map(|a| self.text(a).to_string());
            (name, alias)
        } else {
            (self.text(node).to_string(), None)
        }
    }

    fn bind_targets(&mut self, node: Node<'_>, scope: usize) {
        match node.kind() {
            "identifier" => {
                let name = self.text(node).to_string();
                self.bind_symbol(scope, &name, SymbolKind::Variable, line_of(node), false, false);
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "expression_list" | "parenthesized_expression" | "list_splat_pattern"
            | "list_splat" => {
                for child in named_children(node) {
                    self.bind_targets(child, scope);
                }
            }
            _ => {}
        }
    }

    fn bind_locals(&mut self, node: Node<'_>, scope: usize) {
        if node.kind() == "identifier" {
            let name = self.text(node).to_string();
            self.scopes[scope].bindings.entry(name).or_insert(Binding::Local);
            return;
        }
        if matches!(node.kind(), "attribute" | "subscript") {
            return;
        }
        for child in named_children(node) {
            self.bind_locals(child, scope);
        }
    }

    fn bind_params(&mut self, params: Node<'_>, scope: usize) {
        for param in named_children(params) {
            if let Some(name) = param_name(param) {
                let name = self.text(name).to_string();
                self.scopes[scope].bindings.insert(name, Binding::Local);
            }
        }
    }

    /// Bind `name` in `scope`. Returns the index of a newly created symbol, or
    /// `None` when the name was already bound (a rebinding is not a new definition).
    fn bind_symbol(
        &mut self,
        scope: usize,
        name: &str,
        kind: SymbolKind,
        line: usize,
        decorated: bool,
        conditional: bool,
    ) -> Option<usize> {
        let target = if kind != SymbolKind::Import && self.scopes[scope].globals.contains(name) {
            0
        } else {
            scope
        };
        if name.is_empty() || self.scopes[target].bindings.contains_key(name) {
            return None;
        }

        let id = SymbolId {
            file: self.file.relative_path.clone(),
            qualified_name: self.qualify(target, name),
            kind,
        };
        if let Some(&existing) = self.symbol_ids.get(&id) {
            self.scopes[target]
                .bindings
                .insert(name.to_string(), Binding::Symbol(existing));
            return None;
        }

        let index = self.symbols.len();
        self.symbols.push(Symbol {
            id: id.clone(),
            name: name.to_string(),
            line,
            scope: self.scopes[target].kind,
            is_private: name.starts_with('_') && !is_dunder(name),
            is_exported: false,
            decorated,
            conditional,
            import: None,
        });
        self.symbol_ids.insert(id, index);
        self.scopes[target]
            .bindings
            .insert(name.to_string(), Binding::Symbol(index));
        Some(index)
    }

    fn push_scope(&mut self, node: Node<'_>, kind: ScopeKind, parent: usize, prefix: Option<String>) -> usize {
        let index = self.scopes.len();
        self.scopes.push(Scope {
            kind,
            parent: Some(parent),
            prefix: prefix.unwrap_or_else(|| self.scopes[parent].prefix.clone()),
            bindings: HashMap::new(),
            globals: HashSet::new(),
        });
        self.scope_of.insert(node.id(), index);
        index
    }

    fn qualify(&self, scope: usize, name: &str) -> String {
        let prefix = &self.scopes[scope].prefix;
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    }

    fn except_alias<'t>(&self, node: Node<'t>) -> Option<Node<'t>> {
        if let Some(alias) = node.child_by_field_name("alias") {
            return Some(alias);
        }
        let mut after_as = false;
        for child in children(node) {
            if child.kind() == "as" {
                after_as = true;
            } else if after_as && child.kind() == "identifier" {
                return Some(child);
            }
        }
        None
    }

    fn string_list(&self, node: Node<'_>) -> Vec<String> {
        match node.kind() {
            "list" | "tuple" | "parenthesized_expression" => named_children(node)
                .into_iter()
                .filter_map(|child| string_value(self.text(child), child.kind()))
                .collect(),
            _ => Vec::new(),
        }
    }

    // ---- pass 2: references --------------------------------------------

    fn lookup(&self, scope: usize, name: &str) -> Option<Binding> {
        if let Some(binding) = self.scopes[scope].bindings.get(name) {
            return Some(*binding);
        }
        if self.scopes[scope].globals.contains(name) {
            return self.scopes[0].bindings.get(name).copied();
        }
        let mut current = self.scopes[scope].parent;
        while let Some(s) = current {
            if self.scopes[s].kind != ScopeKind::Class {
                if let Some(binding) = self.scopes[s].bindings.get(name) {
                    return Some(*binding);
                }
            }
            current = self.scopes[s].parent;
        }
        None
    }

    fn enclosing_class(&self, scope: usize) -> Option<usize> {
        let mut current = Some(scope);
        while let Some(s) = current {
            if self.scopes[s].kind == ScopeKind::Class {
                return Some(s);
            }
            current = self.scopes[s].parent;
        }
        None
    }

    fn reference(&self, target: Option<usize>, name: &str, line: usize, resolution: Resolution) -> Reference {
        Reference {
            target: target.map(|i| self.symbols[i].id.clone()),
            name: name.to_string(),
            access: None,
            site_file: self.file.relative_path.clone(),
            site_line: line,
            resolution,
        }
    }

    fn resolve(&self, node: Node<'_>, scope: usize, out: &mut Vec<Reference>) {
        match node.kind() {
            "identifier" => self.resolve_name(node, scope, out),
            "function_definition" => {
                if let Some(params) = node.child_by_field_name("parameters") {
                    self.resolve_params(params, scope, out);
                }
                if let Some(returns) = node.child_by_field_name("return_type") {
                    self.resolve(returns, scope, out);
                }
                let inner = self.scope_of.get(&node.id()).copied().unwrap_or(scope);
                if let Some(body) = node.child_by_field_name("body") {
                    self.resolve(body, inner, out);
                }
            }
            "class_definition" => {
                if let Some(bases) = node.child_by_field_name("superclasses") {
                    self.resolve(bases, scope, out);
                }
                let inner = self.scope_of.get(&node.id()).copied().unwrap_or(scope);
                if let Some(body) = node.child_by_field_name("body") {
                    self.resolve(body, inner, out);
                }
            }
            "lambda" => {
                if let Some(params) = node.child_by_field_name("parameters") {
                    self.resolve_params(params, scope, out);
                }
                let inner = self.scope_of.get(&node.id()).copied().unwrap_or(scope);
                if let Some(body) = node.child_by_field_name("body") {
                    self.resolve(body, inner, out);
                }
            }
            kind if COMPREHENSIONS.contains(&kind) => {
                let inner = self.scope_of.get(&node.id()).copied().unwrap_or(scope);
                for child in children(node) {
                    if child.kind() == "for_in_clause" {
                        for part in children(child) {
                            if Some(part) == child.child_by_field_name("left") {
                                self.resolve_store(part, inner, out);
                            } else {
                                self.resolve(part, inner, out);
                            }
                        }
                    } else {
                        self.resolve(child, inner, out);
                    }
                }
            }
            "import_statement" | "import_from_statement" | "future_import_statement"
            | "global_statement" | "nonlocal_statement" | "as_pattern_target" => {}
            "assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.resolve_store(left, scope, out);
                }
                if let Some(annotation) = node.child_by_field_name("type") {
                    self.resolve(annotation, scope, out);
                }
                if let Some(right) = node.child_by_field_name("right") {
                    self.resolve(right, scope, out);
                }
            }
            "named_expression" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.resolve(value, scope, out);
                }
            }
            "for_statement" => {
                let left = node.child_by_field_name("left");
                for child in children(node) {
                    if Some(child) == left {
                        self.resolve_store(child, scope, out);
                    } else {
                        self.resolve(child, scope, out);
                    }
                }
            }
            "keyword_argument" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.resolve(value, scope, out);
                }
            }
            "except_clause" | "except_group_clause" => {
                let alias = self.except_alias(node);
                for child in children(node) {
                    if Some(child) != alias {
                        self.resolve(child, scope, out);
                    }
                }
            }
            "attribute" => self.resolve_attribute(node, scope, out),
            "call" => {
                self.dynamic_attribute_call(node, scope, out);
                for child in children(node) {
                    self.resolve(child, scope, out);
                }
            }
            "subscript" => {
                self.dynamic_namespace_lookup(node, scope, out);
                for child in children(node) {
                    self.resolve(child, scope, out);
                }
            }
            _ => {
                for child in children(node) {
                    self.resolve(child, scope, out);
                }
            }
        }
    }

    fn resolve_name(&self, node: Node<'_>, scope: usize, out: &mut Vec<Reference>) {
        let name = self.text(node);
        match self.lookup(scope, name) {
            Some(Binding::Symbol(i)) => out.push(self.reference(Some(i), name, line_of(node), Resolution::Resolved)),
            Some(Binding::Local) => {}
            None => out.push(self.reference(None, name, line_of(node), Resolution::Unknown)),
        }
    }

    fn resolve_params(&self, params: Node<'_>, outer: usize, out: &mut Vec<Reference>) {
        for param in named_children(params) {
            for field in ["type", "value"] {
                if let Some(part) = param.child_by_field_name(field) {
                    self.resolve(part, outer, out);
                }
            }
        }
    }

    /// Assignment targets: bare names are stores, but the objects of attribute
    /// and subscript targets are reads.
    fn resolve_store(&self, node: Node<'_>, scope: usize, out: &mut Vec<Reference>) {
        match node.kind() {
            "identifier" => {}
            "attribute" => {
                if let Some(object) = node.child_by_field_name("object") {
                    self.resolve(object, scope, out);
                }
            }
            "subscript" => self.resolve(node, scope, out),
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "expression_list" | "parenthesized_expression" | "list_splat_pattern"
            | "list_splat" => {
                for child in named_children(node) {
                    self.resolve_store(child, scope, out);
                }
            }
            _ => self.resolve(node, scope, out),
        }
    }

    fn resolve_attribute(&self, node: Node<'_>, scope: usize, out: &mut Vec<Reference>) {
        let Some(attribute) = node.child_by_field_name("attribute") else {
            return;
        };
        let attr = self.text(attribute);
        let line = line_of(attribute);

        if let Some((root, path)) = self.attribute_chain(node) {
            if let Some(Binding::Symbol(i)) = self.lookup(scope, self.text(root)) {
                if let Some(import) = self.symbols[i].import {
                    out.push(self.reference(Some(i), self.text(root), line_of(root), Resolution::Resolved));
                    out.push(Reference {
                        access: Some(ImportAccess {
                            import,
                            attributes: path,
                        }),
                        ..self.reference(None, attr, line, Resolution::Unknown)
                    });
                    return;
                }
            }
        }

        let Some(object) = node.child_by_field_name("object") else {
            return;
        };

        if object.kind() == "identifier" {
            let object_name = self.text(object);
            let class_scope = match self.lookup(scope, object_name) {
                Some(Binding::Symbol(i)) if self.symbols[i].id.kind == SymbolKind::Class => {
                    out.push(self.reference(Some(i), object_name, line_of(object), Resolution::Resolved));
                    self.class_scope.get(&i).copied()
                }
                Some(Binding::Local) if object_name == "self" || object_name == "cls" => {
                    self.enclosing_class(scope)
                }
                Some(_) | None => {
                    self.resolve_name(object, scope, out);
                    None
                }
            };

            match class_scope.and_then(|c| self.scopes[c].bindings.get(attr)) {
                Some(Binding::Symbol(j)) => out.push(self.reference(Some(*j), attr, line, Resolution::Resolved)),
                _ => out.push(self.reference(None, attr, line, Resolution::DynamicUncertain)),
            }
            return;
        }

        self.resolve(object, scope, out);
        out.push(self.reference(None, attr, line, Resolution::DynamicUncertain));
    }

    /// For `a.b.c` returns the root identifier `a` and `["b", "c"]`.
    fn attribute_chain<'t>(&self, node: Node<'t>) -> Option<(Node<'t>, Vec<String>)> {
        let mut path = Vec::new();
        let mut current = node;
        loop {
            match current.kind() {
                "attribute" => {
                    path.push(self.text(current.child_by_field_name("attribute")?).to_string());
                    current = current.child_by_field_name("object")?;
                }
                "identifier" => {
                    path.reverse();
                    return Some((current, path));
                }
                _ => return None,
            }
        }
    }

    /// `getattr(obj, "name")` and friends.
    fn dynamic_attribute_call(&self, node: Node<'_>, scope: usize, out: &mut Vec<Reference>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        if function.kind() != "identifier" {
            return;
        }
        let name = self.text(function);
        if !STRING_ATTRIBUTE_BUILTINS.contains(&name) || self.lookup(scope, name).is_some() {
            return;
        }
        let Some(arguments) = node.child_by_field_name("arguments") else {
            return;
        };
        let literal = named_children(arguments)
            .into_iter()
            .filter(|a| a.kind() != "comment")
            .nth(1)
            .and_then(|a| string_value(self.text(a), a.kind()));
        if let Some(attr) = literal {
            out.push(self.reference(None, &attr, line_of(node), Resolution::DynamicUncertain));
        }
    }

    /// `globals()["name"]` and friends.
    fn dynamic_namespace_lookup(&self, node: Node<'_>, scope: usize, out: &mut Vec<Reference>) {
        let Some(value) = node.child_by_field_name("value") else {
            return;
        };
        let is_namespace_call = value.kind() == "call"
            && value
                .child_by_field_name("function")
                .map(|f| {
                    let name = self.text(f);
                    NAMESPACE_BUILTINS.contains(&name) && self.lookup(scope, name).is_none()
                })
                .unwrap_or(false);
        if !is_namespace_call {
            return;
        }
        if let Some(key) = node
            .child_by_field_name("subscript")
            .and_then(|s| string_value(self.text(s), s.kind()))
        {
            let target = match self.scopes[0].bindings.get(&key) {
                Some(Binding::Symbol(i)) => Some(*i),
                _ => None,
            };
            out.push(self.reference(target, &key, line_of(node), Resolution::DynamicUncertain));
        }
    }

    fn finish(mut self, mut references: Vec<Reference>, line_count: usize) -> FileIndex {
        let package_init = self.file.relative_path.file_stem().and_then(|s| s.to_str()) == Some("__init__");

        if let Some(exports) = self.exports.clone() {
            for name in &exports {
                let target = match self.scopes[0].bindings.get(name) {
                    Some(Binding::Symbol(i)) => {
                        self.symbols[*i].is_exported = true;
                        Some(*i)
                    }
                    _ => None,
                };
                references.push(self.reference(target, name, self.exports_line, Resolution::DynamicUncertain));
            }
        }

        for i in 0..self.symbols.len() {
            let symbol = &self.symbols[i];
            if symbol.id.kind != SymbolKind::Import {
                continue;
            }
            if package_init && symbol.is_top_level() && !symbol.is_private {
                self.symbols[i].is_exported = true;
            }
            if self.symbols[i].conditional {
                let line = self.symbols[i].line;
                let name = self.symbols[i].name.clone();
                references.push(self.reference(Some(i), &name, line, Resolution::DynamicUncertain));
            }
        }

        FileIndex {
            module_name: module_name_for(&self.file.relative_path),
            file: self.file.clone(),
            symbols: self.symbols,
            imports: self.imports,
            references,
            exports: self.exports,
            line_count,
        }
    }
}

fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

fn param_name(node: Node<'_>) -> Option<Node<'_>> {
    match node.kind() {
        "identifier" => Some(node),
        "default_parameter" | "typed_default_parameter" => node.child_by_field_name("name"),
        "typed_parameter" | "list_splat_pattern" | "dictionary_splat_pattern" => {
            named_children(node).into_iter().next().and_then(param_name)
        }
        _ => None,
    }
}

fn is_conditional(node: Node<'_>) -> bool {
    let mut current = node.parent();
    while let Some(parent) = current {
        match parent.kind() {
            "function_definition" | "class_definition" => return false,
            kind if CONDITIONAL_BLOCKS.contains(&kind) => return true,
            _ => current = parent.parent(),
        }
    }
    false
}

fn first_error_line(node: Node<'_>) -> Option<usize> {
    if node.is_error() || node.is_missing() {
        return Some(line_of(node));
    }
    children(node)
        .into_iter()
        .filter(|c| c.has_error())
        .find_map(first_error_line)
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Value of a plain string literal (`'x'`, `"x"`, `r"x"`); `None` for
/// anything else.
fn string_value(text: &str, kind: &str) -> Option<String> {
    if kind != "string" {
        return None;
    }
    let body = text.trim_start_matches(|c: char| "rRbBuU".contains(c));
    if body.starts_with(['f', 'F']) {
        return None;
    }
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if body.len() >= 2 * quote.len() && body.starts_with(quote) && body.ends_with(quote) {
            return Some(body[quote.len()..body.len() - quote.len()].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_file(rel: &str) -> SourceFile {
        SourceFile {
            path: PathBuf::from("/project").join(rel),
            relative_path: PathBuf::from(rel),
            size: 1,
            language: Language::Python,
            is_test: false,
        }
    }

    fn index(rel: &str, source: &str) -> FileIndex {
        SymbolIndexer::new()
            .unwrap()
            .index_source(&source_file(rel), source)
            .unwrap()
    }

    fn resolved_to<'a>(index: &'a FileIndex, qualified: &str) -> Vec<&'a Reference> {
        index
            .references
            .iter()
            .filter(|r| r.resolution == Resolution::Resolved)
            .filter(|r| r.target.as_ref().map(|t| t.qualified_name.as_str()) == Some(qualified))
            .collect()
    }

    #[test]
    fn qualifies_nested_definitions() {
        let idx = index(
            "pkg/shapes.py",
            "class Circle:\n    radius = 1\n    def area(self):\n        def helper():\n            return 3\n        return helper()\n",
        );
        let names: Vec<_> = idx.symbols.iter().map(|s| s.id.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["Circle", "Circle.radius", "Circle.area", "Circle.area.helper"]);
        assert_eq!(idx.module_name, "pkg.shapes");
        assert_eq!(resolved_to(&idx, "Circle.area.helper").len(), 1);
    }

    #[test]
    fn resolves_module_level_calls_and_forward_references() {
        let idx = index(
            "util.py",
            "def main():\n    return helper(1)\n\ndef helper(x):\n    return x\n",
        );
        let refs = resolved_to(&idx, "helper");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].site_line, 2);
        assert!(resolved_to(&idx, "main").is_empty());
    }

    #[test]
    fn parameters_shadow_module_names() {
        let idx = index("a.py", "value = 1\n\ndef f(value):\n    return value\n");
        assert!(resolved_to(&idx, "value").is_empty());
    }

    #[test]
    fn self_attribute_resolves_against_class_body() {
        let idx = index(
            "auth.py",
            "class Auth:\n    def login(self, t):\n        return self._check(t) and self.missing()\n    def _check(self, t):\n        return bool(t)\n",
        );
        assert_eq!(resolved_to(&idx, "Auth._check").len(), 1);
        assert!(idx
            .references
            .iter()
            .any(|r| r.name == "missing" && r.resolution == Resolution::DynamicUncertain));
    }

    #[test]
    fn conditional_import_fallback_is_dynamic_and_not_rebound() {
        let idx = index(
            "plugins.py",
            "try:\n    import optional_lib\nexcept ImportError:\n    optional_lib = None\n",
        );
        assert_eq!(idx.symbols.len(), 1);
        let symbol = &idx.symbols[0];
        assert_eq!(symbol.id.kind, SymbolKind::Import);
        assert!(symbol.conditional);
        assert!(idx.references.iter().any(|r| {
            r.resolution == Resolution::DynamicUncertain && r.target.as_ref() == Some(&symbol.id)
        }));
    }

    #[test]
    fn string_based_access_is_dynamic() {
        let idx = index(
            "registry.py",
            "def handler():\n    pass\n\ndef run(obj):\n    getattr(obj, 'handler')()\n    return globals()[\"handler\"]\n",
        );
        let dynamic: Vec<_> = idx
            .references
            .iter()
            .filter(|r| r.name == "handler" && r.resolution == Resolution::DynamicUncertain)
            .collect();
        assert_eq!(dynamic.len(), 2);
        assert!(resolved_to(&idx, "handler").is_empty());
    }

    #[test]
    fn all_list_marks_exports() {
        let idx = index("api.py", "__all__ = ['public_fn']\n\ndef public_fn():\n    pass\n\ndef other():\n    pass\n");
        assert_eq!(idx.exports, Some(vec!["public_fn".to_string()]));
        let public_fn = idx.top_level("public_fn").unwrap();
        assert!(public_fn.is_exported);
        assert!(!idx.top_level("other").unwrap().is_exported);
    }

    #[test]
    fn records_imports_and_qualified_access() {
        let idx = index(
            "app/main.py",
            "import os.path\nimport pkg.tools as tools\nfrom ..core import engine as eng\nfrom . import *\n\ntools.run(eng.start())\n",
        );
        assert_eq!(idx.imports.len(), 4);
        assert_eq!(idx.imports[0].binding(), Some("os"));
        assert_eq!(idx.imports[1].bound_path(), "pkg.tools");
        assert_eq!(idx.imports[2].level, 2);
        assert_eq!(idx.imports[2].bound_path(), "core.engine");
        assert!(idx.imports[3].wildcard);

        let run = idx.references.iter().find(|r| r.name == "run").unwrap();
        assert_eq!(run.access.as_ref().map(|a| a.import), Some(1));
        assert_eq!(resolved_to(&idx, "tools").len(), 1);
    }

    #[test]
    fn package_init_imports_are_exports() {
        let idx = index("pkg/__init__.py", "from .core import Engine\n");
        assert_eq!(idx.module_name, "pkg");
        assert!(idx.top_level("Engine").unwrap().is_exported);
    }

    #[test]
    fn malformed_source_is_a_parse_error() {
        let err = SymbolIndexer::new()
            .unwrap()
            .index_source(&source_file("bad.py"), "def broken(:\n    pass\n")
            .unwrap_err();
        assert!(matches!(err, ScanError::Parse { .. }));
    }

    #[test]
    fn module_names() {
        assert_eq!(module_name_for(Path::new("a/b/c.py")), "a.b.c");
        assert_eq!(module_name_for(Path::new("a/__init__.py")), "a");
        assert_eq!(module_name_for(Path::new("top.py")), "top");
    }
}
