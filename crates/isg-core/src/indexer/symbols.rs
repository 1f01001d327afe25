//! Structural extraction of interfaces from a tolerant parse.
//!
//! Walks the tree-sitter tree of one Rust file and produces addressable L1
//! items (functions, methods, traits, impls, types, consts, macros, inline
//! modules) with their L2/L3 facets, call sites, referenced names, `use`
//! bindings and `#[cfg(feature)]` gates. Items swallowed by an `ERROR`
//! region are salvaged with a lexical scan.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use tree_sitter::Node;

use crate::errors::IsgResult;
use crate::indexer::filesystem::module_path_for;
use crate::indexer::parser::{parse_rust, MalformedRegion, ParsedFile};
use crate::indexer::signature;
use crate::models::{BlobClass, NodeId, NodeKey, NodeKind, Span};

// ---------------------------------------------------------------------------
// Extracted types
// ---------------------------------------------------------------------------

/// A call or macro invocation inside an item body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSite {
    /// Last path segment of the callee.
    pub name: String,
    /// Path or receiver text before the callee, if any.
    pub qualifier: Option<String>,
    pub is_method: bool,
    pub is_macro: bool,
    /// Zero-based position of the callee name token.
    pub line: u32,
    pub column: u32,
}

/// A name mentioned by an item, at its first position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub line: u32,
    pub column: u32,
}

impl Reference {
    fn at(name: impl Into<String>, node: Node<'_>) -> Self {
        let pos = node.start_position();
        Self {
            name: name.into(),
            line: pos.row as u32,
            column: pos.column as u32,
        }
    }
}

/// One extracted interface. Facets point at their owner by index.
#[derive(Clone, Debug)]
pub struct ExtractedItem {
    pub symbol: String,
    /// Bare name used for resolution (last segment of `symbol`).
    pub name: String,
    pub kind: NodeKind,
    pub module_path: String,
    pub owner: Option<usize>,
    /// Raw signature text before normalisation.
    pub header: String,
    pub signature: String,
    pub exact_signature: Option<String>,
    pub span: Span,
    /// Zero-based position of the name token.
    pub name_line: u32,
    pub name_column: u32,
    pub code: String,
    pub classification: BlobClass,
    pub recovered: bool,
    pub salvaged: bool,
    pub cfg_features: Vec<String>,
    pub calls: Vec<CallSite>,
    /// Types named in the signature (fields included for data types).
    pub type_refs: Vec<Reference>,
    /// Every identifier the item mentions, body included.
    pub referenced: Vec<Reference>,
    /// For impls: the implemented trait.
    pub implemented_trait: Option<Reference>,
    /// For impls: the self type's bare name.
    pub self_type: Option<String>,
    /// For bound facets: the required trait.
    pub bound_trait: Option<Reference>,
    pub disambiguator: u32,
}

/// A name brought into scope by a `use` declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportBinding {
    pub name: String,
    pub path: String,
}

/// Output of the tolerant (and, for clean files, exact) pass.
#[derive(Clone, Debug)]
pub struct FileExtraction {
    pub file_path: String,
    pub module_path: String,
    pub items: Vec<ExtractedItem>,
    pub imports: Vec<ImportBinding>,
    pub regions: Vec<MalformedRegion>,
    pub parse_error_count: u32,
}

impl FileExtraction {
    pub fn is_clean(&self) -> bool {
        self.parse_error_count == 0
    }

    /// Node ids of `items`, index for index.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.items
            .iter()
            .map(|item| {
                NodeKey::new(&self.file_path, &item.symbol, item.kind, item.disambiguator).id()
            })
            .collect()
    }

    /// Index of the L1 item an item hangs under (itself for L1 items).
    pub fn root_of(&self, mut index: usize) -> usize {
        while let Some(owner) = self.items[index].owner {
            index = owner;
        }
        index
    }

    pub fn import_map(&self) -> HashMap<&str, &str> {
        self.imports
            .iter()
            .map(|i| (i.name.as_str(), i.path.as_str()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Compiled regex patterns
// ---------------------------------------------------------------------------

static TEST_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\[\s*(?:[A-Za-z_][A-Za-z0-9_]*::)*test\s*(?:\]|\()").unwrap()
});

static CFG_TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\[\s*cfg\s*\(\s*test\s*\)\s*\]").unwrap());

static FEATURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"feature\s*=\s*"([^"]+)""#).unwrap());

static SALVAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*(?:pub(?:\s*\([^)]*\))?\s+)?(?:(?:async|const|unsafe|extern(?:\s+"[^"]*")?)\s+)*(fn|struct|enum|trait|union|type|mod|static|const)\s+([A-Za-z_][A-Za-z0-9_]*)"#,
    )
    .unwrap()
});

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// Collapse all whitespace runs into single spaces.
fn compact(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Bare name of a type or trait path: `std::fmt::Display<T>` -> `Display`.
pub fn bare_name(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('?').trim_start_matches('&');
    let trimmed = trimmed.trim_start_matches("dyn ").trim_start_matches("impl ");
    let head = trimmed.split('<').next().unwrap_or(trimmed);
    let head = head.split('(').next().unwrap_or(head);
    head.rsplit("::").next().unwrap_or(head).trim().to_string()
}

fn line_of(source: &str, byte: usize) -> usize {
    source.as_bytes()[..byte.min(source.len())]
        .iter()
        .filter(|b| **b == b'\n')
        .count()
}

fn is_doc_comment(raw: &str) -> bool {
    (raw.starts_with("///") && !raw.starts_with("////"))
        || (raw.starts_with("/**") && !raw.starts_with("/***"))
}

/// Whether `file_path` lies under a `tests` directory.
pub fn test_path(file_path: &str) -> bool {
    file_path.split('/').any(|segment| segment == "tests")
}

fn cfg_features(attrs: &[String]) -> Vec<String> {
    let mut features = Vec::new();
    for attr in attrs.iter().filter(|a| a.contains("cfg")) {
        for cap in FEATURE_RE.captures_iter(attr) {
            features.push(cap[1].to_string());
        }
    }
    features
}

/// Expand a `use` tree into the names it binds.
fn expand_use_tree(prefix: &str, tree: &str, out: &mut Vec<ImportBinding>) {
    let tree = tree.trim();
    if tree.is_empty() || tree.ends_with('*') {
        return;
    }
    if let Some(open) = tree.find('{') {
        let head = tree[..open].trim_end_matches("::").trim();
        let rest = tree[open + 1..].trim_end();
        let inner = rest.strip_suffix('}').unwrap_or(rest);
        let next_prefix = join_path(prefix, head);
        let mut depth = 0usize;
        let mut start = 0usize;
        for (idx, ch) in inner.char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    expand_use_tree(&next_prefix, &inner[start..idx], out);
                    start = idx + 1;
                }
                _ => {}
            }
        }
        expand_use_tree(&next_prefix, &inner[start..], out);
        return;
    }
    let (path, alias) = match tree.split_once(" as ") {
        Some((path, alias)) => (path.trim(), Some(alias.trim())),
        None => (tree, None),
    };
    if path == "self" {
        let name = alias.unwrap_or_else(|| prefix.rsplit("::").next().unwrap_or(prefix));
        if !name.is_empty() && name != "_" {
            out.push(ImportBinding {
                name: name.to_string(),
                path: prefix.to_string(),
            });
        }
        return;
    }
    let full = join_path(prefix, path);
    let name = alias.unwrap_or_else(|| path.rsplit("::").next().unwrap_or(path));
    if !name.is_empty() && name != "_" {
        out.push(ImportBinding {
            name: name.to_string(),
            path: full,
        });
    }
}

fn join_path(prefix: &str, tail: &str) -> String {
    match (prefix.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}::{tail}"),
    }
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Scope {
    symbol_prefix: String,
    module_path: String,
    in_test: bool,
    features: Vec<String>,
}

#[derive(Clone)]
enum Container {
    Module,
    Impl { owner: usize, type_name: String },
    Trait { owner: usize, name: String },
}

/// Attributes and doc comments collected ahead of an item.
#[derive(Default)]
struct Leading {
    start: Option<(usize, usize)>,
    attrs: Vec<String>,
}

impl Leading {
    fn push(&mut self, node: Node<'_>, source: &str, is_attr: bool) {
        if self.start.is_none() {
            self.start = Some((node.start_byte(), node.start_position().row));
        }
        if is_attr {
            self.attrs.push(compact(text(node, source)));
        }
    }
}

struct Walker<'a> {
    source: &'a str,
    file_is_test: bool,
    items: Vec<ExtractedItem>,
    imports: Vec<ImportBinding>,
}

impl<'a> Walker<'a> {
    fn walk_container(&mut self, container: Node<'_>, scope: &Scope, ctx: &Container) {
        let mut leading = Leading::default();
        let mut cursor = container.walk();
        let children: Vec<Node<'_>> = container.named_children(&mut cursor).collect();
        for child in children {
            match child.kind() {
                "attribute_item" => leading.push(child, self.source, true),
                "line_comment" | "block_comment" => {
                    if is_doc_comment(text(child, self.source)) {
                        leading.push(child, self.source, false);
                    }
                }
                "inner_attribute_item" => {}
                "use_declaration" => {
                    if let Some(arg) = child.child_by_field_name("argument") {
                        let raw = compact(text(arg, self.source));
                        expand_use_tree("", &raw, &mut self.imports);
                    }
                    leading = Leading::default();
                }
                "ERROR" => {
                    self.walk_container(child, scope, ctx);
                    leading = Leading::default();
                }
                _ => {
                    self.visit_item(child, &leading, scope, ctx);
                    leading = Leading::default();
                }
            }
        }
    }

    fn visit_item(&mut self, node: Node<'_>, leading: &Leading, scope: &Scope, ctx: &Container) {
        let Some(name_node) = node.child_by_field_name("name") else {
            if node.kind() == "impl_item" {
                self.visit_impl(node, leading, scope);
            }
            return;
        };
        let name = text(name_node, self.source).to_string();
        if name.is_empty() {
            return;
        }
        let kind = match (node.kind(), ctx) {
            ("function_item", Container::Module) => NodeKind::Function,
            ("function_item", Container::Impl { .. }) => NodeKind::Method,
            ("function_item", Container::Trait { .. }) => NodeKind::TraitItem,
            ("function_signature_item", Container::Trait { .. }) => NodeKind::TraitItem,
            ("function_signature_item", _) => NodeKind::Function,
            ("struct_item", _) => NodeKind::Struct,
            ("enum_item", _) => NodeKind::Enum,
            ("union_item", _) => NodeKind::Union,
            ("type_item", Container::Module) => NodeKind::TypeAlias,
            ("type_item", _) | ("associated_type", _) => NodeKind::AssociatedType,
            ("const_item", Container::Module) => NodeKind::Const,
            ("const_item", _) => NodeKind::AssociatedConst,
            ("static_item", _) => NodeKind::Static,
            ("trait_item", _) => NodeKind::Trait,
            ("mod_item", _) => NodeKind::Module,
            ("macro_definition", _) => NodeKind::Macro,
            _ => return,
        };

        let symbol = match ctx {
            Container::Module => format!("{}{}", scope.symbol_prefix, name),
            Container::Impl { type_name, .. } => format!("{type_name}::{name}"),
            Container::Trait { name: trait_name, .. } => format!("{trait_name}::{name}"),
        };
        let owner = match (kind.level(), ctx) {
            (crate::models::NestingLevel::L1, _) => None,
            (_, Container::Impl { owner, .. }) | (_, Container::Trait { owner, .. }) => {
                Some(*owner)
            }
            (_, Container::Module) => return,
        };

        let idx = self.push_item(node, leading, scope, kind, symbol.clone(), name, owner);

        match kind {
            NodeKind::Function | NodeKind::Method | NodeKind::TraitItem => {
                if let Some(body) = node.child_by_field_name("body") {
                    let mut calls = Vec::new();
                    collect_calls(body, self.source, &mut calls);
                    self.items[idx].calls = calls;
                }
                self.push_bounds(node, idx);
            }
            NodeKind::Struct | NodeKind::Union => {
                self.push_fields(node, idx);
                self.push_bounds(node, idx);
            }
            NodeKind::Enum => {
                self.push_variants(node, idx);
                self.push_bounds(node, idx);
            }
            NodeKind::TypeAlias => self.push_bounds(node, idx),
            NodeKind::Trait => {
                self.push_bounds(node, idx);
                if let Some(body) = node.child_by_field_name("body") {
                    let inner = Container::Trait {
                        owner: idx,
                        name: symbol,
                    };
                    let member_scope = self.item_scope(scope, idx);
                    self.walk_container(body, &member_scope, &inner);
                }
            }
            NodeKind::Module => {
                if let Some(body) = node.child_by_field_name("body") {
                    let item = &self.items[idx];
                    let nested = Scope {
                        symbol_prefix: format!("{}::", item.symbol),
                        module_path: join_path(&scope.module_path, &item.name),
                        in_test: item.classification == BlobClass::Test,
                        features: item.cfg_features.clone(),
                    };
                    self.walk_container(body, &nested, &Container::Module);
                }
            }
            _ => {}
        }
    }

    fn visit_impl(&mut self, node: Node<'_>, leading: &Leading, scope: &Scope) {
        let Some(type_node) = node.child_by_field_name("type") else {
            return;
        };
        let type_text = compact(text(type_node, self.source)).replace(' ', "");
        let trait_node = node.child_by_field_name("trait");
        let trait_text = trait_node.map(|t| compact(text(t, self.source)).replace(' ', ""));
        let symbol = match &trait_text {
            Some(trait_text) => format!("{}<{type_text} as {trait_text}>", scope.symbol_prefix),
            None => format!("{}{type_text}", scope.symbol_prefix),
        };
        let self_type = bare_name(&type_text);
        let idx = self.push_item(
            node,
            leading,
            scope,
            NodeKind::Impl,
            symbol,
            self_type.clone(),
            None,
        );
        self.items[idx].implemented_trait = trait_node
            .zip(trait_text.as_deref())
            .map(|(t, raw)| Reference::at(bare_name(raw), name_token(t)));
        self.items[idx].self_type = Some(self_type.clone());
        self.push_bounds(node, idx);
        if let Some(body) = node.child_by_field_name("body") {
            let inner = Container::Impl {
                owner: idx,
                type_name: format!("{}{}", scope.symbol_prefix, self_type),
            };
            let member_scope = self.item_scope(scope, idx);
            self.walk_container(body, &member_scope, &inner);
        }
    }

    /// Scope for the members of a trait or impl: they inherit its gates.
    fn item_scope(&self, scope: &Scope, idx: usize) -> Scope {
        let item = &self.items[idx];
        Scope {
            symbol_prefix: scope.symbol_prefix.clone(),
            module_path: scope.module_path.clone(),
            in_test: item.classification == BlobClass::Test,
            features: item.cfg_features.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_item(
        &mut self,
        node: Node<'_>,
        leading: &Leading,
        scope: &Scope,
        kind: NodeKind,
        symbol: String,
        name: String,
        owner: Option<usize>,
    ) -> usize {
        let (start_byte, start_row) = leading
            .start
            .unwrap_or((node.start_byte(), node.start_position().row));
        let span = Span {
            start_byte,
            end_byte: node.end_byte(),
            start_line: start_row + 1,
            end_line: node.end_position().row + 1,
        };
        let header = header_text(node, self.source);
        let is_test = scope.in_test
            || self.file_is_test
            || leading
                .attrs
                .iter()
                .any(|a| TEST_ATTR_RE.is_match(a) || CFG_TEST_RE.is_match(a));
        let mut features = scope.features.clone();
        for feature in cfg_features(&leading.attrs) {
            if !features.contains(&feature) {
                features.push(feature);
            }
        }
        let name_pos = node
            .child_by_field_name("name")
            .or_else(|| node.child_by_field_name("type"))
            .map(|n| n.start_position())
            .unwrap_or_else(|| node.start_position());

        let (type_refs, referenced) = collect_references(node, self.source, kind);
        self.items.push(ExtractedItem {
            symbol,
            name,
            kind,
            module_path: scope.module_path.clone(),
            owner,
            signature: signature::tolerant_signature(&header),
            header,
            exact_signature: None,
            span,
            name_line: name_pos.row as u32,
            name_column: name_pos.column as u32,
            code: self.source[span.start_byte..span.end_byte].to_string(),
            classification: if is_test {
                BlobClass::Test
            } else {
                BlobClass::Implementation
            },
            recovered: false,
            salvaged: false,
            cfg_features: features,
            calls: Vec::new(),
            type_refs,
            referenced,
            implemented_trait: None,
            self_type: None,
            bound_trait: None,
            disambiguator: 0,
        });
        self.items.len() - 1
    }

    fn push_facet(
        &mut self,
        node: Node<'_>,
        owner: usize,
        kind: NodeKind,
        symbol: String,
        name: String,
        bound_trait: Option<Reference>,
    ) {
        let owner_item = &self.items[owner];
        let raw = text(node, self.source);
        let pos = node.start_position();
        let facet = ExtractedItem {
            symbol,
            name,
            kind,
            module_path: owner_item.module_path.clone(),
            owner: Some(owner),
            header: raw.to_string(),
            signature: compact(raw.trim_end_matches(',')),
            exact_signature: None,
            span: Span {
                start_byte: node.start_byte(),
                end_byte: node.end_byte(),
                start_line: pos.row + 1,
                end_line: node.end_position().row + 1,
            },
            name_line: pos.row as u32,
            name_column: pos.column as u32,
            code: raw.to_string(),
            classification: owner_item.classification,
            recovered: false,
            salvaged: false,
            cfg_features: owner_item.cfg_features.clone(),
            calls: Vec::new(),
            type_refs: Vec::new(),
            referenced: Vec::new(),
            implemented_trait: None,
            self_type: None,
            bound_trait,
            disambiguator: 0,
        };
        self.items.push(facet);
    }

    fn push_fields(&mut self, node: Node<'_>, owner: usize) {
        let Some(body) = node.child_by_field_name("body") else {
            return;
        };
        let owner_symbol = self.items[owner].symbol.clone();
        let mut cursor = body.walk();
        let children: Vec<Node<'_>> = body.named_children(&mut cursor).collect();
        match body.kind() {
            "field_declaration_list" => {
                for field in children.into_iter().filter(|c| c.kind() == "field_declaration") {
                    let Some(name_node) = field.child_by_field_name("name") else {
                        continue;
                    };
                    let name = text(name_node, self.source).to_string();
                    self.push_facet(
                        field,
                        owner,
                        NodeKind::Field,
                        format!("{owner_symbol}::{name}"),
                        name,
                        None,
                    );
                }
            }
            "ordered_field_declaration_list" => {
                let positional = children.into_iter().filter(|c| {
                    !matches!(
                        c.kind(),
                        "attribute_item" | "visibility_modifier" | "line_comment" | "block_comment"
                    )
                });
                for (position, field) in positional.enumerate() {
                    self.push_facet(
                        field,
                        owner,
                        NodeKind::Field,
                        format!("{owner_symbol}::{position}"),
                        position.to_string(),
                        None,
                    );
                }
            }
            _ => {}
        }
    }

    fn push_variants(&mut self, node: Node<'_>, owner: usize) {
        let Some(body) = node.child_by_field_name("body") else {
            return;
        };
        let owner_symbol = self.items[owner].symbol.clone();
        let mut cursor = body.walk();
        let variants: Vec<Node<'_>> = body
            .named_children(&mut cursor)
            .filter(|c| c.kind() == "enum_variant")
            .collect();
        for variant in variants {
            let Some(name_node) = variant.child_by_field_name("name") else {
                continue;
            };
            let name = text(name_node, self.source).to_string();
            self.push_facet(
                variant,
                owner,
                NodeKind::Variant,
                format!("{owner_symbol}::{name}"),
                name,
                None,
            );
        }
    }

    /// L3 facets for generic bounds, where-clause predicates and supertraits.
    fn push_bounds(&mut self, node: Node<'_>, owner: usize) {
        let owner_symbol = self.items[owner].symbol.clone();
        let mut found: Vec<(Node<'_>, String, String, Node<'_>)> = Vec::new();

        if let Some(params) = node.child_by_field_name("type_parameters") {
            let mut cursor = params.walk();
            for param in params.named_children(&mut cursor) {
                if !matches!(param.kind(), "type_parameter" | "constrained_type_parameter") {
                    continue;
                }
                let Some(bounds) = param.child_by_field_name("bounds") else {
                    continue;
                };
                let subject = param
                    .child_by_field_name("name")
                    .or_else(|| param.child_by_field_name("left"))
                    .map(|n| text(n, self.source).to_string())
                    .unwrap_or_default();
                for (bound, token) in bound_names(bounds, self.source) {
                    found.push((param, subject.clone(), bound, token));
                }
            }
        }

        if node.kind() == "trait_item" {
            if let Some(bounds) = node.child_by_field_name("bounds") {
                for (bound, token) in bound_names(bounds, self.source) {
                    found.push((bounds, "Self".to_string(), bound, token));
                }
            }
        }

        let mut cursor = node.walk();
        let where_clauses: Vec<Node<'_>> = node
            .named_children(&mut cursor)
            .filter(|c| c.kind() == "where_clause")
            .collect();
        for clause in where_clauses {
            let mut inner = clause.walk();
            for predicate in clause.named_children(&mut inner) {
                if predicate.kind() != "where_predicate" {
                    continue;
                }
                let Some(bounds) = predicate.child_by_field_name("bounds") else {
                    continue;
                };
                let subject = predicate
                    .child_by_field_name("left")
                    .map(|n| compact(text(n, self.source)))
                    .unwrap_or_default();
                for (bound, token) in bound_names(bounds, self.source) {
                    found.push((predicate, subject.clone(), bound, token));
                }
            }
        }

        for (facet_node, subject, bound, token) in found {
            let trait_name = bare_name(&bound);
            self.push_facet(
                facet_node,
                owner,
                NodeKind::Bound,
                format!("{owner_symbol}<{subject}: {bound}>"),
                trait_name.clone(),
                Some(Reference::at(trait_name, token)),
            );
        }
    }
}

/// Text of an item up to its body: the part that forms its signature.
fn header_text(node: Node<'_>, source: &str) -> String {
    let start = node.start_byte();
    let cut = match node.kind() {
        "const_item" | "static_item" => node.child_by_field_name("value").map(|v| v.start_byte()),
        "macro_definition" => node
            .child_by_field_name("name")
            .map(|n| n.end_byte()),
        _ => node.child_by_field_name("body").map(|b| {
            // Tuple structs keep their field list in the signature.
            if b.kind() == "ordered_field_declaration_list" {
                b.end_byte()
            } else {
                b.start_byte()
            }
        }),
    };
    let end = cut.unwrap_or_else(|| node.end_byte()).max(start);
    let raw = &source[start..end];
    raw.trim_end()
        .trim_end_matches(';')
        .trim_end_matches('=')
        .trim_end()
        .to_string()
}

/// The token naming a type or trait path: `a::B<C>` -> `B`.
fn name_token(node: Node<'_>) -> Node<'_> {
    match node.kind() {
        "type_identifier" | "identifier" => node,
        "scoped_type_identifier" | "scoped_identifier" => {
            node.child_by_field_name("name").unwrap_or(node)
        }
        "generic_type" => node
            .child_by_field_name("type")
            .map(name_token)
            .unwrap_or(node),
        _ => {
            let mut cursor = node.walk();
            let first = node.named_children(&mut cursor).find(|c| {
                matches!(
                    c.kind(),
                    "type_identifier" | "scoped_type_identifier" | "generic_type"
                )
            });
            first.map(name_token).unwrap_or(node)
        }
    }
}

/// Trait bounds named by a `trait_bounds` node with their name tokens,
/// lifetimes excluded.
fn bound_names<'t>(bounds: Node<'t>, source: &str) -> Vec<(String, Node<'t>)> {
    let mut names = Vec::new();
    let mut cursor = bounds.walk();
    for bound in bounds.named_children(&mut cursor) {
        if bound.kind() == "lifetime" {
            continue;
        }
        let raw = compact(text(bound, source));
        let raw = raw.trim_start_matches('?');
        let raw = match raw.strip_prefix("for<") {
            Some(rest) => rest.split_once('>').map(|(_, t)| t.trim()).unwrap_or(rest),
            None => raw,
        };
        if !raw.is_empty() {
            names.push((raw.to_string(), name_token(bound)));
        }
    }
    names
}

fn collect_calls(node: Node<'_>, source: &str, out: &mut Vec<CallSite>) {
    match node.kind() {
        "call_expression" => {
            if let Some(function) = node.child_by_field_name("function") {
                if let Some(site) = call_site(function, source) {
                    out.push(site);
                }
            }
        }
        "macro_invocation" => {
            if let Some(mac) = node.child_by_field_name("macro") {
                let (name_node, qualifier) = match mac.kind() {
                    "scoped_identifier" => (
                        mac.child_by_field_name("name").unwrap_or(mac),
                        mac.child_by_field_name("path")
                            .map(|p| text(p, source).to_string()),
                    ),
                    _ => (mac, None),
                };
                let pos = name_node.start_position();
                out.push(CallSite {
                    name: text(name_node, source).to_string(),
                    qualifier,
                    is_method: false,
                    is_macro: true,
                    line: pos.row as u32,
                    column: pos.column as u32,
                });
            }
        }
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_calls(child, source, out);
    }
}

fn call_site(function: Node<'_>, source: &str) -> Option<CallSite> {
    let (name_node, qualifier, is_method) = match function.kind() {
        "identifier" => (function, None, false),
        "scoped_identifier" => (
            function.child_by_field_name("name")?,
            function
                .child_by_field_name("path")
                .map(|p| compact(text(p, source))),
            false,
        ),
        "field_expression" => (
            function.child_by_field_name("field")?,
            function
                .child_by_field_name("value")
                .map(|v| compact(text(v, source))),
            true,
        ),
        "generic_function" => return call_site(function.child_by_field_name("function")?, source),
        _ => return None,
    };
    let name = text(name_node, source).to_string();
    if name.is_empty() {
        return None;
    }
    let pos = name_node.start_position();
    Some(CallSite {
        name,
        qualifier,
        is_method,
        is_macro: false,
        line: pos.row as u32,
        column: pos.column as u32,
    })
}

fn keep_first(map: &mut BTreeMap<String, (u32, u32)>, name: &str, at: Node<'_>) {
    let pos = at.start_position();
    let pos = (pos.row as u32, pos.column as u32);
    map.entry(name.to_string())
        .and_modify(|seen| *seen = (*seen).min(pos))
        .or_insert(pos);
}

/// Type identifiers in the item's signature and every identifier the item
/// mentions. Nested member bodies (impl, trait and module contents) belong
/// to the members and are skipped.
fn collect_references(
    node: Node<'_>,
    source: &str,
    kind: NodeKind,
) -> (Vec<Reference>, Vec<Reference>) {
    let skip_body = matches!(kind, NodeKind::Impl | NodeKind::Trait | NodeKind::Module);
    let body_id = node.child_by_field_name("body").map(|b| b.id());
    let signature_only_body = matches!(
        kind,
        NodeKind::Function | NodeKind::Method | NodeKind::TraitItem
    );

    let mut type_refs: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    let mut referenced: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    let mut stack = vec![(node, false)];
    while let Some((current, in_body)) = stack.pop() {
        if Some(current.id()) == body_id && skip_body {
            continue;
        }
        let in_body = in_body || (Some(current.id()) == body_id && signature_only_body);
        match current.kind() {
            "type_identifier" => {
                let name = text(current, source);
                if !in_body {
                    keep_first(&mut type_refs, name, current);
                }
                keep_first(&mut referenced, name, current);
            }
            "identifier" => keep_first(&mut referenced, text(current, source), current),
            _ => {}
        }
        let mut cursor = current.walk();
        for child in current.named_children(&mut cursor) {
            stack.push((child, in_body));
        }
    }
    let into_refs = |map: BTreeMap<String, (u32, u32)>| {
        map.into_iter()
            .map(|(name, (line, column))| Reference { name, line, column })
            .collect::<Vec<_>>()
    };
    (into_refs(type_refs), into_refs(referenced))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run the tolerant pass over `source`, then the exact pass when the file
/// parsed without errors.
pub fn extract_file(file_path: &str, source: &str) -> IsgResult<FileExtraction> {
    let parsed = parse_rust(source)?;
    Ok(extract_from_parsed(file_path, source, &parsed))
}

pub fn extract_from_parsed(file_path: &str, source: &str, parsed: &ParsedFile) -> FileExtraction {
    let module_path = module_path_for(file_path);
    let mut walker = Walker {
        source,
        file_is_test: test_path(file_path),
        items: Vec::new(),
        imports: Vec::new(),
    };
    let scope = Scope {
        symbol_prefix: String::new(),
        module_path: module_path.clone(),
        in_test: false,
        features: Vec::new(),
    };
    walker.walk_container(parsed.tree.root_node(), &scope, &Container::Module);

    let mut items = walker.items;
    salvage_error_regions(source, &parsed.regions, &module_path, walker.file_is_test, &mut items);

    for item in items.iter_mut() {
        item.recovered = item.salvaged || parsed.touches_malformed(&item.span);
    }
    if parsed.is_clean() {
        for item in items.iter_mut() {
            item.exact_signature = Some(signature::exact_signature(&item.header));
        }
    }
    assign_disambiguators(&mut items);

    FileExtraction {
        file_path: file_path.to_string(),
        module_path,
        items,
        imports: walker.imports,
        regions: parsed.regions.clone(),
        parse_error_count: parsed.error_count(),
    }
}

/// Lexical fallback: item headers inside `ERROR` regions that the tree walk
/// did not recover.
fn salvage_error_regions(
    source: &str,
    regions: &[MalformedRegion],
    module_path: &str,
    file_is_test: bool,
    items: &mut Vec<ExtractedItem>,
) {
    for region in regions.iter().filter(|r| !r.missing) {
        let region_text = &source[region.start_byte..region.end_byte];
        let matches: Vec<_> = SALVAGE_RE.captures_iter(region_text).collect();
        for (i, cap) in matches.iter().enumerate() {
            let (Some(whole), Some(keyword), Some(name_match)) =
                (cap.get(0), cap.get(1), cap.get(2))
            else {
                continue;
            };
            let kind = match keyword.as_str() {
                "fn" => NodeKind::Function,
                "struct" => NodeKind::Struct,
                "enum" => NodeKind::Enum,
                "trait" => NodeKind::Trait,
                "union" => NodeKind::Union,
                "type" => NodeKind::TypeAlias,
                "mod" => NodeKind::Module,
                "static" => NodeKind::Static,
                _ => NodeKind::Const,
            };
            let indent = whole.as_str().len() - whole.as_str().trim_start().len();
            let start = region.start_byte + whole.start() + indent;
            let end = matches
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map(|next| region.start_byte + next.start())
                .unwrap_or(region.end_byte);
            let name = name_match.as_str().to_string();
            let already = items.iter().any(|item| {
                item.name == name && item.span.overlaps(region.start_byte, region.end_byte)
            });
            if already || end <= start {
                continue;
            }
            let code = source[start..end].trim_end().to_string();
            let end = start + code.len();
            let first_line = code.lines().next().unwrap_or_default();
            let header = first_line.trim_end().trim_end_matches('{').trim_end().to_string();
            let line = line_of(source, start);
            let name_offset = region.start_byte + name_match.start();
            let line_start = source[..name_offset].rfind('\n').map(|p| p + 1).unwrap_or(0);
            let name_column = name_offset - line_start;
            items.push(ExtractedItem {
                symbol: name.clone(),
                name,
                kind,
                module_path: module_path.to_string(),
                owner: None,
                signature: signature::tolerant_signature(&header),
                header,
                exact_signature: None,
                span: Span {
                    start_byte: start,
                    end_byte: end,
                    start_line: line + 1,
                    end_line: line_of(source, end) + 1,
                },
                name_line: line_of(source, name_offset) as u32,
                name_column: name_column as u32,
                code,
                classification: if file_is_test {
                    BlobClass::Test
                } else {
                    BlobClass::Implementation
                },
                recovered: true,
                salvaged: true,
                cfg_features: Vec::new(),
                calls: Vec::new(),
                type_refs: Vec::new(),
                referenced: Vec::new(),
                implemented_trait: None,
                self_type: None,
                bound_trait: None,
                disambiguator: 0,
            });
        }
    }
}

/// Ordinal of each `(symbol, kind)` pair in document order.
fn assign_disambiguators(items: &mut [ExtractedItem]) {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by_key(|&i| (items[i].span.start_byte, i));
    let mut seen: HashMap<(String, NodeKind), u32> = HashMap::new();
    for i in order {
        let counter = seen
            .entry((items[i].symbol.clone(), items[i].kind))
            .or_insert(0);
        items[i].disambiguator = *counter;
        *counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(extraction: &'a FileExtraction, symbol: &str, kind: NodeKind) -> &'a ExtractedItem {
        extraction
            .items
            .iter()
            .find(|i| i.symbol == symbol && i.kind == kind)
            .unwrap_or_else(|| panic!("missing {symbol} ({kind})"))
    }

    const CLEAN: &str = r#"
use std::fmt::{self, Display};
use crate::store::Database as Db;

/// A parser.
#[derive(Debug)]
pub struct Parser<T: Display> {
    pub input: String,
    state: T,
}

pub enum Token { Ident, Number(u64) }

pub trait Visit: Clone {
    type Output;
    fn visit(&self) -> Self::Output;
}

impl<T: Display> Parser<T> {
    pub fn parse(&self) -> Token {
        helper(1);
        self.advance();
        println!("x");
        Token::Ident
    }
    fn advance(&self) {}
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { Ok(()) }
}

fn helper(x: u32) -> u32 where u32: Copy { x }

#[cfg(feature = "serde")]
pub const LIMIT: usize = 4;

macro_rules! shout { () => {} }

mod inner {
    pub fn nested() {}
}

#[cfg(test)]
mod tests {
    #[test]
    fn it_works() {}
}
"#;

    #[test]
    fn test_extracts_top_level_items() {
        let ex = extract_file("src/parser.rs", CLEAN).unwrap();
        assert!(ex.is_clean());
        assert_eq!(ex.module_path, "parser");
        let parser = find(&ex, "Parser", NodeKind::Struct);
        assert!(parser.code.starts_with("/// A parser."));
        assert!(parser.code.contains("#[derive(Debug)]"));
        assert_eq!(parser.signature, "pub struct Parser<T: Display>");
        assert!(parser.exact_signature.is_some());
        assert!(!parser.recovered);

        find(&ex, "Token", NodeKind::Enum);
        find(&ex, "Visit", NodeKind::Trait);
        find(&ex, "Visit::visit", NodeKind::TraitItem);
        find(&ex, "Parser<T>", NodeKind::Impl);
        find(&ex, "Parser::parse", NodeKind::Method);
        find(&ex, "<Token as Display>", NodeKind::Impl);
        find(&ex, "Token::fmt", NodeKind::Method);
        find(&ex, "helper", NodeKind::Function);
        find(&ex, "shout", NodeKind::Macro);
        find(&ex, "inner", NodeKind::Module);
        let nested = find(&ex, "inner::nested", NodeKind::Function);
        assert_eq!(nested.module_path, "parser::inner");
    }

    #[test]
    fn test_facets_have_owners() {
        let ex = extract_file("src/parser.rs", CLEAN).unwrap();
        let field = find(&ex, "Parser::input", NodeKind::Field);
        let owner = field.owner.unwrap();
        assert_eq!(ex.items[owner].symbol, "Parser");
        find(&ex, "Token::Number", NodeKind::Variant);
        let assoc = find(&ex, "Visit::Output", NodeKind::AssociatedType);
        assert_eq!(ex.items[assoc.owner.unwrap()].kind, NodeKind::Trait);

        let bound = find(&ex, "Parser<T: Display>", NodeKind::Bound);
        assert_eq!(bound.bound_trait.as_ref().map(|r| r.name.as_str()), Some("Display"));
        find(&ex, "Visit<Self: Clone>", NodeKind::Bound);
        find(&ex, "helper<u32: Copy>", NodeKind::Bound);
        assert!(ex
            .items
            .iter()
            .filter(|i| i.kind.level() != crate::models::NestingLevel::L1)
            .all(|i| i.owner.is_some()));
    }

    #[test]
    fn test_calls_imports_and_gates() {
        let ex = extract_file("src/parser.rs", CLEAN).unwrap();
        let parse = find(&ex, "Parser::parse", NodeKind::Method);
        let names: Vec<&str> = parse.calls.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"helper"));
        assert!(names.contains(&"advance"));
        assert!(parse.calls.iter().any(|c| c.name == "println" && c.is_macro));
        assert!(parse.type_refs.iter().any(|r| r.name == "Token"));

        let impl_item = find(&ex, "<Token as Display>", NodeKind::Impl);
        let implemented = impl_item.implemented_trait.as_ref().unwrap();
        assert_eq!(implemented.name, "Display");
        assert_eq!(impl_item.self_type.as_deref(), Some("Token"));

        let map = ex.import_map();
        assert_eq!(map.get("Display"), Some(&"std::fmt::Display"));
        assert_eq!(map.get("fmt"), Some(&"std::fmt"));
        assert_eq!(map.get("Db"), Some(&"crate::store::Database"));

        let limit = find(&ex, "LIMIT", NodeKind::Const);
        assert_eq!(limit.cfg_features, vec!["serde".to_string()]);
        assert_eq!(limit.signature, "pub const LIMIT: usize");
    }

    #[test]
    fn test_test_classification() {
        let ex = extract_file("src/parser.rs", CLEAN).unwrap();
        assert_eq!(find(&ex, "tests", NodeKind::Module).classification, BlobClass::Test);
        assert_eq!(find(&ex, "tests::it_works", NodeKind::Function).classification, BlobClass::Test);
        assert_eq!(find(&ex, "helper", NodeKind::Function).classification, BlobClass::Implementation);

        let in_tests_dir = extract_file("tests/it.rs", "fn check() {}").unwrap();
        assert_eq!(in_tests_dir.items[0].classification, BlobClass::Test);
    }

    #[test]
    fn test_disambiguators_follow_document_order() {
        let src = "struct A;\nimpl A { fn f(&self) {} }\nimpl A { fn g(&self) {} }\n";
        let ex = extract_file("src/a.rs", src).unwrap();
        let impls: Vec<_> = ex.items.iter().filter(|i| i.kind == NodeKind::Impl).collect();
        assert_eq!(impls.len(), 2);
        assert_eq!(impls[0].disambiguator, 0);
        assert_eq!(impls[1].disambiguator, 1);
        assert!(impls[0].span.start_byte < impls[1].span.start_byte);
    }

    #[test]
    fn test_broken_file_marks_recovered_and_keeps_clean_items() {
        let src = "fn good() -> u32 { 1 }\n\nfn broken(x: u32 {\n    x +\n}\n\nstruct After { a: u8 }\n";
        let ex = extract_file("src/b.rs", src).unwrap();
        assert!(!ex.is_clean());
        assert!(ex.items.iter().all(|i| i.exact_signature.is_none()));
        let good = find(&ex, "good", NodeKind::Function);
        assert!(!good.recovered);
        let broken = ex
            .items
            .iter()
            .find(|i| i.name == "broken")
            .expect("broken fn is extracted or salvaged");
        assert!(broken.recovered);
    }

    #[test]
    fn test_expand_use_tree() {
        let mut out = Vec::new();
        expand_use_tree("", "a::{b::{C, D as E}, self, f}", &mut out);
        let pairs: Vec<(String, String)> = out.into_iter().map(|b| (b.name, b.path)).collect();
        assert_eq!(
            pairs,
            vec![
                ("C".to_string(), "a::b::C".to_string()),
                ("E".to_string(), "a::b::D".to_string()),
                ("a".to_string(), "a".to_string()),
                ("f".to_string(), "a::f".to_string()),
            ]
        );
    }

    #[test]
    fn test_bare_name() {
        assert_eq!(bare_name("std::fmt::Display"), "Display");
        assert_eq!(bare_name("?Sized"), "Sized");
        assert_eq!(bare_name("Iterator<Item = u8>"), "Iterator");
        assert_eq!(bare_name("Fn(u8) -> u8"), "Fn");
    }
}
