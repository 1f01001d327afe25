//! Edge derivation for one file against the symbol table of the whole
//! ingestion scope.
//!
//! A reference the analyzer resolved to a node in scope becomes a
//! `semantic` edge. A reference it could not resolve (or every reference,
//! when hydration degraded) is resolved by name and kept as a `heuristic`
//! edge only when the policy allows it. References the analyzer resolved to
//! something outside the scope produce no edge.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::indexer::hydration::HydrationOutcome;
use crate::indexer::symbols::{bare_name, FileExtraction};
use crate::models::{Edge, EdgeKind, InterfaceNode, NodeId, NodeKind, Provenance};

pub const SEMANTIC_WEIGHT: f64 = 1.0;
pub const HEURISTIC_WEIGHT: f64 = 0.5;
/// Weight of the single edge kept when a name matches several candidates
/// in other files. The edge goes to the candidate with the lowest id.
pub const AMBIGUOUS_WEIGHT: f64 = 0.25;

#[derive(Clone, Debug)]
pub struct SymbolEntry {
    pub id: NodeId,
    pub name: String,
    pub symbol: String,
    pub kind: NodeKind,
    pub file_path: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
}

impl SymbolEntry {
    fn from_node(node: &InterfaceNode) -> Self {
        Self {
            id: node.id.clone(),
            name: bare_name(&node.symbol),
            symbol: node.symbol.clone(),
            kind: node.kind,
            file_path: node.file_path.clone(),
            start_line: node.span.start_line,
            end_line: node.span.end_line,
        }
    }
}

/// Addressable nodes of the ingestion scope, indexed by bare name and by
/// file.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
    by_name: HashMap<String, Vec<usize>>,
    by_file: HashMap<String, Vec<usize>>,
}

impl SymbolTable {
    /// Stored L1 nodes, with every file in `batch` replaced by its fresh
    /// extraction.
    pub fn build<'a>(
        stored: impl IntoIterator<Item = InterfaceNode>,
        batch: impl IntoIterator<Item = &'a FileExtraction>,
    ) -> Self {
        let batch: Vec<&FileExtraction> = batch.into_iter().collect();
        let fresh: BTreeSet<&str> = batch.iter().map(|e| e.file_path.as_str()).collect();
        let mut table = Self::default();
        for node in stored {
            if node.is_addressable() && !fresh.contains(node.file_path.as_str()) {
                table.push(SymbolEntry::from_node(&node));
            }
        }
        for extraction in batch {
            let ids = extraction.node_ids();
            for (item, id) in extraction.items.iter().zip(ids) {
                if item.owner.is_some() {
                    continue;
                }
                table.push(SymbolEntry {
                    id,
                    name: item.name.clone(),
                    symbol: item.symbol.clone(),
                    kind: item.kind,
                    file_path: extraction.file_path.clone(),
                    start_line: item.span.start_line,
                    end_line: item.span.end_line,
                });
            }
        }
        table
    }

    fn push(&mut self, entry: SymbolEntry) {
        let index = self.entries.len();
        if entry.kind != NodeKind::Impl {
            self.by_name.entry(entry.name.clone()).or_default().push(index);
        }
        self.by_file
            .entry(entry.file_path.clone())
            .or_default()
            .push(index);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Innermost node of `file_path` whose span covers the zero-based
    /// `line`.
    pub fn node_at(&self, file_path: &str, line: u32) -> Option<&SymbolEntry> {
        let line = line as usize + 1;
        self.by_file
            .get(file_path)?
            .iter()
            .map(|&i| &self.entries[i])
            .filter(|e| e.start_line <= line && line <= e.end_line)
            .min_by(|a, b| {
                (a.end_line - a.start_line, &a.id).cmp(&(b.end_line - b.start_line, &b.id))
            })
    }

    /// Resolve a bare name. Candidates narrowed by `qualifier` (the path
    /// or type before the name) win; then ones in `from_file`; then a
    /// unique global match. Returns the entry and whether the choice was
    /// ambiguous.
    pub fn resolve_name(
        &self,
        name: &str,
        qualifier: Option<&str>,
        from_file: &str,
        accept: impl Fn(NodeKind) -> bool,
    ) -> Option<(&SymbolEntry, bool)> {
        let mut candidates: Vec<&SymbolEntry> = self
            .by_name
            .get(name)?
            .iter()
            .map(|&i| &self.entries[i])
            .filter(|e| accept(e.kind))
            .collect();
        if let Some(qualifier) = qualifier {
            let suffix = format!("{}::{name}", bare_name(qualifier));
            let narrowed: Vec<&SymbolEntry> = candidates
                .iter()
                .copied()
                .filter(|e| e.symbol == suffix || e.symbol.ends_with(&format!("::{suffix}")))
                .collect();
            if !narrowed.is_empty() {
                candidates = narrowed;
            }
        }
        let local: Vec<&SymbolEntry> = candidates
            .iter()
            .copied()
            .filter(|e| e.file_path == from_file)
            .collect();
        let pool = if local.is_empty() { candidates } else { local };
        let ambiguous = pool.len() > 1;
        pool.into_iter()
            .min_by(|a, b| a.id.cmp(&b.id))
            .map(|e| (e, ambiguous))
    }
}

/// Positions worth asking the analyzer about: every call, type, trait and
/// imported-name reference in the file.
pub fn reference_positions(extraction: &FileExtraction) -> Vec<(u32, u32)> {
    let imports = extraction.import_map();
    let mut positions = BTreeSet::new();
    for item in &extraction.items {
        for call in &item.calls {
            positions.insert((call.line, call.column));
        }
        for reference in item
            .type_refs
            .iter()
            .chain(item.implemented_trait.iter())
            .chain(item.bound_trait.iter())
        {
            positions.insert((reference.line, reference.column));
        }
        for reference in &item.referenced {
            if imports.contains_key(reference.name.as_str()) {
                positions.insert((reference.line, reference.column));
            }
        }
    }
    positions.into_iter().collect()
}

/// Inputs shared by every reference resolved in one file.
pub struct EdgeContext<'a> {
    pub table: &'a SymbolTable,
    pub hydration: Option<&'a HydrationOutcome>,
    pub keep_heuristic_edges: bool,
}

impl EdgeContext<'_> {
    fn resolve(
        &self,
        name: &str,
        position: (u32, u32),
        qualifier: Option<&str>,
        from_file: &str,
        accept: impl Fn(NodeKind) -> bool,
    ) -> Option<(NodeId, Provenance, f64)> {
        if let Some(answer) = self.hydration.and_then(|h| h.definitions.get(&position)) {
            if let Some(definition) = answer {
                return self
                    .table
                    .node_at(&definition.file_path, definition.range.start_line)
                    .map(|e| (e.id.clone(), Provenance::Semantic, SEMANTIC_WEIGHT));
            }
        }
        if !self.keep_heuristic_edges {
            return None;
        }
        self.table
            .resolve_name(name, qualifier, from_file, accept)
            .map(|(entry, ambiguous)| {
                let weight = if ambiguous {
                    AMBIGUOUS_WEIGHT
                } else {
                    HEURISTIC_WEIGHT
                };
                (entry.id.clone(), Provenance::Heuristic, weight)
            })
    }
}

#[derive(Default)]
struct EdgeSet {
    edges: BTreeMap<(NodeId, NodeId, EdgeKind), (Provenance, f64)>,
}

impl EdgeSet {
    /// Keeps the strongest derivation of each `(source, target, kind)`.
    fn add(&mut self, source: &NodeId, resolved: Option<(NodeId, Provenance, f64)>, kind: EdgeKind) {
        let Some((target, provenance, weight)) = resolved else {
            return;
        };
        if &target == source {
            return;
        }
        let slot = self
            .edges
            .entry((source.clone(), target, kind))
            .or_insert((provenance, weight));
        if (provenance, weight) > (slot.0, slot.1) {
            *slot = (provenance, weight);
        }
    }

    fn into_edges(self, file_path: &str) -> Vec<Edge> {
        self.edges
            .into_iter()
            .map(|((source, target, kind), (provenance, weight))| Edge {
                source,
                target,
                kind,
                provenance,
                weight,
                file_path: file_path.to_string(),
            })
            .collect()
    }
}

fn is_call_target(kind: NodeKind) -> bool {
    kind.is_callable() && kind != NodeKind::Macro
}

fn is_macro(kind: NodeKind) -> bool {
    kind == NodeKind::Macro
}

fn is_trait(kind: NodeKind) -> bool {
    kind == NodeKind::Trait
}

fn any_kind(_kind: NodeKind) -> bool {
    true
}

/// Derive every edge sourced in `extraction`. Sources are L1 items; bound
/// facets contribute `REQUIRES_BOUND` edges from their L1 root.
pub fn derive_edges(extraction: &FileExtraction, ctx: &EdgeContext<'_>) -> Vec<Edge> {
    let ids = extraction.node_ids();
    let imports = extraction.import_map();
    let file = extraction.file_path.as_str();
    let mut set = EdgeSet::default();

    for (index, item) in extraction.items.iter().enumerate() {
        if item.owner.is_some() {
            if let Some(bound) = &item.bound_trait {
                let source = &ids[extraction.root_of(index)];
                let resolved = ctx.resolve(&bound.name, (bound.line, bound.column), None, file, is_trait);
                set.add(source, resolved, EdgeKind::RequiresBound);
            }
            continue;
        }
        let source = &ids[index];
        let enclosing_type = item.symbol.rsplit_once("::").map(|(head, _)| head);

        for call in &item.calls {
            let qualifier = match call.qualifier.as_deref() {
                Some("self") | Some("Self") => enclosing_type,
                Some(q) if !call.is_method => Some(q),
                _ => None,
            };
            let accept: fn(NodeKind) -> bool = if call.is_macro { is_macro } else { is_call_target };
            let resolved = ctx.resolve(&call.name, (call.line, call.column), qualifier, file, accept);
            set.add(source, resolved, EdgeKind::Calls);
        }

        if let Some(implemented) = &item.implemented_trait {
            let resolved = ctx.resolve(
                &implemented.name,
                (implemented.line, implemented.column),
                None,
                file,
                is_trait,
            );
            set.add(source, resolved, EdgeKind::Implements);
        }

        for reference in &item.type_refs {
            if reference.name == "Self" {
                continue;
            }
            let resolved = ctx.resolve(
                &reference.name,
                (reference.line, reference.column),
                None,
                file,
                NodeKind::is_type_like,
            );
            set.add(source, resolved, EdgeKind::Uses);
        }

        for reference in &item.referenced {
            let Some(path) = imports.get(reference.name.as_str()) else {
                continue;
            };
            let target_name = bare_name(path);
            let qualifier = path.rsplit_once("::").map(|(head, _)| head);
            let resolved = ctx.resolve(
                &target_name,
                (reference.line, reference.column),
                qualifier,
                file,
                any_kind,
            );
            set.add(source, resolved, EdgeKind::Depends);
        }

        for feature in &item.cfg_features {
            set.add(
                source,
                Some((NodeId::cfg_feature(feature), Provenance::Semantic, SEMANTIC_WEIGHT)),
                EdgeKind::FeatureGatedBy,
            );
        }
    }
    set.into_edges(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::hydration::Definition;
    use crate::indexer::symbols::extract_file;
    use crate::models::SourceRange;

    const LIB: &str = r#"use crate::util::helper as assist;

pub trait Render {
    fn render(&self) -> String;
}

pub struct Page {
    pub title: Title,
}

pub struct Title;

impl Render for Page {
    fn render(&self) -> String {
        assist();
        self.layout();
        format!("{}", 1)
    }
}

impl Page {
    fn layout(&self) {}
}

#[cfg(feature = "fancy")]
pub fn show<T: Render>(item: T) {
    item.render();
    unknown_fn();
}
"#;

    const UTIL: &str = "pub fn helper() {}\n";

    fn setup() -> (FileExtraction, FileExtraction) {
        (
            extract_file("src/lib.rs", LIB).unwrap(),
            extract_file("src/util.rs", UTIL).unwrap(),
        )
    }

    fn id(file: &str, symbol: &str, kind: NodeKind) -> NodeId {
        crate::models::NodeKey::new(file, symbol, kind, 0).id()
    }

    fn has(edges: &[Edge], source: &NodeId, target: &NodeId, kind: EdgeKind) -> Option<Provenance> {
        edges
            .iter()
            .find(|e| &e.source == source && &e.target == target && e.kind == kind)
            .map(|e| e.provenance)
    }

    #[test]
    fn test_heuristic_edges_without_hydration() {
        let (lib, util) = setup();
        let table = SymbolTable::build(Vec::new(), [&lib, &util]);
        let ctx = EdgeContext {
            table: &table,
            hydration: None,
            keep_heuristic_edges: true,
        };
        let edges = derive_edges(&lib, &ctx);

        let render_impl = id("src/lib.rs", "<Page as Render>", NodeKind::Impl);
        let render_method = id("src/lib.rs", "Page::render", NodeKind::Method);
        let layout = id("src/lib.rs", "Page::layout", NodeKind::Method);
        let show = id("src/lib.rs", "show", NodeKind::Function);
        let helper = id("src/util.rs", "helper", NodeKind::Function);
        let trait_id = id("src/lib.rs", "Render", NodeKind::Trait);
        let page = id("src/lib.rs", "Page", NodeKind::Struct);
        let title = id("src/lib.rs", "Title", NodeKind::Struct);

        assert_eq!(
            has(&edges, &render_impl, &trait_id, EdgeKind::Implements),
            Some(Provenance::Heuristic)
        );
        assert!(has(&edges, &render_method, &layout, EdgeKind::Calls).is_some());
        assert!(has(&edges, &render_method, &helper, EdgeKind::Depends).is_some());
        assert!(has(&edges, &page, &title, EdgeKind::Uses).is_some());
        assert!(has(&edges, &show, &trait_id, EdgeKind::RequiresBound).is_some());
        assert_eq!(
            has(&edges, &show, &NodeId::cfg_feature("fancy"), EdgeKind::FeatureGatedBy),
            Some(Provenance::Semantic)
        );
        assert!(edges.iter().all(|e| e.source != e.target));
        assert!(!edges
            .iter()
            .any(|e| e.target.as_str().contains("unknown_fn")));
    }

    #[test]
    fn test_policy_drops_heuristic_edges() {
        let (lib, util) = setup();
        let table = SymbolTable::build(Vec::new(), [&lib, &util]);
        let ctx = EdgeContext {
            table: &table,
            hydration: None,
            keep_heuristic_edges: false,
        };
        let edges = derive_edges(&lib, &ctx);
        assert!(edges.iter().all(|e| e.kind == EdgeKind::FeatureGatedBy));
    }

    #[test]
    fn test_semantic_resolution_wins_and_external_targets_drop() {
        let (lib, util) = setup();
        let table = SymbolTable::build(Vec::new(), [&lib, &util]);
        let show_item = lib.items.iter().find(|i| i.symbol == "show").unwrap();
        let render_call = show_item.calls.iter().find(|c| c.name == "render").unwrap();
        let unknown_call = show_item.calls.iter().find(|c| c.name == "unknown_fn").unwrap();

        let mut hydration = HydrationOutcome::default();
        // render() resolves to the trait method declaration (line 4, 1-based).
        hydration.definitions.insert(
            (render_call.line, render_call.column),
            Some(Definition {
                file_path: "src/lib.rs".to_string(),
                range: SourceRange::point(3, 7),
            }),
        );
        // unknown_fn() resolves outside the scope.
        hydration.definitions.insert(
            (unknown_call.line, unknown_call.column),
            Some(Definition {
                file_path: "/rustlib/core.rs".to_string(),
                range: SourceRange::point(0, 0),
            }),
        );
        let ctx = EdgeContext {
            table: &table,
            hydration: Some(&hydration),
            keep_heuristic_edges: true,
        };
        let edges = derive_edges(&lib, &ctx);
        let show = id("src/lib.rs", "show", NodeKind::Function);
        let trait_method = id("src/lib.rs", "Render::render", NodeKind::TraitItem);
        assert_eq!(
            has(&edges, &show, &trait_method, EdgeKind::Calls),
            Some(Provenance::Semantic)
        );
        let calls_from_show: Vec<&Edge> = edges
            .iter()
            .filter(|e| e.source == show && e.kind == EdgeKind::Calls)
            .collect();
        assert_eq!(calls_from_show.len(), 1);
    }

    #[test]
    fn test_stored_nodes_are_replaced_by_batch() {
        let (lib, util) = setup();
        let stale = InterfaceNode {
            id: id("src/util.rs", "old_helper", NodeKind::Function),
            file_path: "src/util.rs".to_string(),
            module_path: "util".to_string(),
            symbol: "old_helper".to_string(),
            kind: NodeKind::Function,
            level: crate::models::NestingLevel::L1,
            owner: None,
            signature: "pub fn old_helper()".to_string(),
            exact_signature: None,
            hydrated_signature: None,
            confidence: 0.7,
            content_hash: String::new(),
            parse_error_count: 0,
            span: crate::models::Span::default(),
        };
        let table = SymbolTable::build(vec![stale], [&lib, &util]);
        assert!(table.resolve_name("old_helper", None, "src/lib.rs", any_kind).is_none());
        assert!(table.resolve_name("helper", None, "src/lib.rs", any_kind).is_some());
        let (entry, ambiguous) = table
            .resolve_name("render", None, "src/lib.rs", is_call_target)
            .unwrap();
        assert!(!ambiguous || entry.file_path == "src/lib.rs");
    }

    #[test]
    fn test_ambiguous_name_keeps_one_weak_edge() {
        let first = extract_file("src/a.rs", "pub fn helper() {}\n").unwrap();
        let second = extract_file("src/b.rs", "pub fn helper() {}\n").unwrap();
        let caller = extract_file("src/main.rs", "pub fn run() {\n    helper();\n}\n").unwrap();
        let table = SymbolTable::build(Vec::new(), [&first, &second, &caller]);
        let ctx = EdgeContext {
            table: &table,
            hydration: None,
            keep_heuristic_edges: true,
        };
        let edges = derive_edges(&caller, &ctx);
        let run = id("src/main.rs", "run", NodeKind::Function);
        let calls: Vec<&Edge> = edges
            .iter()
            .filter(|e| e.source == run && e.kind == EdgeKind::Calls)
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target, id("src/a.rs", "helper", NodeKind::Function));
        assert_eq!(calls[0].provenance, Provenance::Heuristic);
        assert_eq!(calls[0].weight, AMBIGUOUS_WEIGHT);
    }

    #[test]
    fn test_node_at_picks_innermost() {
        let (lib, util) = setup();
        let table = SymbolTable::build(Vec::new(), [&lib, &util]);
        // Line 22 (1-based) is `fn layout`, inside `impl Page`.
        let entry = table.node_at("src/lib.rs", 21).unwrap();
        assert_eq!(entry.symbol, "Page::layout");
        assert!(table.node_at("src/missing.rs", 0).is_none());
    }

    #[test]
    fn test_reference_positions_cover_calls_and_imports() {
        let (lib, _) = setup();
        let positions = reference_positions(&lib);
        let show_item = lib.items.iter().find(|i| i.symbol == "show").unwrap();
        for call in &show_item.calls {
            assert!(positions.contains(&(call.line, call.column)));
        }
        assert!(!positions.is_empty());
    }
}
