//! Shared typed models used across indexing, storage, retrieval and mutation.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// String-backed enums
// ---------------------------------------------------------------------------

/// Declares a fieldless enum whose variants round-trip through the fixed
/// strings stored in SQLite.
macro_rules! str_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum! {
    /// Kind of interface a node describes.
    pub enum NodeKind {
        Function => "function",
        Method => "method",
        Trait => "trait",
        TraitItem => "trait_item",
        Impl => "impl",
        Struct => "struct",
        Enum => "enum",
        Union => "union",
        TypeAlias => "type_alias",
        Const => "const",
        Static => "static",
        Macro => "macro",
        Module => "module",
        Field => "field",
        Variant => "variant",
        AssociatedType => "associated_type",
        AssociatedConst => "associated_const",
        Bound => "bound",
    }
}

str_enum! {
    /// Nesting level. Only `L1` nodes are addressable.
    pub enum NestingLevel {
        L1 => "L1",
        L2 => "L2",
        L3 => "L3",
    }
}

str_enum! {
    pub enum EdgeKind {
        Calls => "CALLS",
        Implements => "IMPLEMENTS",
        Uses => "USES",
        Depends => "DEPENDS",
        RequiresBound => "REQUIRES_BOUND",
        FeatureGatedBy => "FEATURE_GATED_BY",
    }
}

str_enum! {
    /// How an edge was derived.
    pub enum Provenance {
        Heuristic => "heuristic",
        Semantic => "semantic",
    }
}

str_enum! {
    pub enum BlobClass {
        Test => "test",
        Implementation => "implementation",
    }
}

str_enum! {
    pub enum Severity {
        Error => "error",
        Warning => "warning",
        Information => "information",
        Hint => "hint",
    }
}

str_enum! {
    pub enum FutureAction {
        None => "none",
        Create => "create",
        Edit => "edit",
        Delete => "delete",
    }
}

str_enum! {
    pub enum PreflightState {
        None => "none",
        Failed => "failed",
        Passed => "passed",
    }
}

str_enum! {
    /// Derived lifecycle state of a [`MutationRecord`].
    pub enum MutationState {
        Clean => "clean",
        Draft => "draft",
        ValidatedPass => "validated_pass",
        ValidatedFail => "validated_fail",
    }
}

impl NodeKind {
    /// Level a node of this kind is stored at.
    pub fn level(self) -> NestingLevel {
        match self {
            NodeKind::Field
            | NodeKind::Variant
            | NodeKind::AssociatedType
            | NodeKind::AssociatedConst => NestingLevel::L2,
            NodeKind::Bound => NestingLevel::L3,
            _ => NestingLevel::L1,
        }
    }

    /// Kinds that name a type other nodes can reference in signatures.
    pub fn is_type_like(self) -> bool {
        matches!(
            self,
            NodeKind::Struct
                | NodeKind::Enum
                | NodeKind::Union
                | NodeKind::TypeAlias
                | NodeKind::Trait
        )
    }

    pub fn is_callable(self) -> bool {
        matches!(
            self,
            NodeKind::Function | NodeKind::Method | NodeKind::TraitItem | NodeKind::Macro
        )
    }
}

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

const CFG_FEATURE_PREFIX: &str = "cfg:feature=";

/// Stable node identifier, the rendered form of a [`NodeKey`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pseudo-target used by `FEATURE_GATED_BY` edges.
    pub fn cfg_feature(feature: &str) -> Self {
        Self(format!("{CFG_FEATURE_PREFIX}{feature}"))
    }

    /// True for edge targets that do not name a stored node.
    pub fn is_pseudo(&self) -> bool {
        self.0.starts_with(CFG_FEATURE_PREFIX)
    }

    pub fn key(&self) -> Option<NodeKey> {
        NodeKey::parse(self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The identity tuple a [`NodeId`] is derived from.
///
/// `disambiguator` is the ordinal of the `(file_path, symbol, kind)` triple in
/// document order, so two `impl Display for Foo` blocks in one file get 0 and
/// 1.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub file_path: String,
    pub symbol: String,
    pub kind: NodeKind,
    pub disambiguator: u32,
}

impl NodeKey {
    pub fn new(
        file_path: impl Into<String>,
        symbol: impl Into<String>,
        kind: NodeKind,
        disambiguator: u32,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            symbol: symbol.into(),
            kind,
            disambiguator,
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId(format!(
            "{}|{}|{}|{}",
            self.file_path,
            self.symbol,
            self.kind.as_str(),
            self.disambiguator
        ))
    }

    /// Parse a rendered id back into its key. The symbol may itself contain
    /// `|`, so the kind and disambiguator are split off from the right.
    pub fn parse(id: &NodeId) -> Option<Self> {
        let mut right = id.as_str().rsplitn(3, '|');
        let disambiguator = right.next()?.parse::<u32>().ok()?;
        let kind = NodeKind::parse(right.next()?)?;
        let (file_path, symbol) = right.next()?.split_once('|')?;
        if file_path.is_empty() || symbol.is_empty() {
            return None;
        }
        Some(Self::new(file_path, symbol, kind, disambiguator))
    }
}

// ---------------------------------------------------------------------------
// Hashing helpers
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Graph records
// ---------------------------------------------------------------------------

/// Byte and 1-based line span of a node inside its file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
}

impl Span {
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start_byte < end && start < self.end_byte
    }

    pub fn contains_byte(&self, offset: usize) -> bool {
        self.start_byte <= offset && offset < self.end_byte
    }

    pub fn len(&self) -> usize {
        self.end_byte.saturating_sub(self.start_byte)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One row per interface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceNode {
    pub id: NodeId,
    pub file_path: String,
    pub module_path: String,
    pub symbol: String,
    pub kind: NodeKind,
    pub level: NestingLevel,
    /// Owning L1 node; set exactly when `level` is L2 or L3.
    pub owner: Option<NodeId>,
    pub signature: String,
    pub exact_signature: Option<String>,
    pub hydrated_signature: Option<String>,
    pub confidence: f64,
    pub content_hash: String,
    pub parse_error_count: u32,
    pub span: Span,
}

impl InterfaceNode {
    pub fn is_addressable(&self) -> bool {
        self.level == NestingLevel::L1
    }

    /// Best available signature: hydrated, then exact, then tolerant.
    pub fn best_signature(&self) -> &str {
        self.hydrated_signature
            .as_deref()
            .or(self.exact_signature.as_deref())
            .unwrap_or(&self.signature)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    pub provenance: Provenance,
    pub weight: f64,
    /// File whose ingestion owns this edge.
    pub file_path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeBlob {
    pub node_id: NodeId,
    pub code: String,
    pub recovered: bool,
    pub classification: BlobClass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub node_id: NodeId,
    pub encoder: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
}

/// Zero-based line/column range, as analyzers report them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl SourceRange {
    pub fn point(line: u32, col: u32) -> Self {
        Self {
            start_line: line,
            start_col: col,
            end_line: line,
            end_col: col,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<String>,
    pub message: String,
    pub file_path: String,
    pub range: SourceRange,
    /// Revision of the analyzer that produced it.
    pub analyzer_revision: String,
}

// ---------------------------------------------------------------------------
// Mutation records
// ---------------------------------------------------------------------------

/// The only write-facing entity. `future_*` fields hold unreviewed code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub node_id: NodeId,
    pub file_path: String,
    pub current_code: Option<String>,
    pub future_code: Option<String>,
    pub future_action: FutureAction,
    pub current_present: bool,
    pub future_present: bool,
    pub classification: BlobClass,
    pub preflight_state: PreflightState,
    pub diagnostics: Vec<Diagnostic>,
    /// Content hash of the file text the preflight verdict was reached on.
    #[serde(default)]
    pub validated_base_hash: Option<String>,
}

impl MutationRecord {
    /// A record with no pending change, mirroring what is on disk.
    pub fn clean(
        node_id: NodeId,
        file_path: impl Into<String>,
        current_code: Option<String>,
        classification: BlobClass,
    ) -> Self {
        let present = current_code.is_some();
        Self {
            node_id,
            file_path: file_path.into(),
            current_code,
            future_code: None,
            future_action: FutureAction::None,
            current_present: present,
            future_present: present,
            classification,
            preflight_state: PreflightState::None,
            diagnostics: Vec::new(),
            validated_base_hash: None,
        }
    }

    pub fn state(&self) -> MutationState {
        match (self.future_action, self.preflight_state) {
            (FutureAction::None, _) => MutationState::Clean,
            (_, PreflightState::None) => MutationState::Draft,
            (_, PreflightState::Passed) => MutationState::ValidatedPass,
            (_, PreflightState::Failed) => MutationState::ValidatedFail,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.future_action != FutureAction::None
    }
}

// ---------------------------------------------------------------------------
// Retrieval filters
// ---------------------------------------------------------------------------

/// Pre-filter applied to vector candidates before ranking.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFilter {
    /// Only nodes whose file path starts with this prefix (a crate root).
    pub path_prefix: Option<String>,
    /// Only these kinds; empty means any.
    pub kinds: Vec<NodeKind>,
    pub classification: Option<BlobClass>,
}

impl NodeFilter {
    pub fn is_empty(&self) -> bool {
        self.path_prefix.is_none() && self.kinds.is_empty() && self.classification.is_none()
    }

    pub fn accepts(&self, node: &InterfaceNode, classification: Option<BlobClass>) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !node.file_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&node.kind) {
            return false;
        }
        match self.classification {
            Some(wanted) => classification == Some(wanted),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion output
// ---------------------------------------------------------------------------

/// Everything one file's ingestion produces; committed as one transaction.
#[derive(Clone, Debug, Default)]
pub struct FileGraph {
    pub file_path: String,
    pub content_hash: String,
    pub source_text: String,
    pub parse_error_count: u32,
    pub nodes: Vec<InterfaceNode>,
    pub edges: Vec<Edge>,
    pub blobs: Vec<CodeBlob>,
    pub diagnostics: Vec<(NodeId, Diagnostic)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_round_trips_through_id() {
        let key = NodeKey::new("src/lib.rs", "Parser::parse", NodeKind::Method, 0);
        let id = key.id();
        assert_eq!(id.as_str(), "src/lib.rs|Parser::parse|method|0");
        assert_eq!(NodeKey::parse(&id), Some(key));
    }

    #[test]
    fn test_node_key_parse_rejects_garbage() {
        assert!(NodeKey::parse(&NodeId::from("nope")).is_none());
        assert!(NodeKey::parse(&NodeId::from("a|b|not_a_kind|0")).is_none());
        assert!(NodeKey::parse(&NodeId::from("a|b|function|x")).is_none());
    }

    #[test]
    fn test_cfg_feature_ids_are_pseudo() {
        let id = NodeId::cfg_feature("serde");
        assert!(id.is_pseudo());
        assert!(id.key().is_none());
        assert!(!NodeKey::new("a.rs", "f", NodeKind::Function, 0).id().is_pseudo());
    }

    #[test]
    fn test_kind_levels() {
        assert_eq!(NodeKind::Function.level(), NestingLevel::L1);
        assert_eq!(NodeKind::Field.level(), NestingLevel::L2);
        assert_eq!(NodeKind::Bound.level(), NestingLevel::L3);
    }

    #[test]
    fn test_str_enum_parse_matches_as_str() {
        for kind in EdgeKind::ALL {
            assert_eq!(EdgeKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(EdgeKind::RequiresBound.as_str(), "REQUIRES_BOUND");
    }

    #[test]
    fn test_mutation_state_is_derived_from_flags() {
        let mut record = MutationRecord::clean(
            NodeId::from("a.rs|f|function|0"),
            "a.rs",
            Some("fn f() {}".to_string()),
            BlobClass::Implementation,
        );
        assert_eq!(record.state(), MutationState::Clean);
        record.future_action = FutureAction::Edit;
        assert_eq!(record.state(), MutationState::Draft);
        record.preflight_state = PreflightState::Failed;
        assert_eq!(record.state(), MutationState::ValidatedFail);
        record.preflight_state = PreflightState::Passed;
        assert_eq!(record.state(), MutationState::ValidatedPass);
    }

    #[test]
    fn test_span_overlap() {
        let span = Span {
            start_byte: 10,
            end_byte: 20,
            start_line: 1,
            end_line: 2,
        };
        assert!(span.overlaps(15, 30));
        assert!(!span.overlaps(20, 30));
        assert!(span.contains_byte(10));
        assert!(!span.contains_byte(20));
    }
}
