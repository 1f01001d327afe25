//! SQLite storage layer for the interface signature graph.
//!
//! Each public method opens its own connection so callers never manage
//! connection lifetime. Writers use `BEGIN IMMEDIATE` transactions; readers
//! run concurrently under WAL.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::debug;

use crate::errors::{IsgError, IsgResult};
use crate::models::{
    BlobClass, CodeBlob, Diagnostic, Edge, EdgeKind, FileGraph, FutureAction, InterfaceNode,
    MutationRecord, NestingLevel, NodeFilter, NodeId, NodeKind, PreflightState, Provenance,
    Severity, SourceRange, Span,
};
use crate::store::schema;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text == "~" || text.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if text.len() > 2 {
                expanded.push(&text[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

fn resolve_path(path: &Path) -> IsgResult<PathBuf> {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

/// Parse a stored enum string, surfacing unknown values as a conversion error.
fn parse_text<T>(idx: usize, value: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognised stored value {value:?}").into(),
        )
    })
}

fn f32_vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

const NODE_COLUMNS: &str = "id, file_path, module_path, symbol, kind, level, owner_id, \
     signature, exact_signature, hydrated_signature, confidence, content_hash, \
     parse_error_count, start_byte, end_byte, start_line, end_line";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<InterfaceNode> {
    let owner: Option<String> = row.get(6)?;
    Ok(InterfaceNode {
        id: NodeId::new(row.get::<_, String>(0)?),
        file_path: row.get(1)?,
        module_path: row.get(2)?,
        symbol: row.get(3)?,
        kind: parse_text(4, row.get(4)?, NodeKind::parse)?,
        level: parse_text(5, row.get(5)?, NestingLevel::parse)?,
        owner: owner.map(NodeId::new),
        signature: row.get(7)?,
        exact_signature: row.get(8)?,
        hydrated_signature: row.get(9)?,
        confidence: row.get(10)?,
        content_hash: row.get(11)?,
        parse_error_count: row.get(12)?,
        span: Span {
            start_byte: row.get::<_, i64>(13)? as usize,
            end_byte: row.get::<_, i64>(14)? as usize,
            start_line: row.get::<_, i64>(15)? as usize,
            end_line: row.get::<_, i64>(16)? as usize,
        },
    })
}

const MUTATION_COLUMNS: &str = "node_id, file_path, current_code, future_code, future_action, \
     current_present, future_present, classification, preflight_state, diagnostics_json, \
     validated_base_hash";

fn mutation_from_row(row: &Row<'_>) -> rusqlite::Result<MutationRecord> {
    let diagnostics_json: String = row.get(9)?;
    let diagnostics: Vec<Diagnostic> = serde_json::from_str(&diagnostics_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;
    Ok(MutationRecord {
        node_id: NodeId::new(row.get::<_, String>(0)?),
        file_path: row.get(1)?,
        current_code: row.get(2)?,
        future_code: row.get(3)?,
        future_action: parse_text(4, row.get(4)?, FutureAction::parse)?,
        current_present: row.get::<_, i64>(5)? != 0,
        future_present: row.get::<_, i64>(6)? != 0,
        classification: parse_text(7, row.get(7)?, BlobClass::parse)?,
        preflight_state: parse_text(8, row.get(8)?, PreflightState::parse)?,
        diagnostics,
        validated_base_hash: row.get(10)?,
    })
}

/// Outcome of committing one file's graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplaceOutcome {
    pub nodes_written: usize,
    pub nodes_removed: usize,
    pub edges_written: usize,
    pub cache_epoch: i64,
}

/// A stored node paired with the code its embedding is computed from.
#[derive(Clone, Debug)]
pub struct EmbeddingInput {
    pub node: InterfaceNode,
    pub code: String,
}

/// One row of the per-file ingestion event log.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct IngestionEvent {
    pub run_id: String,
    pub file_path: Option<String>,
    pub stage: String,
    pub category: String,
    pub message: String,
}

/// A preflight verdict for one in-flight record.
#[derive(Clone, Debug, PartialEq)]
pub struct PreflightVerdict {
    pub node_id: NodeId,
    pub state: PreflightState,
    pub diagnostics: Vec<Diagnostic>,
    /// Content hash of the file text the overlay was built from; `None`
    /// when the file is not in the store yet.
    pub base_hash: Option<String>,
}

/// One touched file's post-change text and the stored hash it was built on.
#[derive(Clone, Debug, PartialEq)]
pub struct FileWrite {
    pub path: String,
    pub base_hash: Option<String>,
    pub text: String,
}

/// What an approve writes besides the mutation rows.
#[derive(Clone, Debug, Default)]
pub struct ApplyBatch {
    pub records: Vec<MutationRecord>,
    pub files: Vec<FileWrite>,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite store for nodes, edges, blobs, diagnostics, embeddings and
/// mutation records.
#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Create a handle; the path is expanded and its parent directory created.
    pub fn new(db_path: impl AsRef<Path>) -> IsgResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { db_path: resolved })
    }

    /// Open a store and bring its schema up to date.
    pub fn open(db_path: impl AsRef<Path>) -> IsgResult<Self> {
        let db = Self::new(db_path)?;
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Open a new connection with foreign keys and the busy timeout set.
    pub(crate) fn connect(&self) -> IsgResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Create tables and run pending migrations.
    pub fn init_schema(&self) -> IsgResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for statement in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(statement)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    fn set_meta(conn: &Connection, key: &str, value: &str) -> IsgResult<()> {
        conn.execute(
            "INSERT INTO repo_meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    fn bump_epoch_in(conn: &Connection) -> IsgResult<i64> {
        let current: Option<String> = conn
            .query_row(
                "SELECT value FROM repo_meta WHERE key = 'cache_epoch';",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let next_epoch = std::cmp::max(1, current + 1);
        Self::set_meta(conn, "cache_epoch", &next_epoch.to_string())?;
        Ok(next_epoch)
    }

    // -----------------------------------------------------------------------
    // repo_meta
    // -----------------------------------------------------------------------

    pub fn get_repo_meta(&self, key: &str) -> IsgResult<Option<String>> {
        let conn = self.connect()?;
        let value = conn
            .query_row(
                "SELECT value FROM repo_meta WHERE key = ?1 LIMIT 1;",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_repo_meta(&self, key: &str, value: &str) -> IsgResult<()> {
        let conn = self.connect()?;
        Self::set_meta(&conn, key, value)
    }

    /// Current cache epoch (at least 1).
    pub fn cache_epoch(&self) -> IsgResult<i64> {
        let value = self.get_repo_meta("cache_epoch")?;
        let parsed = value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(1);
        Ok(parsed.max(1))
    }

    pub fn bump_cache_epoch(&self) -> IsgResult<i64> {
        let conn = self.connect()?;
        Self::bump_epoch_in(&conn)
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    pub fn file_hash(&self, file_path: &str) -> IsgResult<Option<String>> {
        let conn = self.connect()?;
        let hash = conn
            .query_row(
                "SELECT content_hash FROM files WHERE path = ?1;",
                params![file_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn file_text(&self, file_path: &str) -> IsgResult<Option<String>> {
        let conn = self.connect()?;
        let text = conn
            .query_row(
                "SELECT source_text FROM files WHERE path = ?1;",
                params![file_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text)
    }

    pub fn list_files(&self) -> IsgResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT path FROM files ORDER BY path ASC;")?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    /// Replace everything one file owns in a single transaction.
    ///
    /// Nodes are upserted rather than deleted and reinserted, so embeddings
    /// of nodes whose id survives stay attached; nodes absent from `graph`
    /// are deleted along with their blobs, facets and embeddings.
    pub fn replace_file_graph(&self, graph: &FileGraph) -> IsgResult<ReplaceOutcome> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = Self::write_file_graph(&tx, graph)?;
        tx.commit()?;
        debug!(
            "committed {}: {} nodes, {} removed, {} edges",
            graph.file_path, outcome.nodes_written, outcome.nodes_removed, outcome.edges_written
        );
        Ok(outcome)
    }

    fn write_file_graph(tx: &Transaction<'_>, graph: &FileGraph) -> IsgResult<ReplaceOutcome> {
        tx.execute(
            "INSERT INTO files(path, content_hash, source_text, parse_error_count) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(path) DO UPDATE SET \
                 content_hash = excluded.content_hash, \
                 source_text = excluded.source_text, \
                 parse_error_count = excluded.parse_error_count, \
                 last_indexed_at = CURRENT_TIMESTAMP;",
            params![
                graph.file_path,
                graph.content_hash,
                graph.source_text,
                graph.parse_error_count
            ],
        )?;

        let existing: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM nodes WHERE file_path = ?1;")?;
            let ids = stmt
                .query_map(params![graph.file_path], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            ids
        };
        let incoming: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut nodes_removed = 0;
        for id in existing.iter().filter(|id| !incoming.contains(id.as_str())) {
            nodes_removed += tx.execute("DELETE FROM nodes WHERE id = ?1;", params![id])?;
        }

        // Owners must exist before their facets.
        let mut ordered: Vec<&InterfaceNode> = graph.nodes.iter().collect();
        ordered.sort_by_key(|n| n.level);
        {
            let mut stmt = tx.prepare(
                "INSERT INTO nodes (id, file_path, module_path, symbol, kind, level, owner_id, \
                     signature, exact_signature, hydrated_signature, confidence, content_hash, \
                     parse_error_count, start_byte, end_byte, start_line, end_line) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
                 ON CONFLICT(id) DO UPDATE SET \
                     module_path = excluded.module_path, \
                     symbol = excluded.symbol, \
                     kind = excluded.kind, \
                     level = excluded.level, \
                     owner_id = excluded.owner_id, \
                     signature = excluded.signature, \
                     exact_signature = excluded.exact_signature, \
                     hydrated_signature = excluded.hydrated_signature, \
                     confidence = excluded.confidence, \
                     content_hash = excluded.content_hash, \
                     parse_error_count = excluded.parse_error_count, \
                     start_byte = excluded.start_byte, \
                     end_byte = excluded.end_byte, \
                     start_line = excluded.start_line, \
                     end_line = excluded.end_line;",
            )?;
            for node in &ordered {
                stmt.execute(params![
                    node.id.as_str(),
                    node.file_path,
                    node.module_path,
                    node.symbol,
                    node.kind.as_str(),
                    node.level.as_str(),
                    node.owner.as_ref().map(|o| o.as_str()),
                    node.signature,
                    node.exact_signature,
                    node.hydrated_signature,
                    node.confidence.clamp(0.0, 1.0),
                    node.content_hash,
                    node.parse_error_count,
                    node.span.start_byte as i64,
                    node.span.end_byte as i64,
                    node.span.start_line as i64,
                    node.span.end_line as i64,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO blobs (node_id, code, recovered, classification) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(node_id) DO UPDATE SET \
                     code = excluded.code, \
                     recovered = excluded.recovered, \
                     classification = excluded.classification;",
            )?;
            for blob in &graph.blobs {
                stmt.execute(params![
                    blob.node_id.as_str(),
                    blob.code,
                    blob.recovered as i64,
                    blob.classification.as_str(),
                ])?;
            }
        }

        tx.execute(
            "DELETE FROM diagnostics WHERE node_id IN \
             (SELECT id FROM nodes WHERE file_path = ?1);",
            params![graph.file_path],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO diagnostics (node_id, severity, code, message, file_path, \
                     start_line, start_col, end_line, end_col, analyzer_revision) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            )?;
            for (node_id, diag) in &graph.diagnostics {
                stmt.execute(params![
                    node_id.as_str(),
                    diag.severity.as_str(),
                    diag.code,
                    diag.message,
                    diag.file_path,
                    diag.range.start_line,
                    diag.range.start_col,
                    diag.range.end_line,
                    diag.range.end_col,
                    diag.analyzer_revision,
                ])?;
            }
        }

        tx.execute(
            "DELETE FROM edges WHERE file_path = ?1;",
            params![graph.file_path],
        )?;
        let mut edges_written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO edges \
                     (source_id, target_id, kind, provenance, weight, file_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            )?;
            for edge in &graph.edges {
                edges_written += stmt.execute(params![
                    edge.source.as_str(),
                    edge.target.as_str(),
                    edge.kind.as_str(),
                    edge.provenance.as_str(),
                    edge.weight,
                    edge.file_path,
                ])?;
            }
        }

        let cache_epoch = Self::bump_epoch_in(tx)?;
        Ok(ReplaceOutcome {
            nodes_written: graph.nodes.len(),
            nodes_removed,
            edges_written,
            cache_epoch,
        })
    }

    /// Drop a file and everything it owns. Returns whether it was present.
    pub fn remove_file(&self, file_path: &str) -> IsgResult<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM edges WHERE file_path = ?1;", params![file_path])?;
        let removed = tx.execute("DELETE FROM files WHERE path = ?1;", params![file_path])?;
        if removed > 0 {
            Self::bump_epoch_in(&tx)?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }

    // -----------------------------------------------------------------------
    // Nodes, blobs, edges, diagnostics
    // -----------------------------------------------------------------------

    pub fn get_node(&self, id: &NodeId) -> IsgResult<Option<InterfaceNode>> {
        let conn = self.connect()?;
        let node = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1;"),
                params![id.as_str()],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    /// Fetch several nodes, preserving input order and skipping unknown ids.
    pub fn get_nodes(&self, ids: &[NodeId]) -> IsgResult<Vec<InterfaceNode>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1;"))?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = stmt
                .query_row(params![id.as_str()], node_from_row)
                .optional()?
            {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub fn nodes_in_file(&self, file_path: &str) -> IsgResult<Vec<InterfaceNode>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE file_path = ?1 ORDER BY start_byte, id;"
        ))?;
        let nodes = stmt
            .query_map(params![file_path], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    /// All addressable nodes, ordered by id.
    pub fn l1_nodes(&self) -> IsgResult<Vec<InterfaceNode>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE level = 'L1' ORDER BY id ASC;"
        ))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    /// L2/L3 facets owned by `owner`, in document order.
    pub fn facets_of(&self, owner: &NodeId) -> IsgResult<Vec<InterfaceNode>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE owner_id = ?1 ORDER BY start_byte, id;"
        ))?;
        let nodes = stmt
            .query_map(params![owner.as_str()], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    pub fn count_nodes(&self) -> IsgResult<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes;", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn get_blob(&self, id: &NodeId) -> IsgResult<Option<CodeBlob>> {
        let conn = self.connect()?;
        let blob = conn
            .query_row(
                "SELECT node_id, code, recovered, classification FROM blobs WHERE node_id = ?1;",
                params![id.as_str()],
                |row| {
                    Ok(CodeBlob {
                        node_id: NodeId::new(row.get::<_, String>(0)?),
                        code: row.get(1)?,
                        recovered: row.get::<_, i64>(2)? != 0,
                        classification: parse_text(3, row.get(3)?, BlobClass::parse)?,
                    })
                },
            )
            .optional()?;
        Ok(blob)
    }

    fn edges_where(&self, clause: &str, args: &[&dyn rusqlite::ToSql]) -> IsgResult<Vec<Edge>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT source_id, target_id, kind, provenance, weight, file_path FROM edges \
             {clause} ORDER BY source_id, target_id, kind;"
        ))?;
        let edges = stmt
            .query_map(args, |row| {
                Ok(Edge {
                    source: NodeId::new(row.get::<_, String>(0)?),
                    target: NodeId::new(row.get::<_, String>(1)?),
                    kind: parse_text(2, row.get(2)?, EdgeKind::parse)?,
                    provenance: parse_text(3, row.get(3)?, Provenance::parse)?,
                    weight: row.get(4)?,
                    file_path: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    pub fn all_edges(&self) -> IsgResult<Vec<Edge>> {
        self.edges_where("", &[])
    }

    pub fn edges_in_file(&self, file_path: &str) -> IsgResult<Vec<Edge>> {
        self.edges_where("WHERE file_path = ?1", &[&file_path])
    }

    pub fn edges_from(&self, source: &NodeId) -> IsgResult<Vec<Edge>> {
        self.edges_where("WHERE source_id = ?1", &[&source.as_str()])
    }

    pub fn diagnostics_for(&self, id: &NodeId) -> IsgResult<Vec<Diagnostic>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT severity, code, message, file_path, start_line, start_col, end_line, \
                 end_col, analyzer_revision \
             FROM diagnostics WHERE node_id = ?1 ORDER BY start_line, start_col, id;",
        )?;
        let diagnostics = stmt
            .query_map(params![id.as_str()], |row| {
                Ok(Diagnostic {
                    severity: parse_text(0, row.get(0)?, Severity::parse)?,
                    code: row.get(1)?,
                    message: row.get(2)?,
                    file_path: row.get(3)?,
                    range: SourceRange {
                        start_line: row.get(4)?,
                        start_col: row.get(5)?,
                        end_line: row.get(6)?,
                        end_col: row.get(7)?,
                    },
                    analyzer_revision: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(diagnostics)
    }

    // -----------------------------------------------------------------------
    // Embeddings
    // -----------------------------------------------------------------------

    /// Addressable nodes of `file_path` with no embedding for `encoder` at
    /// their current content hash.
    pub fn embeddings_due(&self, encoder: &str, file_path: &str) -> IsgResult<Vec<EmbeddingInput>> {
        let conn = self.connect()?;
        let columns = NODE_COLUMNS
            .split(", ")
            .map(|c| format!("n.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns}, b.code FROM nodes n \
             JOIN blobs b ON b.node_id = n.id \
             LEFT JOIN embeddings e ON e.node_id = n.id AND e.encoder = ?1 \
             WHERE n.file_path = ?2 AND n.level = 'L1' \
               AND (e.node_id IS NULL OR e.content_hash != n.content_hash) \
             ORDER BY n.id;"
        ))?;
        let due = stmt
            .query_map(params![encoder, file_path], |row| {
                Ok(EmbeddingInput {
                    node: node_from_row(row)?,
                    code: row.get(17)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(due)
    }

    pub fn upsert_embeddings(&self, encoder: &str, rows: &[(NodeId, String, Vec<f32>)]) -> IsgResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO embeddings (node_id, encoder, content_hash, dimensions, vector) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(node_id, encoder) DO UPDATE SET \
                     content_hash = excluded.content_hash, \
                     dimensions = excluded.dimensions, \
                     vector = excluded.vector, \
                     updated_at = CURRENT_TIMESTAMP;",
            )?;
            for (node_id, hash, vector) in rows {
                written += stmt.execute(params![
                    node_id.as_str(),
                    encoder,
                    hash,
                    vector.len() as i64,
                    f32_vec_to_bytes(vector),
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// The fresh embedding of one node, if any.
    pub fn embedding_for(&self, encoder: &str, id: &NodeId) -> IsgResult<Option<Vec<f32>>> {
        let conn = self.connect()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT e.vector FROM embeddings e JOIN nodes n ON n.id = e.node_id \
                 WHERE e.node_id = ?1 AND e.encoder = ?2 AND e.content_hash = n.content_hash;",
                params![id.as_str(), encoder],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| bytes_to_f32_vec(&b)))
    }

    /// Fresh embeddings for `encoder` that pass `filter`, ordered by node id.
    /// Rows whose stored hash no longer matches the node are never returned.
    pub fn load_embeddings(
        &self,
        encoder: &str,
        filter: &NodeFilter,
    ) -> IsgResult<Vec<(NodeId, Vec<f32>)>> {
        let conn = self.connect()?;
        let mut sql = String::from(
            "SELECT e.node_id, e.vector FROM embeddings e \
             JOIN nodes n ON n.id = e.node_id \
             LEFT JOIN blobs b ON b.node_id = n.id \
             WHERE e.encoder = ?1 AND e.content_hash = n.content_hash",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(encoder.to_string())];
        if let Some(prefix) = &filter.path_prefix {
            args.push(Box::new(prefix.clone()));
            let idx = args.len();
            sql.push_str(&format!(" AND substr(n.file_path, 1, length(?{idx})) = ?{idx}"));
        }
        if !filter.kinds.is_empty() {
            let mut placeholders = Vec::new();
            for kind in &filter.kinds {
                args.push(Box::new(kind.as_str()));
                placeholders.push(format!("?{}", args.len()));
            }
            sql.push_str(&format!(" AND n.kind IN ({})", placeholders.join(", ")));
        }
        if let Some(class) = filter.classification {
            args.push(Box::new(class.as_str()));
            sql.push_str(&format!(" AND b.classification = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY e.node_id;");

        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt
            .query_map(arg_refs.as_slice(), |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((NodeId::new(id), bytes_to_f32_vec(&blob)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn get_mutation(&self, id: &NodeId) -> IsgResult<Option<MutationRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                &format!("SELECT {MUTATION_COLUMNS} FROM mutations WHERE node_id = ?1;"),
                params![id.as_str()],
                mutation_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Records with a change in flight, ordered by node id.
    pub fn pending_mutations(&self) -> IsgResult<Vec<MutationRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MUTATION_COLUMNS} FROM mutations \
             WHERE future_action != 'none' ORDER BY node_id ASC;"
        ))?;
        let records = stmt
            .query_map([], mutation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Store a new draft. Fails with `MutationConflict` when a change is
    /// already in flight for the node; the check and the write are one
    /// statement, so two processes cannot both win.
    pub fn insert_draft(&self, record: &MutationRecord) -> IsgResult<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "INSERT INTO mutations (node_id, file_path, current_code, future_code, \
                 future_action, current_present, future_present, classification, \
                 preflight_state, diagnostics_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'none', '[]') \
             ON CONFLICT(node_id) DO UPDATE SET \
                 file_path = excluded.file_path, \
                 current_code = excluded.current_code, \
                 future_code = excluded.future_code, \
                 future_action = excluded.future_action, \
                 current_present = excluded.current_present, \
                 future_present = excluded.future_present, \
                 classification = excluded.classification, \
                 preflight_state = 'none', \
                 diagnostics_json = '[]', \
                 validated_base_hash = NULL, \
                 updated_at = CURRENT_TIMESTAMP \
             WHERE mutations.future_action = 'none';",
            params![
                record.node_id.as_str(),
                record.file_path,
                record.current_code,
                record.future_code,
                record.future_action.as_str(),
                record.current_present as i64,
                record.future_present as i64,
                record.classification.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(IsgError::MutationConflict {
                node_id: record.node_id.clone(),
                reason: "a change is already in flight for this node".to_string(),
            });
        }
        Ok(())
    }

    /// Record preflight verdicts for in-flight records in one transaction.
    pub fn record_preflight(&self, verdicts: &[PreflightVerdict]) -> IsgResult<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE mutations SET preflight_state = ?2, diagnostics_json = ?3, \
                     validated_base_hash = ?4, updated_at = CURRENT_TIMESTAMP \
                 WHERE node_id = ?1 AND future_action != 'none';",
            )?;
            for verdict in verdicts {
                let json = serde_json::to_string(&verdict.diagnostics)?;
                updated += stmt.execute(params![
                    verdict.node_id.as_str(),
                    verdict.state.as_str(),
                    json,
                    verdict.base_hash,
                ])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Clear `future_*` on the given records. Returns how many changed.
    pub fn clear_mutations(&self, ids: &[NodeId]) -> IsgResult<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut cleared = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE mutations SET future_code = NULL, future_action = 'none', \
                     future_present = current_present, preflight_state = 'none', \
                     diagnostics_json = '[]', validated_base_hash = NULL, \
                     updated_at = CURRENT_TIMESTAMP \
                 WHERE node_id = ?1 AND future_action != 'none';",
            )?;
            for id in ids {
                cleared += stmt.execute(params![id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(cleared)
    }

    /// Flip every record of `batch` from future to current and write the
    /// touched files' new text, all in one transaction.
    ///
    /// Every file must still hold the text its write was built on, checked
    /// by content hash before anything flips; a mismatch is a
    /// `MutationConflict`. Each record is re-checked inside the
    /// transaction; `before_flip` runs ahead of each flip. Any error rolls
    /// back the whole batch. Returns the new cache epoch.
    pub fn apply_mutations(
        &self,
        batch: &ApplyBatch,
        before_flip: &mut dyn FnMut(&MutationRecord) -> IsgResult<()>,
    ) -> IsgResult<i64> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for file in &batch.files {
            let stored: Option<String> = tx
                .query_row(
                    "SELECT content_hash FROM files WHERE path = ?1;",
                    params![file.path],
                    |row| row.get(0),
                )
                .optional()?;
            if stored != file.base_hash {
                let node_id = batch
                    .records
                    .iter()
                    .find(|r| r.file_path == file.path)
                    .map(|r| r.node_id.clone())
                    .unwrap_or_else(|| NodeId::new(file.path.clone()));
                return Err(IsgError::MutationConflict {
                    node_id,
                    reason: format!("{} changed while the approval was prepared", file.path),
                });
            }
        }
        for record in &batch.records {
            let stored = tx
                .query_row(
                    &format!("SELECT {MUTATION_COLUMNS} FROM mutations WHERE node_id = ?1;"),
                    params![record.node_id.as_str()],
                    mutation_from_row,
                )
                .optional()?;
            let validated = stored.as_ref().is_some_and(|s| {
                s.is_in_flight()
                    && s.preflight_state == PreflightState::Passed
                    && s.future_code == record.future_code
                    && s.future_action == record.future_action
            });
            if !validated {
                return Err(IsgError::NotValidated(record.node_id.clone()));
            }
            before_flip(record)?;
            tx.execute(
                "UPDATE mutations SET current_code = future_code, \
                     current_present = future_present, future_code = NULL, \
                     future_action = 'none', preflight_state = 'none', \
                     diagnostics_json = '[]', validated_base_hash = NULL, \
                     updated_at = CURRENT_TIMESTAMP \
                 WHERE node_id = ?1;",
                params![record.node_id.as_str()],
            )?;
        }
        for file in &batch.files {
            tx.execute(
                "INSERT INTO files(path, content_hash, source_text) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(path) DO UPDATE SET \
                     content_hash = excluded.content_hash, \
                     source_text = excluded.source_text;",
                params![file.path, crate::models::content_hash(&file.text), file.text],
            )?;
        }
        let epoch = Self::bump_epoch_in(&tx)?;
        tx.commit()?;
        Ok(epoch)
    }

    // -----------------------------------------------------------------------
    // Ingestion events
    // -----------------------------------------------------------------------

    pub fn record_ingestion_event(&self, event: &IngestionEvent) -> IsgResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO ingestion_events(run_id, file_path, stage, category, message) \
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                event.run_id,
                event.file_path,
                event.stage,
                event.category,
                event.message
            ],
        )?;
        Ok(())
    }

    pub fn ingestion_events(&self, run_id: Option<&str>) -> IsgResult<Vec<IngestionEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, file_path, stage, category, message FROM ingestion_events \
             WHERE ?1 IS NULL OR run_id = ?1 ORDER BY id ASC;",
        )?;
        let events = stmt
            .query_map(params![run_id], |row| {
                Ok(IngestionEvent {
                    run_id: row.get(0)?,
                    file_path: row.get(1)?,
                    stage: row.get(2)?,
                    category: row.get(3)?,
                    message: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Copy the store to `destination` with the SQLite online backup API.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> IsgResult<PathBuf> {
        let resolved = resolve_path(destination.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, Duration::from_millis(10), None)?;
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{content_hash, NodeKey};

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("isg.db")).unwrap();
        (dir, db)
    }

    fn node(file: &str, symbol: &str, kind: NodeKind, code: &str) -> InterfaceNode {
        InterfaceNode {
            id: NodeKey::new(file, symbol, kind, 0).id(),
            file_path: file.to_string(),
            module_path: String::new(),
            symbol: symbol.to_string(),
            kind,
            level: kind.level(),
            owner: None,
            signature: code.lines().next().unwrap_or_default().to_string(),
            exact_signature: None,
            hydrated_signature: None,
            confidence: 0.7,
            content_hash: content_hash(code),
            parse_error_count: 0,
            span: Span {
                start_byte: 0,
                end_byte: code.len(),
                start_line: 1,
                end_line: 1,
            },
        }
    }

    fn graph_with(file: &str, nodes: Vec<InterfaceNode>) -> FileGraph {
        let blobs = nodes
            .iter()
            .map(|n| CodeBlob {
                node_id: n.id.clone(),
                code: n.signature.clone(),
                recovered: false,
                classification: BlobClass::Implementation,
            })
            .collect();
        FileGraph {
            file_path: file.to_string(),
            content_hash: "h".to_string(),
            source_text: String::new(),
            parse_error_count: 0,
            nodes,
            edges: Vec::new(),
            blobs,
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn test_replace_file_graph_removes_stale_nodes() {
        let (_dir, db) = temp_db();
        let a = node("a.rs", "alpha", NodeKind::Function, "fn alpha() {}");
        let b = node("a.rs", "beta", NodeKind::Function, "fn beta() {}");
        db.replace_file_graph(&graph_with("a.rs", vec![a.clone(), b.clone()]))
            .unwrap();
        assert_eq!(db.nodes_in_file("a.rs").unwrap().len(), 2);

        let outcome = db.replace_file_graph(&graph_with("a.rs", vec![a.clone()])).unwrap();
        assert_eq!(outcome.nodes_removed, 1);
        assert!(db.get_node(&b.id).unwrap().is_none());
        assert!(db.get_blob(&b.id).unwrap().is_none());
        assert_eq!(db.get_node(&a.id).unwrap().unwrap(), a);
    }

    #[test]
    fn test_embeddings_survive_upsert_and_go_stale_on_hash_change() {
        let (_dir, db) = temp_db();
        let a = node("a.rs", "alpha", NodeKind::Function, "fn alpha() {}");
        db.replace_file_graph(&graph_with("a.rs", vec![a.clone()])).unwrap();
        assert_eq!(db.embeddings_due("enc", "a.rs").unwrap().len(), 1);
        db.upsert_embeddings("enc", &[(a.id.clone(), a.content_hash.clone(), vec![1.0, 0.0])])
            .unwrap();
        assert!(db.embeddings_due("enc", "a.rs").unwrap().is_empty());

        db.replace_file_graph(&graph_with("a.rs", vec![a.clone()])).unwrap();
        assert!(db.embeddings_due("enc", "a.rs").unwrap().is_empty());

        let mut changed = a.clone();
        changed.content_hash = content_hash("fn alpha() { 1; }");
        db.replace_file_graph(&graph_with("a.rs", vec![changed])).unwrap();
        assert_eq!(db.embeddings_due("enc", "a.rs").unwrap().len(), 1);
        assert!(db.load_embeddings("enc", &NodeFilter::default()).unwrap().is_empty());
        assert!(db.embedding_for("enc", &a.id).unwrap().is_none());
    }

    #[test]
    fn test_load_embeddings_filters() {
        let (_dir, db) = temp_db();
        let a = node("core/a.rs", "alpha", NodeKind::Function, "fn alpha() {}");
        let s = node("core/a.rs", "Beta", NodeKind::Struct, "struct Beta;");
        let c = node("cli/c.rs", "gamma", NodeKind::Function, "fn gamma() {}");
        db.replace_file_graph(&graph_with("core/a.rs", vec![a.clone(), s.clone()]))
            .unwrap();
        db.replace_file_graph(&graph_with("cli/c.rs", vec![c.clone()])).unwrap();
        let rows: Vec<_> = [&a, &s, &c]
            .iter()
            .map(|n| (n.id.clone(), n.content_hash.clone(), vec![0.5, 0.5]))
            .collect();
        db.upsert_embeddings("enc", &rows).unwrap();

        let filter = NodeFilter {
            path_prefix: Some("core/".to_string()),
            kinds: vec![NodeKind::Function],
            classification: Some(BlobClass::Implementation),
        };
        let loaded = db.load_embeddings("enc", &filter).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, a.id);
        assert_eq!(loaded[0].1, vec![0.5, 0.5]);
        assert_eq!(db.load_embeddings("enc", &NodeFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn test_insert_draft_conflicts_while_in_flight() {
        let (_dir, db) = temp_db();
        let id = NodeId::from("a.rs|alpha|function|0");
        let mut record = MutationRecord::clean(id.clone(), "a.rs", Some("fn alpha() {}".into()), BlobClass::Implementation);
        record.future_action = FutureAction::Edit;
        record.future_code = Some("fn alpha() { 1 }".to_string());
        db.insert_draft(&record).unwrap();
        let err = db.insert_draft(&record).unwrap_err();
        assert!(matches!(err, IsgError::MutationConflict { .. }));

        assert_eq!(db.clear_mutations(&[id.clone()]).unwrap(), 1);
        let stored = db.get_mutation(&id).unwrap().unwrap();
        assert!(!stored.is_in_flight());
        assert!(stored.future_code.is_none());
        db.insert_draft(&record).unwrap();
        assert_eq!(db.pending_mutations().unwrap().len(), 1);
    }

    #[test]
    fn test_apply_mutations_rolls_back_on_hook_failure() {
        let (_dir, db) = temp_db();
        let mut batch = ApplyBatch::default();
        for name in ["alpha", "beta"] {
            let id = NodeId::new(format!("a.rs|{name}|function|0"));
            let mut record = MutationRecord::clean(id.clone(), "a.rs", Some("old".into()), BlobClass::Implementation);
            record.future_action = FutureAction::Edit;
            record.future_code = Some("new".to_string());
            db.insert_draft(&record).unwrap();
            db.record_preflight(&[PreflightVerdict {
                node_id: id,
                state: PreflightState::Passed,
                diagnostics: Vec::new(),
                base_hash: None,
            }])
            .unwrap();
            record.preflight_state = PreflightState::Passed;
            batch.records.push(record);
        }
        batch.files.push(FileWrite {
            path: "a.rs".to_string(),
            base_hash: None,
            text: "new text".to_string(),
        });
        let epoch_before = db.cache_epoch().unwrap();

        let mut seen = 0;
        let err = db
            .apply_mutations(&batch, &mut |_| {
                seen += 1;
                if seen == 2 {
                    Err(IsgError::ApplyFailure("injected".to_string()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, IsgError::ApplyFailure(_)));
        for record in &batch.records {
            let stored = db.get_mutation(&record.node_id).unwrap().unwrap();
            assert_eq!(stored.future_code.as_deref(), Some("new"));
            assert_eq!(stored.current_code.as_deref(), Some("old"));
        }
        assert!(db.file_text("a.rs").unwrap().is_none());
        assert_eq!(db.cache_epoch().unwrap(), epoch_before);

        db.apply_mutations(&batch, &mut |_| Ok(())).unwrap();
        for record in &batch.records {
            let stored = db.get_mutation(&record.node_id).unwrap().unwrap();
            assert_eq!(stored.current_code.as_deref(), Some("new"));
            assert!(!stored.is_in_flight());
        }
        assert_eq!(db.file_text("a.rs").unwrap().as_deref(), Some("new text"));
    }

    #[test]
    fn test_apply_refuses_a_file_that_moved_on() {
        let (_dir, db) = temp_db();
        let a = node("a.rs", "alpha", NodeKind::Function, "fn alpha() {}");
        db.replace_file_graph(&graph_with("a.rs", vec![a.clone()])).unwrap();
        let base = db.file_hash("a.rs").unwrap();
        assert!(base.is_some());

        let mut record = MutationRecord::clean(a.id.clone(), "a.rs", Some("fn alpha() {}".into()), BlobClass::Implementation);
        record.future_action = FutureAction::Edit;
        record.future_code = Some("fn alpha() { beta() }".to_string());
        db.insert_draft(&record).unwrap();
        db.record_preflight(&[PreflightVerdict {
            node_id: a.id.clone(),
            state: PreflightState::Passed,
            diagnostics: Vec::new(),
            base_hash: base.clone(),
        }])
        .unwrap();
        assert_eq!(db.get_mutation(&a.id).unwrap().unwrap().validated_base_hash, base);

        let batch = ApplyBatch {
            records: vec![record],
            files: vec![FileWrite {
                path: "a.rs".to_string(),
                base_hash: Some(content_hash("some older text")),
                text: "fn alpha() { beta() }".to_string(),
            }],
        };
        let epoch_before = db.cache_epoch().unwrap();
        let mut flips = 0;
        let err = db
            .apply_mutations(&batch, &mut |_| {
                flips += 1;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, IsgError::MutationConflict { ref node_id, .. } if *node_id == a.id));
        assert_eq!(flips, 0);
        assert_eq!(db.cache_epoch().unwrap(), epoch_before);
        let stored = db.get_mutation(&a.id).unwrap().unwrap();
        assert_eq!(stored.preflight_state, PreflightState::Passed);
        assert_eq!(stored.current_code.as_deref(), Some("fn alpha() {}"));
    }

    #[test]
    fn test_apply_requires_passed_preflight() {
        let (_dir, db) = temp_db();
        let id = NodeId::from("a.rs|alpha|function|0");
        let mut record = MutationRecord::clean(id.clone(), "a.rs", Some("old".into()), BlobClass::Implementation);
        record.future_action = FutureAction::Edit;
        record.future_code = Some("new".to_string());
        db.insert_draft(&record).unwrap();
        let batch = ApplyBatch {
            records: vec![record],
            files: Vec::new(),
        };
        let err = db.apply_mutations(&batch, &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, IsgError::NotValidated(_)));
    }

    #[test]
    fn test_cache_epoch_and_events() {
        let (_dir, db) = temp_db();
        assert_eq!(db.cache_epoch().unwrap(), 1);
        assert_eq!(db.bump_cache_epoch().unwrap(), 2);
        db.record_ingestion_event(&IngestionEvent {
            run_id: "r1".to_string(),
            file_path: Some("a.rs".to_string()),
            stage: "read".to_string(),
            category: "io".to_string(),
            message: "denied".to_string(),
        })
        .unwrap();
        assert_eq!(db.ingestion_events(Some("r1")).unwrap().len(), 1);
        assert!(db.ingestion_events(Some("r2")).unwrap().is_empty());
        assert_eq!(db.ingestion_events(None).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_file_and_backup() {
        let (dir, db) = temp_db();
        let a = node("a.rs", "alpha", NodeKind::Function, "fn alpha() {}");
        db.replace_file_graph(&graph_with("a.rs", vec![a.clone()])).unwrap();
        let backup = db.backup_to(dir.path().join("copy.db")).unwrap();
        assert!(db.remove_file("a.rs").unwrap());
        assert!(!db.remove_file("a.rs").unwrap());
        assert_eq!(db.count_nodes().unwrap(), 0);

        let restored = Database::open(backup).unwrap();
        assert_eq!(restored.count_nodes().unwrap(), 1);
    }
}
