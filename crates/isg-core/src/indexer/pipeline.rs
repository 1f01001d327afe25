//! Ingestion orchestration with Rayon-based parallelism.
//!
//! Files are extracted and hydrated in a bounded worker pool, then
//! committed one transaction per file in path order. A file that fails at
//! any stage is recorded in the event log and skipped; the rest of the run
//! carries on.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IsgConfig;
use crate::deadline::CancellationToken;
use crate::errors::{IsgError, IsgResult};
use crate::indexer::confidence::{self, PassOutcome};
use crate::indexer::edges::{derive_edges, reference_positions, EdgeContext, SymbolTable};
use crate::indexer::embedding::{embedding_text, EmbeddingEncoder};
use crate::indexer::filesystem::{iter_workspace_files, read_source, relative_path, SourceFile};
use crate::indexer::hydration::{hydrate_file, HydrationOutcome, HydrationRequest, SemanticHydrator};
use crate::indexer::symbols::{extract_file, FileExtraction};
use crate::models::{content_hash, CodeBlob, Diagnostic, FileGraph, InterfaceNode, NodeId};
use crate::store::{Database, IngestionEvent};


static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_run_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run-{millis}-{}", RUN_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Per-file result of a committed ingestion.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FileIngestReport {
    pub file_path: String,
    pub parse_error_count: u32,
    pub nodes_written: usize,
    pub nodes_removed: usize,
    pub recovered_nodes: usize,
    pub edges_written: usize,
    pub diagnostics: usize,
    pub hydrated: bool,
    pub embeddings_computed: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileFailure {
    pub file_path: String,
    pub stage: String,
    pub category: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IngestionReport {
    pub run_id: String,
    pub files_seen: usize,
    pub files_ingested: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub nodes_written: usize,
    pub edges_written: usize,
    pub embeddings_computed: usize,
    pub elapsed_ms: u64,
    pub files: Vec<FileIngestReport>,
    pub failures: Vec<FileFailure>,
}

impl IngestionReport {
    fn absorb(&mut self, file: FileIngestReport) {
        self.files_ingested += 1;
        self.nodes_written += file.nodes_written;
        self.edges_written += file.edges_written;
        self.embeddings_computed += file.embeddings_computed;
        self.files.push(file);
    }
}

/// A file's graph, built and ready to commit.
struct PreparedFile {
    graph: FileGraph,
    report: FileIngestReport,
    degraded: Option<IsgError>,
}

pub struct IngestionPipeline {
    db: Database,
    config: IsgConfig,
    hydrator: Arc<dyn SemanticHydrator>,
    encoder: Arc<dyn EmbeddingEncoder>,
    cancel: CancellationToken,
}

impl IngestionPipeline {
    pub fn new(
        db: Database,
        config: IsgConfig,
        hydrator: Arc<dyn SemanticHydrator>,
        encoder: Arc<dyn EmbeddingEncoder>,
    ) -> Self {
        Self {
            db,
            config,
            hydrator,
            encoder,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the caller; cancelling it abandons
    /// hydration for runs already started (their files degrade to the
    /// structural result). Later runs are unaffected.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &IsgConfig {
        &self.config
    }

    /// Ingest one file from its text, always re-running every pass.
    pub fn ingest_file(&self, file_path: &str, text: &str) -> IsgResult<FileIngestReport> {
        let run_id = new_run_id();
        let extraction = extract_file(file_path, text)?;
        let cancel = self.cancel.scoped();
        let table = SymbolTable::build(self.db.l1_nodes()?, [&extraction]);
        let prepared = self.prepare(&extraction, text, &table, &cancel);
        self.commit(&run_id, prepared)
    }

    /// Ingest a batch of files. Extraction and hydration run in parallel;
    /// commits are sequential in path order.
    pub fn ingest_files(&self, sources: Vec<SourceFile>) -> IsgResult<IngestionReport> {
        let started = Instant::now();
        let cancel = self.cancel.scoped();
        let mut report = IngestionReport {
            run_id: new_run_id(),
            files_seen: sources.len(),
            ..IngestionReport::default()
        };
        self.ingest_into(&mut report, sources, &cancel)?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Scan `root`, ingest new and changed files, and drop files that no
    /// longer exist. Files whose content hash is unchanged are skipped.
    pub fn ingest_workspace(&self, root: &Path) -> IsgResult<IngestionReport> {
        let started = Instant::now();
        let cancel = self.cancel.scoped();
        let paths = iter_workspace_files(root, &self.config);
        let mut report = IngestionReport {
            run_id: new_run_id(),
            files_seen: paths.len(),
            ..IngestionReport::default()
        };

        let mut seen = BTreeSet::new();
        let mut changed = Vec::new();
        for path in paths {
            let source = match read_source(root, &path) {
                Ok(source) => source,
                Err(e) => {
                    let rel = relative_path(root, &path);
                    seen.insert(rel.clone());
                    self.record_failure(&mut report, &rel, "read", &e);
                    continue;
                }
            };
            seen.insert(source.path.clone());
            let stored = self.db.file_hash(&source.path)?;
            if stored.as_deref() == Some(content_hash(&source.text).as_str()) {
                report.files_unchanged += 1;
                continue;
            }
            changed.push(source);
        }

        for stale in self.db.list_files()? {
            if !seen.contains(&stale) && self.db.remove_file(&stale)? {
                debug!("removed vanished file {stale}");
                report.files_removed += 1;
            }
        }

        self.ingest_into(&mut report, changed, &cancel)?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "ingested {} of {} file(s) ({} unchanged, {} removed, {} failed) in {} ms",
            report.files_ingested,
            report.files_seen,
            report.files_unchanged,
            report.files_removed,
            report.failures.len(),
            report.elapsed_ms
        );
        Ok(report)
    }

    fn ingest_into(
        &self,
        report: &mut IngestionReport,
        mut sources: Vec<SourceFile>,
        cancel: &CancellationToken,
    ) -> IsgResult<()> {
        if sources.is_empty() {
            return Ok(());
        }
        sources.sort_by(|a, b| a.path.cmp(&b.path));

        let extracted = self.run_parallel(&sources, |source| extract_file(&source.path, &source.text));
        let mut ready: Vec<(&SourceFile, FileExtraction)> = Vec::new();
        for (source, result) in sources.iter().zip(extracted) {
            match result {
                Ok(extraction) => ready.push((source, extraction)),
                Err(e) => self.record_failure(report, &source.path, "extract", &e),
            }
        }

        let table = SymbolTable::build(self.db.l1_nodes()?, ready.iter().map(|(_, e)| e));
        debug!("symbol table holds {} addressable node(s)", table.len());

        let prepared = self.run_parallel(&ready, |(source, extraction)| {
            Ok(self.prepare(extraction, &source.text, &table, cancel))
        });
        for ((source, _), result) in ready.iter().zip(prepared) {
            let outcome = result.and_then(|prepared| self.commit(&report.run_id, prepared));
            match outcome {
                Ok(file) => report.absorb(file),
                Err(e) => self.record_failure(report, &source.path, "commit", &e),
            }
        }
        Ok(())
    }

    /// Map `job` over `items` in the bounded worker pool, falling back to
    /// sequential execution if the pool cannot be built.
    fn run_parallel<T, R, F>(&self, items: &[T], job: F) -> Vec<IsgResult<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> IsgResult<R> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.effective_workers().max(1))
            .build();
        match pool {
            Ok(pool) => pool.install(|| items.par_iter().map(&job).collect()),
            Err(e) => {
                warn!("worker pool unavailable, running sequentially: {e}");
                items.iter().map(&job).collect()
            }
        }
    }

    fn hydrate(
        &self,
        extraction: &FileExtraction,
        text: &str,
        cancel: &CancellationToken,
    ) -> IsgResult<HydrationOutcome> {
        let request = HydrationRequest {
            file_path: extraction.file_path.clone(),
            text: text.to_string(),
            hover_positions: extraction
                .items
                .iter()
                .filter(|i| i.owner.is_none())
                .map(|i| (i.name_line, i.name_column))
                .collect(),
            reference_positions: reference_positions(extraction),
        };
        hydrate_file(
            Arc::clone(&self.hydrator),
            request,
            Duration::from_millis(self.config.hydration_timeout_ms),
            cancel,
        )
    }

    /// Run the semantic pass and assemble the file's graph. Never fails:
    /// hydration problems only lower confidence.
    fn prepare(
        &self,
        extraction: &FileExtraction,
        text: &str,
        table: &SymbolTable,
        cancel: &CancellationToken,
    ) -> PreparedFile {
        let (hydration, degraded) = match self.hydrate(extraction, text, cancel) {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => (None, Some(e)),
        };
        let graph = build_file_graph(extraction, text, hydration.as_ref(), table, &self.config);
        let report = FileIngestReport {
            file_path: extraction.file_path.clone(),
            parse_error_count: extraction.parse_error_count,
            recovered_nodes: extraction.items.iter().filter(|i| i.recovered).count(),
            diagnostics: graph.diagnostics.len(),
            hydrated: hydration.is_some(),
            ..FileIngestReport::default()
        };
        PreparedFile {
            graph,
            report,
            degraded,
        }
    }

    fn commit(&self, run_id: &str, prepared: PreparedFile) -> IsgResult<FileIngestReport> {
        let PreparedFile {
            graph,
            mut report,
            degraded,
        } = prepared;
        if let Some(e) = degraded {
            self.log_event(run_id, &graph.file_path, "hydrate", &e);
        }
        let outcome = self.db.replace_file_graph(&graph)?;
        report.nodes_written = outcome.nodes_written;
        report.nodes_removed = outcome.nodes_removed;
        report.edges_written = outcome.edges_written;
        report.embeddings_computed = self.refresh_embeddings(&graph.file_path)?;
        debug!(
            "committed {} ({} nodes, {} edges, {} embeddings, epoch {})",
            graph.file_path,
            report.nodes_written,
            report.edges_written,
            report.embeddings_computed,
            outcome.cache_epoch
        );
        Ok(report)
    }

    /// Encode the file's nodes whose content hash has no embedding yet.
    fn refresh_embeddings(&self, file_path: &str) -> IsgResult<usize> {
        let identity = self.encoder.identity();
        let due = self.db.embeddings_due(identity, file_path)?;
        if due.is_empty() {
            return Ok(0);
        }
        let mut rows = Vec::with_capacity(due.len());
        for input in due {
            let vector = self.encoder.encode(&embedding_text(&input.node, &input.code))?;
            rows.push((input.node.id, input.node.content_hash, vector));
        }
        self.db.upsert_embeddings(identity, &rows)
    }

    fn log_event(&self, run_id: &str, file_path: &str, stage: &str, error: &IsgError) {
        let event = IngestionEvent {
            run_id: run_id.to_string(),
            file_path: Some(file_path.to_string()),
            stage: stage.to_string(),
            category: error.category().to_string(),
            message: error.to_string(),
        };
        if let Err(e) = self.db.record_ingestion_event(&event) {
            warn!("could not record ingestion event for {file_path}: {e}");
        }
    }

    fn record_failure(&self, report: &mut IngestionReport, file_path: &str, stage: &str, error: &IsgError) {
        warn!("ingestion of {file_path} failed at {stage}: {error}");
        self.log_event(&report.run_id, file_path, stage, error);
        report.failures.push(FileFailure {
            file_path: file_path.to_string(),
            stage: stage.to_string(),
            category: error.category().to_string(),
            message: error.to_string(),
        });
    }
}

/// Innermost addressable item whose line span covers the 1-based `line`.
fn innermost_at_line(extraction: &FileExtraction, line: usize) -> Option<usize> {
    extraction
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            item.owner.is_none() && item.span.start_line <= line && line <= item.span.end_line
        })
        .min_by_key(|(i, item)| (item.span.end_line - item.span.start_line, *i))
        .map(|(i, _)| i)
}

fn innermost_at_byte(extraction: &FileExtraction, byte: usize) -> Option<usize> {
    extraction
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            item.owner.is_none() && item.span.start_byte <= byte && byte <= item.span.end_byte
        })
        .min_by_key(|(i, item)| (item.span.len(), *i))
        .map(|(i, _)| i)
}

/// Assemble nodes, blobs, diagnostics and edges for one file.
pub fn build_file_graph(
    extraction: &FileExtraction,
    text: &str,
    hydration: Option<&HydrationOutcome>,
    table: &SymbolTable,
    config: &IsgConfig,
) -> FileGraph {
    let ids = extraction.node_ids();
    let file_path = extraction.file_path.as_str();
    let diagnostics_ok = hydration.is_some_and(|h| h.diagnostics.is_some());

    let mut nodes = Vec::with_capacity(extraction.items.len());
    let mut blobs = Vec::with_capacity(extraction.items.len());
    for (index, item) in extraction.items.iter().enumerate() {
        let touching = extraction
            .regions
            .iter()
            .filter(|r| r.touches(&item.span))
            .count() as u32;
        let first_line = item.span.start_line.saturating_sub(1) as u32;
        let last_line = item.span.end_line.saturating_sub(1) as u32;
        let outcome = PassOutcome {
            tolerant: true,
            exact: item.exact_signature.is_some(),
            hydration_symbols: hydration.is_some_and(|h| h.has_symbol(&item.name, first_line, last_line)),
            hydration_diagnostics: diagnostics_ok,
            recovered: item.recovered,
            parse_errors: touching,
        };
        let hydrated_signature = match (item.owner, hydration) {
            (None, Some(h)) => h.hovers.get(&(item.name_line, item.name_column)).cloned(),
            _ => None,
        };
        nodes.push(InterfaceNode {
            id: ids[index].clone(),
            file_path: file_path.to_string(),
            module_path: item.module_path.clone(),
            symbol: item.symbol.clone(),
            kind: item.kind,
            level: item.kind.level(),
            owner: item.owner.map(|o| ids[o].clone()),
            signature: item.signature.clone(),
            exact_signature: item.exact_signature.clone(),
            hydrated_signature,
            confidence: confidence::score(&config.confidence, &outcome),
            content_hash: content_hash(&item.code),
            parse_error_count: touching,
            span: item.span,
        });
        blobs.push(CodeBlob {
            node_id: ids[index].clone(),
            code: item.code.clone(),
            recovered: item.recovered,
            classification: item.classification,
        });
    }

    let mut diagnostics: Vec<(NodeId, Diagnostic)> = Vec::new();
    for region in &extraction.regions {
        if let Some(index) = innermost_at_byte(extraction, region.start_byte) {
            diagnostics.push((ids[index].clone(), region.to_diagnostic(file_path)));
        }
    }
    if let Some(reported) = hydration.and_then(|h| h.diagnostics.as_ref()) {
        for diagnostic in reported {
            let line = diagnostic.range.start_line as usize + 1;
            if let Some(index) = innermost_at_line(extraction, line) {
                diagnostics.push((ids[index].clone(), diagnostic.clone()));
            }
        }
    }

    let ctx = EdgeContext {
        table,
        hydration,
        keep_heuristic_edges: config.keep_heuristic_edges,
    };
    let edges = derive_edges(extraction, &ctx);

    FileGraph {
        file_path: file_path.to_string(),
        content_hash: content_hash(text),
        source_text: text.to_string(),
        parse_error_count: extraction.parse_error_count,
        nodes,
        edges,
        blobs,
        diagnostics,
    }
}
