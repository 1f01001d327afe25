//! Consumer-facing facade over one store: ingest, retrieve, and the
//! propose/preflight/approve/reject mutation cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::config::IsgConfig;
use crate::deadline::CancellationToken;
use crate::errors::{IsgError, IsgResult};
use crate::indexer::embedding::{EmbeddingEncoder, HashingEncoder};
use crate::indexer::filesystem::SourceFile;
use crate::indexer::hydration::{NullHydrator, SemanticHydrator};
use crate::indexer::pipeline::{FileIngestReport, IngestionPipeline, IngestionReport};
use crate::models::{FutureAction, InterfaceNode, MutationRecord, NodeId};
use crate::mutation::{
    ApprovalOutcome, MutationEngine, PendingMutation, PreflightReport, SyntaxValidator, Validator,
};
use crate::query::context::{assemble_context, ContextBundle};
use crate::query::hybrid::{RankedNode, RetrievalEngine, RetrievalRequest};
use crate::query::planner::CacheStats;
use crate::store::Database;

/// Store location under a workspace root.
pub const STORE_DIR: &str = ".isg";
pub const STORE_FILE: &str = "isg.db";

/// An approval plus the re-ingestion of the files it rewrote.
#[derive(Clone, Debug, Serialize)]
pub struct ApprovalReport {
    pub approval: ApprovalOutcome,
    pub reingest: IngestionReport,
}

pub struct WorkspaceBuilder {
    root: Option<PathBuf>,
    db_path: Option<PathBuf>,
    config: IsgConfig,
    hydrator: Arc<dyn SemanticHydrator>,
    encoder: Arc<dyn EmbeddingEncoder>,
    validator: Arc<dyn Validator>,
    cancel: CancellationToken,
}

impl Default for WorkspaceBuilder {
    fn default() -> Self {
        Self {
            root: None,
            db_path: None,
            config: IsgConfig::default(),
            hydrator: Arc::new(NullHydrator),
            encoder: Arc::new(HashingEncoder::default()),
            validator: Arc::new(SyntaxValidator),
            cancel: CancellationToken::new(),
        }
    }
}

impl WorkspaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workspace root. The store defaults to `<root>/.isg/isg.db`.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn config(mut self, config: IsgConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hydrator(mut self, hydrator: Arc<dyn SemanticHydrator>) -> Self {
        self.hydrator = hydrator;
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn EmbeddingEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> IsgResult<Workspace> {
        self.config.validate()?;
        let db_path = match (&self.db_path, &self.root) {
            (Some(path), _) => path.clone(),
            (None, Some(root)) => root.join(STORE_DIR).join(STORE_FILE),
            (None, None) => {
                return Err(IsgError::Config(
                    "a workspace needs a root or a store path".to_string(),
                ))
            }
        };
        let db = Database::open(&db_path)?;

        let pipeline = IngestionPipeline::new(
            db.clone(),
            self.config.clone(),
            self.hydrator,
            Arc::clone(&self.encoder),
        )
        .with_cancellation(self.cancel.clone());
        let retrieval = RetrievalEngine::new(db.clone(), self.encoder, self.config.retrieval.clone());
        let mut mutations = MutationEngine::new(
            db.clone(),
            self.validator,
            Duration::from_millis(self.config.preflight_timeout_ms),
        )
        .with_cancellation(self.cancel.clone());
        if let (Some(root), true) = (&self.root, self.config.write_through) {
            mutations = mutations.with_write_root(root.clone());
        }
        info!("workspace store at {}", db.path().display());

        Ok(Workspace {
            root: self.root,
            db,
            pipeline,
            retrieval,
            mutations,
            cancel: self.cancel,
        })
    }
}

pub struct Workspace {
    root: Option<PathBuf>,
    db: Database,
    pipeline: IngestionPipeline,
    retrieval: RetrievalEngine,
    mutations: MutationEngine,
    cancel: CancellationToken,
}

impl Workspace {
    pub fn builder() -> WorkspaceBuilder {
        WorkspaceBuilder::new()
    }

    /// Open `root` with its default store, analyzers and validator.
    pub fn open(root: impl Into<PathBuf>, config: IsgConfig) -> IsgResult<Self> {
        WorkspaceBuilder::new().root(root).config(config).build()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &IsgConfig {
        self.pipeline.config()
    }

    /// Cancelling this token abandons the hydration and preflight calls in
    /// flight at that moment; later calls run normally.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // -- Ingestion ----------------------------------------------------------

    /// Scan the workspace root: ingest new and changed files, drop vanished
    /// ones.
    pub fn ingest(&self) -> IsgResult<IngestionReport> {
        let root = self
            .root
            .as_deref()
            .ok_or_else(|| IsgError::Config("ingest needs a workspace root".to_string()))?;
        self.pipeline.ingest_workspace(root)
    }

    pub fn ingest_file(&self, file_path: &str, text: &str) -> IsgResult<FileIngestReport> {
        self.pipeline.ingest_file(file_path, text)
    }

    pub fn ingest_files(&self, sources: Vec<SourceFile>) -> IsgResult<IngestionReport> {
        self.pipeline.ingest_files(sources)
    }

    // -- Retrieval ----------------------------------------------------------

    pub fn node(&self, id: &NodeId) -> IsgResult<Option<InterfaceNode>> {
        self.db.get_node(id)
    }

    pub fn retrieve(&self, request: &RetrievalRequest) -> IsgResult<Vec<RankedNode>> {
        self.retrieval.retrieve(request)
    }

    /// Retrieve, then pack the seeds and results into a context bundle.
    pub fn context(
        &self,
        request: &RetrievalRequest,
        token_budget: usize,
        signatures_only: bool,
    ) -> IsgResult<ContextBundle> {
        let ranked = self.retrieval.retrieve(request)?;
        assemble_context(&self.db, &request.seeds, &ranked, token_budget, signatures_only)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.retrieval.cache_stats()
    }

    // -- Mutation -----------------------------------------------------------

    pub fn propose(
        &self,
        node_id: &NodeId,
        action: FutureAction,
        future_code: Option<String>,
    ) -> IsgResult<MutationRecord> {
        self.mutations.propose(node_id, action, future_code)
    }

    pub fn preflight(&self, node_ids: &[NodeId]) -> IsgResult<PreflightReport> {
        self.mutations.preflight(node_ids)
    }

    pub fn approve(&self, node_ids: &[NodeId]) -> IsgResult<ApprovalReport> {
        self.approve_with_hook(node_ids, &mut |_| Ok(()))
    }

    /// Approve, then re-ingest the rewritten files from their committed text
    /// so the graph reflects the new current state.
    pub fn approve_with_hook(
        &self,
        node_ids: &[NodeId],
        before_flip: &mut dyn FnMut(&MutationRecord) -> IsgResult<()>,
    ) -> IsgResult<ApprovalReport> {
        let approval = self.mutations.approve_with_hook(node_ids, before_flip)?;
        let mut sources = Vec::with_capacity(approval.files.len());
        for path in &approval.files {
            if let Some(text) = self.db.file_text(path)? {
                sources.push(SourceFile {
                    path: path.clone(),
                    text,
                });
            }
        }
        let reingest = self.pipeline.ingest_files(sources)?;
        Ok(ApprovalReport { approval, reingest })
    }

    pub fn reject(&self, node_ids: &[NodeId]) -> IsgResult<usize> {
        self.mutations.reject(node_ids)
    }

    pub fn pending(&self) -> IsgResult<Vec<PendingMutation>> {
        self.mutations.pending()
    }

    pub fn mutation(&self, node_id: &NodeId) -> IsgResult<Option<MutationRecord>> {
        self.mutations.mutation(node_id)
    }
}
