//! Error types for the ISG core library.

use crate::models::{Diagnostic, NodeId};

/// Top-level error enum for the ISG core library.
#[derive(Debug, thiserror::Error)]
pub enum IsgError {
    /// Tolerant-pass failure. Normally absorbed into a parse-error count;
    /// only surfaced when the grammar itself cannot be loaded.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Hydration error: {0}")]
    Hydration(String),

    #[error(
        "Retrieval budget exceeded: {parameter}={requested} (maximum {maximum}); lower the request"
    )]
    RetrievalBudgetExceeded {
        parameter: &'static str,
        requested: usize,
        maximum: usize,
    },

    #[error("Preflight failed for {} node(s) with {} diagnostic(s)", node_ids.len(), diagnostics.len())]
    PreflightFailed {
        node_ids: Vec<NodeId>,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("Mutation conflict on {node_id}: {reason}")]
    MutationConflict { node_id: NodeId, reason: String },

    #[error("Apply failure, batch rolled back: {0}")]
    ApplyFailure(String),

    #[error("Node {0} is not validated; run preflight until it passes")]
    NotValidated(NodeId),

    #[error("Node {0} is a subordinate facet and cannot be addressed")]
    NotAddressable(NodeId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Invalid mutation transition: {0}")]
    InvalidTransition(String),

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("{0} was cancelled")]
    Cancelled(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IsgError {
    /// Whether the caller can reasonably retry the same operation (possibly
    /// after adjusting its inputs).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IsgError::Timeout { .. }
                | IsgError::Hydration(_)
                | IsgError::RetrievalBudgetExceeded { .. }
                | IsgError::MutationConflict { .. }
                | IsgError::PreflightFailed { .. }
                | IsgError::NotValidated(_)
        )
    }

    /// Short machine-readable category, used in event logs.
    pub fn category(&self) -> &'static str {
        match self {
            IsgError::Parse(_) => "parse",
            IsgError::Hydration(_) => "hydration",
            IsgError::RetrievalBudgetExceeded { .. } => "retrieval_budget",
            IsgError::PreflightFailed { .. } => "preflight_failed",
            IsgError::MutationConflict { .. } => "mutation_conflict",
            IsgError::ApplyFailure(_) => "apply_failure",
            IsgError::NotValidated(_) => "not_validated",
            IsgError::NotAddressable(_) => "not_addressable",
            IsgError::NodeNotFound(_) => "node_not_found",
            IsgError::InvalidTransition(_) => "invalid_transition",
            IsgError::Timeout { .. } => "timeout",
            IsgError::Cancelled(_) => "cancelled",
            IsgError::Config(_) => "config",
            IsgError::Database(_) | IsgError::Sqlite(_) => "database",
            IsgError::Io(_) => "io",
            IsgError::Json(_) => "json",
        }
    }
}

#[cfg(feature = "python")]
impl From<IsgError> for pyo3::PyErr {
    fn from(err: IsgError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
        match &err {
            IsgError::Database(_) | IsgError::Sqlite(_) | IsgError::ApplyFailure(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
            IsgError::Timeout { .. } => PyTimeoutError::new_err(err.to_string()),
            IsgError::Io(_) => PyIOError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

pub type IsgResult<T> = Result<T, IsgError>;
