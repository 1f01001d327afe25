//! Python bindings: a `Workspace` class whose results come back as JSON.

use std::path::PathBuf;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use serde::Serialize;

use crate::config::IsgConfig;
use crate::errors::IsgError;
use crate::models::{FutureAction, NodeFilter, NodeId};
use crate::query::guards;
use crate::query::hybrid::RetrievalRequest;
use crate::workspace::Workspace;

fn to_json<T: Serialize>(value: &T) -> PyResult<String> {
    serde_json::to_string(value).map_err(|e| IsgError::from(e).into())
}

fn ids(node_ids: Vec<String>) -> Vec<NodeId> {
    node_ids.into_iter().map(NodeId::from).collect()
}

#[pyclass(name = "Workspace")]
pub struct PyWorkspace {
    inner: Workspace,
}

#[pymethods]
impl PyWorkspace {
    /// Open `root`; `config_path` names an optional JSON config. `ISG_*`
    /// environment overrides apply either way.
    #[new]
    #[pyo3(signature = (root, config_path=None))]
    fn new(root: PathBuf, config_path: Option<PathBuf>) -> PyResult<Self> {
        let mut config = match config_path {
            Some(path) => IsgConfig::load(&path)?,
            None => IsgConfig::default(),
        };
        config.apply_env()?;
        Ok(Self {
            inner: Workspace::open(root, config)?,
        })
    }

    fn ingest(&self, py: Python<'_>) -> PyResult<String> {
        let report = py.allow_threads(|| self.inner.ingest())?;
        to_json(&report)
    }

    fn ingest_file(&self, py: Python<'_>, file_path: &str, text: &str) -> PyResult<String> {
        let report = py.allow_threads(|| self.inner.ingest_file(file_path, text))?;
        to_json(&report)
    }

    fn node(&self, node_id: &str) -> PyResult<Option<String>> {
        self.inner
            .node(&NodeId::from(node_id))?
            .map(|node| to_json(&node))
            .transpose()
    }

    #[pyo3(signature = (seeds, query=None, hop_limit=None, cap_per_hop=None, k=None, confidence_floor=None, path_prefix=None))]
    #[allow(clippy::too_many_arguments)]
    fn retrieve(
        &self,
        py: Python<'_>,
        seeds: Vec<String>,
        query: Option<String>,
        hop_limit: Option<usize>,
        cap_per_hop: Option<usize>,
        k: Option<usize>,
        confidence_floor: Option<f64>,
        path_prefix: Option<String>,
    ) -> PyResult<String> {
        let request = RetrievalRequest {
            seeds: ids(seeds),
            query,
            hop_limit,
            cap_per_hop,
            k,
            confidence_floor,
            filter: NodeFilter {
                path_prefix,
                ..NodeFilter::default()
            },
        };
        let ranked = py.allow_threads(|| self.inner.retrieve(&request))?;
        to_json(&ranked)
    }

    /// `request_json` is a serialized retrieval request; omitted fields take
    /// their defaults.
    #[pyo3(signature = (request_json, token_budget=8000, signatures_only=false))]
    fn context(
        &self,
        py: Python<'_>,
        request_json: &str,
        token_budget: usize,
        signatures_only: bool,
    ) -> PyResult<String> {
        let request: RetrievalRequest =
            serde_json::from_str(request_json).map_err(IsgError::from)?;
        let bundle =
            py.allow_threads(|| self.inner.context(&request, token_budget, signatures_only))?;
        to_json(&bundle)
    }

    #[pyo3(signature = (node_id, action, future_code=None))]
    fn propose(&self, node_id: &str, action: &str, future_code: Option<String>) -> PyResult<String> {
        let action = FutureAction::parse(action)
            .filter(|a| *a != FutureAction::None)
            .ok_or_else(|| PyValueError::new_err(format!("unknown action {action:?}")))?;
        let record = self
            .inner
            .propose(&NodeId::from(node_id), action, future_code)?;
        to_json(&record)
    }

    fn preflight(&self, py: Python<'_>, node_ids: Vec<String>) -> PyResult<String> {
        let node_ids = ids(node_ids);
        let report = py.allow_threads(|| self.inner.preflight(&node_ids))?;
        to_json(&report)
    }

    fn approve(&self, py: Python<'_>, node_ids: Vec<String>) -> PyResult<String> {
        let node_ids = ids(node_ids);
        let report = py.allow_threads(|| self.inner.approve(&node_ids))?;
        to_json(&report)
    }

    fn reject(&self, node_ids: Vec<String>) -> PyResult<usize> {
        Ok(self.inner.reject(&ids(node_ids))?)
    }

    fn pending(&self) -> PyResult<String> {
        to_json(&self.inner.pending()?)
    }

    fn mutation(&self, node_id: &str) -> PyResult<Option<String>> {
        self.inner
            .mutation(&NodeId::from(node_id))?
            .map(|record| to_json(&record))
            .transpose()
    }

    fn cache_stats(&self) -> PyResult<String> {
        to_json(&self.inner.cache_stats())
    }

    /// Abandon in-flight hydration and preflight calls.
    fn cancel(&self) {
        self.inner.cancellation_token().cancel();
    }
}

#[pyfunction]
fn estimate_tokens(text: &str) -> usize {
    crate::query::tokenizer::estimate_tokens(text)
}

#[pymodule]
#[pyo3(name = "_isg_core")]
fn isg_core_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    crate::logging::init_tracing();

    m.add_class::<PyWorkspace>()?;
    m.add_function(wrap_pyfunction!(estimate_tokens, m)?)?;

    m.add("MAX_HOP_LIMIT", guards::MAX_HOP_LIMIT)?;
    m.add("MAX_CAP_PER_HOP", guards::MAX_CAP_PER_HOP)?;
    m.add("MAX_K", guards::MAX_K)?;
    m.add("MAX_SEEDS", guards::MAX_SEEDS)?;
    m.add("MAX_QUERY_LENGTH", guards::MAX_QUERY_LENGTH)?;
    m.add("MAX_CONTEXT_TOKEN_BUDGET", guards::MAX_CONTEXT_TOKEN_BUDGET)?;
    Ok(())
}
