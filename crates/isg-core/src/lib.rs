//! Interface Signature Graph core.
//!
//! Rust sources are ingested through a tolerant, exact and semantic pass
//! cascade into a graph of addressable interface nodes with code blobs and
//! embeddings. Retrieval mixes bounded graph expansion with vector search.
//! Every code change goes through the mutation engine: propose, preflight
//! against an in-memory overlay, then approve atomically or reject.
//!
//! With the `python` feature the crate also builds the `_isg_core`
//! extension module.

pub mod config;
pub mod deadline;
pub mod errors;
pub mod indexer;
pub mod logging;
pub mod models;
pub mod mutation;
pub mod query;
pub mod store;
pub mod workspace;

#[cfg(feature = "python")]
mod python;

pub use config::IsgConfig;
pub use errors::{IsgError, IsgResult};
pub use workspace::{Workspace, WorkspaceBuilder};
