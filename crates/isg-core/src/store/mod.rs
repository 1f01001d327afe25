pub mod database;
pub mod schema;

pub use database::{
    ApplyBatch, Database, EmbeddingInput, FileWrite, IngestionEvent, PreflightVerdict, ReplaceOutcome,
};
