pub mod context;
pub mod graph;
pub mod guards;
pub mod hybrid;
pub mod planner;
pub mod tokenizer;
pub mod vector;

pub use hybrid::{RankedNode, RetrievalEngine, RetrievalRequest};
