pub mod confidence;
pub mod edges;
pub mod embedding;
pub mod filesystem;
pub mod hydration;
pub mod parser;
pub mod pipeline;
pub mod signature;
pub mod symbols;
