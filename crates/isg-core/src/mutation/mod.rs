pub mod engine;
pub mod locks;
pub mod overlay;
pub mod state;
pub mod validation;

pub use engine::{ApprovalOutcome, MutationEngine, PendingMutation, PreflightReport};
pub use validation::{SyntaxValidator, ValidationOutcome, Validator};
