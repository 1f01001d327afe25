//! Mutation state machine: which operation may run from which state.
//!
//! ```text
//! Clean --propose--> Draft --preflight--> ValidatedPass | ValidatedFail
//! ValidatedPass --approve--> Clean (current_code replaced)
//! Draft | Validated* --reject--> Clean (future discarded)
//! Validated* --preflight--> Validated*  (re-run)
//! ```

use crate::errors::{IsgError, IsgResult};
use crate::models::{MutationRecord, MutationState, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Propose,
    Preflight,
    Approve,
    Reject,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Propose => "propose",
            Operation::Preflight => "preflight",
            Operation::Approve => "approve",
            Operation::Reject => "reject",
        }
    }
}

pub fn state_of(record: Option<&MutationRecord>) -> MutationState {
    record.map_or(MutationState::Clean, MutationRecord::state)
}

/// Check that `operation` may run on `id` in its current state.
///
/// Approving a record whose preflight failed reports `PreflightFailed` with
/// the recorded diagnostics; approving an unvalidated draft reports
/// `NotValidated`.
pub fn check_transition(
    id: &NodeId,
    record: Option<&MutationRecord>,
    operation: Operation,
) -> IsgResult<()> {
    let state = state_of(record);
    match (operation, state) {
        (Operation::Propose, MutationState::Clean) => Ok(()),
        (Operation::Propose, _) => Err(IsgError::MutationConflict {
            node_id: id.clone(),
            reason: format!("a change is already in flight ({})", state.as_str()),
        }),
        (Operation::Approve, MutationState::ValidatedPass) => Ok(()),
        (Operation::Approve, MutationState::ValidatedFail) => Err(IsgError::PreflightFailed {
            node_ids: vec![id.clone()],
            diagnostics: record.map(|r| r.diagnostics.clone()).unwrap_or_default(),
        }),
        (Operation::Approve, MutationState::Draft) => Err(IsgError::NotValidated(id.clone())),
        (Operation::Preflight | Operation::Reject, state) if state != MutationState::Clean => Ok(()),
        (operation, state) => Err(IsgError::InvalidTransition(format!(
            "cannot {} {id}: it is {}",
            operation.as_str(),
            state.as_str()
        ))),
    }
}
