//! Candidate file texts: the current source with proposed changes applied.
//!
//! The overlay lives in memory only. Validation runs against it and approve
//! commits it; the workspace files are never touched here.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::{IsgError, IsgResult};
use crate::models::{content_hash, FutureAction, MutationRecord, NodeId, Span};

/// One in-flight record plus the span its node occupies in the current
/// file text (`None` for a create).
#[derive(Clone, Debug)]
pub struct PlannedChange {
    pub record: MutationRecord,
    pub span: Option<Span>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CandidateSet {
    /// Candidate text per touched file, by path.
    pub files: BTreeMap<String, String>,
    /// Node ids changed in each touched file.
    pub touched: BTreeMap<String, Vec<NodeId>>,
    /// Content hash of the base text each candidate was built from; `None`
    /// for a file that does not exist yet.
    pub base_hashes: BTreeMap<String, Option<String>>,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn nodes_in(&self, file_path: &str) -> &[NodeId] {
        self.touched.get(file_path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn base_hash(&self, file_path: &str) -> Option<String> {
        self.base_hashes.get(file_path).cloned().flatten()
    }
}

fn conflict(id: &NodeId, reason: impl Into<String>) -> IsgError {
    IsgError::MutationConflict {
        node_id: id.clone(),
        reason: reason.into(),
    }
}

/// Apply `changes` to the `base` texts of their files.
///
/// Edits and deletes must find their node's span holding exactly the
/// record's `current_code`, and no two spans in one file may overlap;
/// either failure is a `MutationConflict`. Creates are appended to the end
/// of their file in node id order.
pub fn build_overlay(
    base: &BTreeMap<String, String>,
    changes: &[PlannedChange],
) -> IsgResult<CandidateSet> {
    let mut by_file: BTreeMap<&str, Vec<&PlannedChange>> = BTreeMap::new();
    for change in changes {
        by_file
            .entry(change.record.file_path.as_str())
            .or_default()
            .push(change);
    }

    let mut candidates = CandidateSet::default();
    for (path, mut file_changes) in by_file {
        let base_text = base.get(path);
        let original = base_text.map(String::as_str).unwrap_or("");
        file_changes.sort_by(|a, b| a.record.node_id.cmp(&b.record.node_id));

        let mut splices: Vec<(usize, usize, &str, &NodeId)> = Vec::new();
        let mut appended: Vec<&str> = Vec::new();
        for change in &file_changes {
            let record = &change.record;
            let id = &record.node_id;
            match record.future_action {
                FutureAction::None => {
                    return Err(IsgError::InvalidTransition(format!(
                        "{id} has no pending change"
                    )))
                }
                FutureAction::Create => {
                    let code = record
                        .future_code
                        .as_deref()
                        .ok_or_else(|| conflict(id, "create without code"))?;
                    appended.push(code);
                }
                FutureAction::Edit | FutureAction::Delete => {
                    let span = change
                        .span
                        .as_ref()
                        .ok_or_else(|| conflict(id, "node is no longer in the store"))?;
                    let current = original.get(span.start_byte..span.end_byte);
                    if current.is_none() || current != record.current_code.as_deref() {
                        return Err(conflict(id, "file changed since the change was proposed"));
                    }
                    let replacement = match record.future_action {
                        FutureAction::Edit => record.future_code.as_deref().unwrap_or(""),
                        _ => "",
                    };
                    splices.push((span.start_byte, span.end_byte, replacement, id));
                }
            }
        }

        splices.sort_by_key(|(start, end, _, _)| (*start, *end));
        for pair in splices.windows(2) {
            let (_, prev_end, _, prev_id) = pair[0];
            let (next_start, _, _, next_id) = pair[1];
            if next_start < prev_end {
                return Err(conflict(
                    next_id,
                    format!("overlaps the change to {prev_id}"),
                ));
            }
        }

        let mut text = String::with_capacity(original.len());
        let mut cursor = 0;
        for (start, end, replacement, _) in &splices {
            text.push_str(&original[cursor..*start]);
            text.push_str(replacement);
            cursor = *end;
        }
        text.push_str(&original[cursor..]);
        for code in appended {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(code.trim_end_matches('\n'));
            text.push('\n');
        }

        candidates.touched.insert(
            path.to_string(),
            file_changes.iter().map(|c| c.record.node_id.clone()).collect(),
        );
        candidates.files.insert(path.to_string(), text);
        candidates
            .base_hashes
            .insert(path.to_string(), base_text.map(|t| content_hash(t)));
    }
    Ok(candidates)
}
