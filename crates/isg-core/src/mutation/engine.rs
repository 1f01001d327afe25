//! The single write surface: propose, preflight, approve, reject.
//!
//! Every operation takes the per-node locks of the ids it touches for its
//! whole duration. Approve commits the batch in one store transaction; when
//! a write root is configured the new file texts are staged next to their
//! targets before the commit and renamed into place after it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::deadline::CancellationToken;
use crate::errors::{IsgError, IsgResult};
use crate::indexer::symbols::test_path;
use crate::models::{
    BlobClass, FutureAction, MutationRecord, MutationState, NestingLevel, NodeId,
    PreflightState,
};
use crate::mutation::locks::LockTable;
use crate::mutation::overlay::{build_overlay, CandidateSet, PlannedChange};
use crate::mutation::state::{check_transition, Operation};
use crate::mutation::validation::{run_preflight, Validator};
use crate::store::{ApplyBatch, Database, FileWrite, PreflightVerdict};

const STAGED_SUFFIX: &str = "isg-staged";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PendingMutation {
    #[serde(flatten)]
    pub record: MutationRecord,
    pub state: MutationState,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PreflightReport {
    pub passed: bool,
    pub validator: String,
    pub records: Vec<MutationRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApprovalOutcome {
    pub node_ids: Vec<NodeId>,
    pub files: Vec<String>,
    pub cache_epoch: i64,
    /// Files renamed into place under the write root.
    pub written: Vec<String>,
    /// Files committed to the store but not written to disk.
    pub unwritten: Vec<String>,
}

pub struct MutationEngine {
    db: Database,
    validator: Arc<dyn Validator>,
    locks: LockTable,
    /// Serialises plan, commit and rename across approvals in this process.
    apply: Mutex<()>,
    preflight_timeout: Duration,
    write_root: Option<PathBuf>,
    cancel: CancellationToken,
}

fn sorted_unique(ids: &[NodeId]) -> IsgResult<Vec<NodeId>> {
    if ids.is_empty() {
        return Err(IsgError::InvalidTransition("no node ids given".to_string()));
    }
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    Ok(ids)
}

/// A workspace-relative path with no root, prefix or parent components.
fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn staged_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.{STAGED_SUFFIX}", std::process::id()))
}

impl MutationEngine {
    pub fn new(db: Database, validator: Arc<dyn Validator>, preflight_timeout: Duration) -> Self {
        Self {
            db,
            validator,
            locks: LockTable::new(),
            apply: Mutex::new(()),
            preflight_timeout,
            write_root: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Write approved file texts under `root` as well as into the store.
    pub fn with_write_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.write_root = Some(root.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Clean → Draft for one node.
    ///
    /// `Create` names a node that does not exist yet (its id carries the
    /// target file) and needs code; `Edit` needs code; `Delete` takes none.
    pub fn propose(
        &self,
        node_id: &NodeId,
        action: FutureAction,
        future_code: Option<String>,
    ) -> IsgResult<MutationRecord> {
        let _guard = self.locks.try_acquire(std::slice::from_ref(node_id))?;
        let existing = self.db.get_mutation(node_id)?;
        check_transition(node_id, existing.as_ref(), Operation::Propose)?;

        let mut record = match action {
            FutureAction::None => {
                return Err(IsgError::InvalidTransition(
                    "propose needs create, edit or delete".to_string(),
                ))
            }
            FutureAction::Create => {
                let key = node_id
                    .key()
                    .ok_or_else(|| IsgError::NodeNotFound(node_id.clone()))?;
                if key.kind.level() != NestingLevel::L1 {
                    return Err(IsgError::NotAddressable(node_id.clone()));
                }
                if !is_safe_relative(&key.file_path) {
                    return Err(IsgError::InvalidTransition(format!(
                        "{} is not a workspace-relative path",
                        key.file_path
                    )));
                }
                if self.db.get_node(node_id)?.is_some() {
                    return Err(IsgError::InvalidTransition(format!(
                        "{node_id} already exists; propose an edit instead"
                    )));
                }
                let classification = if test_path(&key.file_path) {
                    BlobClass::Test
                } else {
                    BlobClass::Implementation
                };
                MutationRecord::clean(node_id.clone(), key.file_path, None, classification)
            }
            FutureAction::Edit | FutureAction::Delete => {
                let node = self
                    .db
                    .get_node(node_id)?
                    .ok_or_else(|| IsgError::NodeNotFound(node_id.clone()))?;
                if !node.is_addressable() {
                    return Err(IsgError::NotAddressable(node_id.clone()));
                }
                let blob = self
                    .db
                    .get_blob(node_id)?
                    .ok_or_else(|| IsgError::NodeNotFound(node_id.clone()))?;
                MutationRecord::clean(
                    node_id.clone(),
                    node.file_path,
                    Some(blob.code),
                    blob.classification,
                )
            }
        };

        match (action, &future_code) {
            (FutureAction::Delete, Some(_)) => {
                return Err(IsgError::InvalidTransition(
                    "delete takes no future code".to_string(),
                ))
            }
            (FutureAction::Create | FutureAction::Edit, None) => {
                return Err(IsgError::InvalidTransition(format!(
                    "{action} needs future code"
                )))
            }
            _ => {}
        }
        record.future_action = action;
        record.future_present = action != FutureAction::Delete;
        record.future_code = future_code;

        self.db.insert_draft(&record)?;
        info!("proposed {action} on {node_id}");
        Ok(record)
    }

    fn load_checked(&self, ids: &[NodeId], operation: Operation) -> IsgResult<Vec<MutationRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let record = self.db.get_mutation(id)?;
            check_transition(id, record.as_ref(), operation)?;
            if let Some(record) = record {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Candidate texts for `records` against the store's current files.
    fn plan(&self, records: &[MutationRecord]) -> IsgResult<CandidateSet> {
        let mut base = BTreeMap::new();
        let mut changes = Vec::with_capacity(records.len());
        for record in records {
            if !base.contains_key(&record.file_path) {
                if let Some(text) = self.db.file_text(&record.file_path)? {
                    base.insert(record.file_path.clone(), text);
                }
            }
            let span = match record.future_action {
                FutureAction::Create => None,
                _ => self.db.get_node(&record.node_id)?.map(|n| n.span),
            };
            changes.push(PlannedChange {
                record: record.clone(),
                span,
            });
        }
        build_overlay(&base, &changes)
    }

    /// Validate the batch's overlay and record Pass/Fail on every record.
    ///
    /// A timeout or cancellation leaves the records as they were.
    pub fn preflight(&self, node_ids: &[NodeId]) -> IsgResult<PreflightReport> {
        let cancel = self.cancel.scoped();
        let ids = sorted_unique(node_ids)?;
        let _guard = self.locks.try_acquire(&ids)?;
        let records = self.load_checked(&ids, Operation::Preflight)?;
        let candidates = self.plan(&records)?;
        let base_hashes = candidates.base_hashes.clone();

        let outcome = run_preflight(
            Arc::clone(&self.validator),
            candidates,
            self.preflight_timeout,
            &cancel,
        )?;

        let verdict = if outcome.passed {
            PreflightState::Passed
        } else {
            PreflightState::Failed
        };
        let verdicts: Vec<PreflightVerdict> = records
            .iter()
            .map(|record| PreflightVerdict {
                node_id: record.node_id.clone(),
                state: verdict,
                diagnostics: outcome
                    .diagnostics
                    .iter()
                    .filter(|d| d.file_path == record.file_path)
                    .cloned()
                    .collect(),
                base_hash: base_hashes.get(&record.file_path).cloned().flatten(),
            })
            .collect();
        self.db.record_preflight(&verdicts)?;

        let mut updated = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(record) = self.db.get_mutation(id)? {
                updated.push(record);
            }
        }
        Ok(PreflightReport {
            passed: outcome.passed,
            validator: self.validator.name().to_string(),
            records: updated,
        })
    }

    pub fn approve(&self, node_ids: &[NodeId]) -> IsgResult<ApprovalOutcome> {
        self.approve_with_hook(node_ids, &mut |_| Ok(()))
    }

    /// Approve with `before_flip` run inside the commit ahead of each
    /// record's flip; an error from it rolls the whole batch back.
    ///
    /// Every file must still hold the text the batch was preflighted on;
    /// otherwise the approve is a `MutationConflict` and the caller must
    /// preflight again.
    pub fn approve_with_hook(
        &self,
        node_ids: &[NodeId],
        before_flip: &mut dyn FnMut(&MutationRecord) -> IsgResult<()>,
    ) -> IsgResult<ApprovalOutcome> {
        let ids = sorted_unique(node_ids)?;
        let _guard = self.locks.try_acquire(&ids)?;

        let mut records = Vec::with_capacity(ids.len());
        let mut failed_ids = Vec::new();
        let mut failed_diagnostics = Vec::new();
        for id in &ids {
            let record = self.db.get_mutation(id)?;
            match check_transition(id, record.as_ref(), Operation::Approve) {
                Ok(()) => records.extend(record),
                Err(IsgError::PreflightFailed {
                    node_ids,
                    diagnostics,
                }) => {
                    failed_ids.extend(node_ids);
                    failed_diagnostics.extend(diagnostics);
                }
                Err(err) => return Err(err),
            }
        }
        if !failed_ids.is_empty() {
            return Err(IsgError::PreflightFailed {
                node_ids: failed_ids,
                diagnostics: failed_diagnostics,
            });
        }

        let _apply = self.apply.lock();
        let candidates = self.plan(&records)?;
        for record in &records {
            if record.validated_base_hash != candidates.base_hash(&record.file_path) {
                return Err(IsgError::MutationConflict {
                    node_id: record.node_id.clone(),
                    reason: format!(
                        "{} changed since preflight; run preflight again",
                        record.file_path
                    ),
                });
            }
        }
        let files: Vec<String> = candidates.files.keys().cloned().collect();
        let staged = self.stage(&candidates)?;
        let writes = candidates
            .files
            .iter()
            .map(|(path, text)| FileWrite {
                path: path.clone(),
                base_hash: candidates.base_hash(path),
                text: text.clone(),
            })
            .collect();
        let batch = ApplyBatch {
            records,
            files: writes,
        };

        let cache_epoch = match self.db.apply_mutations(&batch, before_flip) {
            Ok(epoch) => epoch,
            Err(err) => {
                for (temp, _) in &staged {
                    let _ = std::fs::remove_file(temp);
                }
                warn!("approve of {} node(s) rolled back: {err}", ids.len());
                return Err(match err {
                    IsgError::NotValidated(_)
                    | IsgError::ApplyFailure(_)
                    | IsgError::MutationConflict { .. } => err,
                    other => IsgError::ApplyFailure(other.to_string()),
                });
            }
        };

        let mut written = Vec::new();
        let mut unwritten = Vec::new();
        for (temp, target) in staged {
            let relative = target
                .strip_prefix(self.write_root.as_deref().unwrap_or(Path::new("")))
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| target.to_string_lossy().into_owned());
            match std::fs::rename(&temp, &target) {
                Ok(()) => written.push(relative),
                Err(err) => {
                    warn!("approved {relative} committed but not written: {err}");
                    let _ = std::fs::remove_file(&temp);
                    unwritten.push(relative);
                }
            }
        }
        info!(
            "approved {} node(s) across {} file(s) at epoch {cache_epoch}",
            ids.len(),
            files.len()
        );
        Ok(ApprovalOutcome {
            node_ids: ids,
            files,
            cache_epoch,
            written,
            unwritten,
        })
    }

    /// Write every candidate file next to its target. Nothing is staged
    /// without a write root.
    fn stage(&self, candidates: &CandidateSet) -> IsgResult<Vec<(PathBuf, PathBuf)>> {
        let Some(root) = &self.write_root else {
            return Ok(Vec::new());
        };
        let mut staged = Vec::with_capacity(candidates.len());
        for (path, text) in &candidates.files {
            if !is_safe_relative(path) {
                return Err(IsgError::ApplyFailure(format!(
                    "{path} is not a workspace-relative path"
                )));
            }
            let target = root.join(path);
            let temp = staged_path(&target);
            let written = target
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::write(&temp, text));
            if let Err(err) = written {
                for (temp, _) in &staged {
                    let _ = std::fs::remove_file(temp);
                }
                return Err(IsgError::ApplyFailure(format!("staging {path}: {err}")));
            }
            debug!("staged {}", temp.display());
            staged.push((temp, target));
        }
        Ok(staged)
    }

    /// Discard the pending change of every id. All ids must have one.
    pub fn reject(&self, node_ids: &[NodeId]) -> IsgResult<usize> {
        let ids = sorted_unique(node_ids)?;
        let _guard = self.locks.try_acquire(&ids)?;
        self.load_checked(&ids, Operation::Reject)?;
        let cleared = self.db.clear_mutations(&ids)?;
        info!("rejected {cleared} pending change(s)");
        Ok(cleared)
    }

    pub fn pending(&self) -> IsgResult<Vec<PendingMutation>> {
        Ok(self
            .db
            .pending_mutations()?
            .into_iter()
            .map(|record| PendingMutation {
                state: record.state(),
                record,
            })
            .collect())
    }

    pub fn mutation(&self, node_id: &NodeId) -> IsgResult<Option<MutationRecord>> {
        self.db.get_mutation(node_id)
    }
}
