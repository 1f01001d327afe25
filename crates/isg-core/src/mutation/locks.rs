//! Per-node ownership tokens for the mutation engine.
//!
//! An operation takes every node it touches up front; if any of them is
//! already held the whole acquisition fails with `MutationConflict` instead
//! of waiting, so concurrent writers are rejected rather than queued.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{IsgError, IsgResult};
use crate::models::NodeId;

#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashSet<NodeId>>,
}

/// Releases its nodes when dropped.
#[derive(Debug)]
pub struct NodeLockGuard<'a> {
    table: &'a LockTable,
    ids: Vec<NodeId>,
}

impl NodeLockGuard<'_> {
    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }
}

impl Drop for NodeLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.table.held.lock();
        for id in &self.ids {
            held.remove(id);
        }
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all of `ids` or none of them. Duplicates are collapsed and the
    /// guard lists the ids in sorted order.
    pub fn try_acquire(&self, ids: &[NodeId]) -> IsgResult<NodeLockGuard<'_>> {
        let mut wanted: Vec<NodeId> = ids.to_vec();
        wanted.sort();
        wanted.dedup();

        let mut held = self.held.lock();
        if let Some(busy) = wanted.iter().find(|id| held.contains(*id)) {
            debug!("lock on {busy} is held by another operation");
            return Err(IsgError::MutationConflict {
                node_id: busy.clone(),
                reason: "another operation on this node is in progress".to_string(),
            });
        }
        held.extend(wanted.iter().cloned());
        Ok(NodeLockGuard {
            table: self,
            ids: wanted,
        })
    }

    pub fn is_held(&self, id: &NodeId) -> bool {
        self.held.lock().contains(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let table = LockTable::new();
        let guard = table.try_acquire(&ids(&["b", "a", "a"])).unwrap();
        assert_eq!(guard.ids(), ids(&["a", "b"]).as_slice());

        let err = table.try_acquire(&ids(&["c", "b"])).unwrap_err();
        assert!(matches!(err, IsgError::MutationConflict { ref node_id, .. } if node_id.as_str() == "b"));
        assert!(!table.is_held(&NodeId::from("c")));

        drop(guard);
        assert!(!table.is_held(&NodeId::from("a")));
        assert!(table.try_acquire(&ids(&["c", "b"])).is_ok());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let table = Arc::new(LockTable::new());
        let barrier = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    barrier.wait();
                    if let Ok(guard) = table.try_acquire(&[NodeId::from("shared")]) {
                        winners.fetch_add(1, Ordering::SeqCst);
                        // Hold until every thread has tried.
                        std::thread::sleep(std::time::Duration::from_millis(200));
                        drop(guard);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
