//! An in-memory state machine and storage implementation for demo and
//! testing purposes related to `raft-member`.
//!
//! [`MemState`] is a trivial accumulator state machine; [`MemStorage`]
//! keeps the persistent state in memory and counts writes, which lets a
//! test harness assert the persistence discipline (no vote grant, no
//! append acknowledgment, no snapshot acknowledgment before the
//! corresponding write completed).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use raft_member::storage::PersistentState;
use raft_member::storage::RaftStorage;
use raft_member::ReplicatedState;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The state machine type which `MemStorage` works with: a single signed
/// accumulator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemState {
    /// The accumulated value.
    pub value: i64,
}

/// An operation on [`MemState`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemChange {
    /// Add the given amount to the value.
    Add(i64),
}

impl ReplicatedState for MemState {
    type Change = MemChange;

    fn apply(&mut self, change: &Self::Change) {
        match change {
            MemChange::Add(n) => self.value += n,
        }
    }
}

/// An in-memory storage system implementing the `RaftStorage` port.
#[derive(Default)]
pub struct MemStorage {
    /// The most recently written persistent state.
    persisted: RwLock<Option<PersistentState<MemState>>>,
    /// The number of completed writes.
    write_count: AtomicU64,
    /// When set, the next write fails, emulating a dying disk.
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemStorage {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently written persistent state, if any write completed.
    pub async fn persisted(&self) -> Option<PersistentState<MemState>> {
        self.persisted.read().await.clone()
    }

    /// The number of writes completed so far.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Make all subsequent writes fail, emulating a dying disk.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RaftStorage<MemState> for MemStorage {
    #[tracing::instrument(level = "trace", skip(self, ps))]
    async fn write_persistent_state(&self, ps: &PersistentState<MemState>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("storage failure injected by test"));
        }
        let mut persisted = self.persisted.write().await;
        *persisted = Some(ps.clone());
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use raft_member::membership::Membership;

    use super::*;

    #[test]
    fn test_mem_state_applies_changes() {
        let mut state = MemState::default();
        state.apply(&MemChange::Add(5));
        state.apply(&MemChange::Add(-2));
        assert_eq!(state.value, 3);
    }

    #[tokio::test]
    async fn test_mem_storage_records_writes() {
        let storage = MemStorage::new();
        assert_eq!(storage.write_count(), 0);
        assert!(storage.persisted().await.is_none());

        let ps = PersistentState::new_initial(MemState::default(), Membership::with_voting([1]));
        storage.write_persistent_state(&ps).await.unwrap();
        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.persisted().await, Some(ps.clone()));

        storage.fail_writes(true);
        assert!(storage.write_persistent_state(&ps).await.is_err());
        assert_eq!(storage.write_count(), 1);
    }
}
