//! The Raft storage interface and persistent state.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::log::EntryPayload;
use crate::log::Log;
use crate::membership::Membership;
use crate::membership::MembershipConfig;
use crate::LogIndex;
use crate::MemberId;
use crate::ReplicatedState;
use crate::Term;

/// Everything a Raft member must persist to stable storage.
///
/// A member writes this state through its [`RaftStorage`] port before
/// sending any reply that depends on it; the values stored are handed back
/// to [`Member::new`](crate::Member::new) when the member restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct PersistentState<S: ReplicatedState> {
    /// The latest term this member has seen.
    pub current_term: Term,
    /// The candidate this member voted for in `current_term`, if any.
    pub voted_for: Option<MemberId>,
    /// The snapshotted state machine, covering all entries through
    /// `log.prev_index`.
    ///
    /// `None` only for a member which has joined an existing cluster and
    /// has not yet received its first snapshot. Such a member has no state
    /// to serve and never stands for election.
    pub snapshot_state: Option<S>,
    /// The membership configuration as of `log.prev_index`.
    ///
    /// Present exactly when `snapshot_state` is present.
    pub snapshot_membership: Option<MembershipConfig>,
    /// The log suffix not covered by the snapshot.
    pub log: Log<S>,
}

impl<S: ReplicatedState> PersistentState<S> {
    /// The state for a founding member of a new cluster.
    ///
    /// The caller must ensure that every founding member starts with the
    /// same `initial_state` and `initial_membership`: together they form
    /// the snapshot at index 0 which anchors the whole log.
    pub fn new_initial(initial_state: S, initial_membership: Membership) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            snapshot_state: Some(initial_state),
            snapshot_membership: Some(MembershipConfig::simple(initial_membership)),
            log: Log::new(0, 0),
        }
    }

    /// The state for a member that will be joining an already-established
    /// cluster.
    ///
    /// A member initialized this way should be added to the cluster as a
    /// non-voting member; it acquires its state and configuration from the
    /// leader's first snapshot and must not be made a voting member before
    /// that happens.
    pub fn new_joining() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            snapshot_state: None,
            snapshot_membership: None,
            log: Log::new(0, 0),
        }
    }

    /// Whether this member has a valid state machine.
    pub fn is_initialized(&self) -> bool {
        self.snapshot_state.is_some()
    }

    /// The term of the last entry in the log (or of the snapshot boundary
    /// when the log is empty).
    pub fn last_log_term(&self) -> Term {
        self.log.term_at(self.log.latest_index())
    }

    /// The configuration in effect at this member.
    ///
    /// Members adopt a configuration the moment it appears in their log,
    /// even before it commits, so this is the latest configuration entry in
    /// the log, falling back to the snapshot's configuration. `None` only
    /// for an uninitialized joiner.
    pub fn effective_membership(&self) -> Option<MembershipConfig> {
        self.membership_as_of(self.log.latest_index())
    }

    /// The configuration in effect considering only entries at or below the
    /// given index.
    pub fn membership_as_of(&self, index: LogIndex) -> Option<MembershipConfig> {
        let in_log = self
            .log
            .entries
            .iter()
            .enumerate()
            .rev()
            .filter(|(offset, _)| self.log.prev_index + 1 + *offset as u64 <= index)
            .find_map(|(_, entry)| match &entry.payload {
                EntryPayload::ConfigChange(cfg) => Some(cfg.clone()),
                _ => None,
            });
        in_log.or_else(|| self.snapshot_membership.clone())
    }
}

/// A trait defining the interface a Raft member uses to persist its state.
///
/// There is a single operation: write the whole [`PersistentState`]. It may
/// be called frequently — once per accepted RPC in the worst case — so an
/// implementation may diff against what it already has on disk, but the
/// contract is write-the-whole-thing.
#[async_trait]
pub trait RaftStorage<S: ReplicatedState>: Send + Sync + 'static {
    /// Write the member's persistent state to stable storage.
    ///
    /// This must not return until the state is safely durable. The member
    /// awaits this call before sending any reply that commits it to the
    /// persisted fact: granting a vote, acknowledging replicated entries,
    /// acknowledging a snapshot, or accepting a proposal.
    ///
    /// The returned future may be dropped at any await point when the
    /// member shuts down mid-write; implementations must ensure a dropped
    /// write leaves the previously durable state intact.
    ///
    /// Errors returned from this method are fatal and cause the member to
    /// shut down: a member that cannot persist cannot safely promise
    /// anything.
    async fn write_persistent_state(&self, ps: &PersistentState<S>) -> Result<()>;
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
