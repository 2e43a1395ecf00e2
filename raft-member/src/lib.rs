//! An implementation of the Raft consensus algorithm, as described in the
//! paper "In Search of an Understandable Consensus Algorithm (Extended
//! Version)" (2014) by Diego Ongaro and John Ousterhout.
//!
//! This crate contains the consensus engine itself and nothing else: no
//! networking, no on-disk format, no cluster discovery. The engine reaches
//! the outside world through two narrow ports, [`RaftStorage`] and
//! [`RaftNetwork`], which keeps the core simple and makes it easy to test
//! the algorithm against mocked-up storage and transport.
//!
//! Each cluster member is driven by a [`Member`], which is generic over the
//! replicated state machine via the [`ReplicatedState`] trait. Log
//! compaction via whole-value snapshots and atomic reconfiguration through
//! joint consensus are both supported.

pub mod config;
mod core;
pub mod error;
pub mod invariants;
pub mod log;
pub mod member;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod network;
mod replication;
pub mod storage;

use std::fmt::Debug;

pub use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::Role;
pub use crate::error::ChangeConfigError;
pub use crate::error::CompactionError;
pub use crate::error::ConfigError;
pub use crate::error::MemberError;
pub use crate::error::ProposeError;
pub use crate::member::Member;
pub use crate::membership::Membership;
pub use crate::membership::MembershipConfig;
pub use crate::metrics::MemberMetrics;
pub use crate::network::RaftNetwork;
pub use crate::storage::PersistentState;
pub use crate::storage::RaftStorage;

/// The ID of a Raft cluster member.
///
/// IDs must be unique within a cluster and stable across restarts of the
/// member they identify; assigning them is the embedding application's job.
pub type MemberId = u64;

/// A Raft term.
///
/// Terms are monotone epochs; each member's current term never decreases,
/// and at most one leader exists per term.
pub type Term = u64;

/// A 1-based semantic position in the replicated log.
pub type LogIndex = u64;

/// The replicated state machine managed by a Raft cluster.
///
/// The state type is stored whole when taking a snapshot, and its
/// [`Change`](ReplicatedState::Change) type is what gets written to the
/// Raft log. Both must be value types: cloneable, comparable and
/// serializable, so that snapshots can be shipped to lagging members as
/// plain values and so that test harnesses can compare member states
/// directly.
///
/// Applications present their data model as-is; the engine never inspects
/// the contents of a change, it only carries changes through the log and
/// applies them, in log order, exactly once per index.
pub trait ReplicatedState:
    Clone + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// An operation on the state machine, as stored in the Raft log.
    type Change: Clone + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Apply the change to this state, mutating it in place.
    ///
    /// Application must be deterministic: two members applying the same
    /// sequence of changes to equal starting states must end up equal.
    fn apply(&mut self, change: &Self::Change);
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde::Deserialize;
    use serde::Serialize;

    use crate::ReplicatedState;

    /// A trivial accumulator state machine used by unit tests.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TestState {
        pub value: i64,
    }

    impl ReplicatedState for TestState {
        type Change = i64;

        fn apply(&mut self, change: &Self::Change) {
            self.value += change;
        }
    }
}
