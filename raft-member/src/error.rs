//! Error types exposed by this crate.

use crate::LogIndex;
use crate::MemberId;

/// A result type where the error variant is always a `MemberError`.
pub type MemberResult<T> = std::result::Result<T, MemberError>;

/// Error variants related to the internals of a Raft member.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MemberError {
    /// An error which has come from the `RaftStorage` layer.
    ///
    /// Storage failures are fatal: once the member cannot persist its state
    /// it can make no promise safely, so it shuts down and surfaces the
    /// error to the embedding process.
    #[error("{0}")]
    Storage(anyhow::Error),

    /// An internal error indicating that the member is shutting down.
    #[error("the member is shutting down")]
    ShuttingDown,
}

/// The set of errors which may take place when proposing a change.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProposeError {
    /// The member the proposal was sent to is not the cluster leader. The
    /// ID of the current leader is included if known.
    #[error("this member is not the cluster leader")]
    NotLeader {
        /// The leader of the current term, as far as this member knows.
        leader_hint: Option<MemberId>,
    },

    /// An internal error has taken place.
    #[error("{0}")]
    Member(#[from] MemberError),
}

/// The set of errors which may take place when proposing a configuration
/// change.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChangeConfigError {
    /// The member the proposal was sent to is not the cluster leader. The
    /// ID of the current leader is included if known.
    #[error("this member is not the cluster leader")]
    NotLeader {
        /// The leader of the current term, as far as this member knows.
        leader_hint: Option<MemberId>,
    },

    /// The cluster is already undergoing a configuration change.
    ///
    /// A new reconfiguration can be proposed once the configuration entry
    /// at the given index has committed and the transition out of joint
    /// consensus has completed.
    #[error("a configuration change is already in progress at log index {at}")]
    InProgress { at: LogIndex },

    /// The proposed configuration has no voting members, which would leave
    /// the cluster inoperable.
    #[error("the proposed configuration has an empty voting set")]
    EmptyVotingSet,

    /// An internal error has taken place.
    #[error("{0}")]
    Member(#[from] MemberError),
}

/// The set of errors which may take place when compacting the log.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CompactionError {
    /// The member has not yet received its initial state, so there is
    /// nothing to snapshot.
    #[error("the member is not initialized")]
    Uninitialized,

    /// No entries have been applied past the current log base, so a new
    /// snapshot would be identical to the existing one.
    #[error("no applied entries past the current log base {base}")]
    NothingToCompact { base: LogIndex },

    /// An internal error has taken place.
    #[error("{0}")]
    Member(#[from] MemberError),
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given values for election timeout min & max are invalid: max
    /// must be greater than min.
    #[error("given values for election timeout min & max are invalid: max must be greater than min")]
    InvalidElectionTimeoutMinMax,

    /// A heartbeat interval at or above the election timeout minimum would
    /// cause followers to depose healthy leaders.
    #[error("election_timeout_min value must be > heartbeat_interval")]
    ElectionTimeoutLessThanHeartbeatInterval,
}
