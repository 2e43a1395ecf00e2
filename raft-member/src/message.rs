//! The RPC request and reply types exchanged between cluster members.
//!
//! All replies carry the responder's current term, which is how higher
//! terms propagate back to stale candidates and leaders.

use serde::Deserialize;
use serde::Serialize;

use crate::log::Log;
use crate::membership::MembershipConfig;
use crate::LogIndex;
use crate::MemberId;
use crate::ReplicatedState;
use crate::Term;

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: Term,
    /// The candidate's ID.
    pub candidate_id: MemberId,
    /// The index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: Term, candidate_id: MemberId, last_log_index: LogIndex, last_log_term: Term) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding member, for the candidate to
    /// update itself.
    pub term: Term,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// An RPC sent by the cluster leader to replicate log entries (§5.3), and
/// as a heartbeat (§5.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct AppendEntriesRequest<S: ReplicatedState> {
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: MemberId,
    /// The entries to replicate, as a log slice.
    ///
    /// The slice's `prev_index` and `prev_term` are the coordinates of the
    /// consistency check. An empty slice acts as a heartbeat.
    pub entries: Log<S>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding member's current term, for the leader to update
    /// itself.
    pub term: Term,
    /// Will be true if the follower contained the entry matching the
    /// request's `prev_index` and `prev_term` and has accepted the payload.
    pub success: bool,
}

/// An RPC sent by the leader to bring a lagging member up to speed when the
/// entries it needs have been compacted away (§7).
///
/// The snapshot is sent as a whole value rather than as a stream of binary
/// chunks: the state machine is required to be a value type, so the leader
/// ships the `State` and the snapshot's membership configuration directly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ReplicatedState")]
pub struct InstallSnapshotRequest<S: ReplicatedState> {
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: MemberId,
    /// The last log index covered by the snapshot.
    pub last_included_index: LogIndex,
    /// The term of the entry at `last_included_index`.
    pub last_included_term: Term,
    /// The state machine value with all entries through
    /// `last_included_index` applied.
    pub snapshot_state: S,
    /// The membership configuration as of `last_included_index`.
    pub snapshot_membership: MembershipConfig,
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The responding member's current term, for the leader to update
    /// itself.
    pub term: Term,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Entry;
    use crate::log::EntryPayload;
    use crate::membership::Membership;
    use crate::test_support::TestState;

    fn round_trip<T>(value: &T) -> T
    where T: Serialize + serde::de::DeserializeOwned {
        let encoded = serde_json::to_vec(value).expect("serialization failed");
        serde_json::from_slice(&encoded).expect("deserialization failed")
    }

    #[test]
    fn test_vote_messages_round_trip() {
        let req = VoteRequest::new(3, 1, 7, 2);
        assert_eq!(round_trip(&req), req);

        let res = VoteResponse {
            term: 3,
            vote_granted: true,
        };
        assert_eq!(round_trip(&res), res);
    }

    #[test]
    fn test_append_entries_messages_round_trip() {
        let mut entries: Log<TestState> = Log::new(4, 2);
        entries.append(Entry {
            term: 3,
            payload: EntryPayload::Normal(42),
        });
        entries.append(Entry {
            term: 3,
            payload: EntryPayload::Blank,
        });
        entries.append(Entry {
            term: 3,
            payload: EntryPayload::ConfigChange(MembershipConfig::joint(
                Membership::with_voting([1, 2, 3]),
                Membership::with_voting([3, 4, 5]),
            )),
        });
        let req = AppendEntriesRequest {
            term: 3,
            leader_id: 1,
            entries,
            leader_commit: 5,
        };
        assert_eq!(round_trip(&req), req);

        let res = AppendEntriesResponse { term: 3, success: false };
        assert_eq!(round_trip(&res), res);
    }

    #[test]
    fn test_install_snapshot_messages_round_trip() {
        let req = InstallSnapshotRequest {
            term: 7,
            leader_id: 2,
            last_included_index: 1000,
            last_included_term: 6,
            snapshot_state: TestState { value: 55 },
            snapshot_membership: MembershipConfig::simple(Membership::with_voting([1, 2, 3])),
        };
        assert_eq!(round_trip(&req), req);

        let res = InstallSnapshotResponse { term: 7 };
        assert_eq!(round_trip(&res), res);
    }
}
