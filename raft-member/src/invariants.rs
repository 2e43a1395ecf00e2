//! Cross-member invariant checking, for tests and debugging.
//!
//! [`check_invariants`] asserts that a collection of member snapshots is in
//! a valid, consistent state: at most one leader per term, pairwise log
//! matching, committed entries present on every live leader, and agreement
//! between state machines and snapshots at equal positions. It needs a
//! probe from every member of the cluster, so it is only usable where all
//! members are directly reachable — which is to say, in a test harness.
//!
//! Violations panic: an invariant violation is a bug in the consensus
//! engine, never a condition to be handled.

use crate::core::Role;
use crate::storage::PersistentState;
use crate::LogIndex;
use crate::MemberId;
use crate::ReplicatedState;
use crate::Term;

/// A point-in-time snapshot of one member's consensus state, taken via
/// [`Member::probe`](crate::Member::probe).
#[derive(Clone, Debug)]
pub struct MemberProbe<S: ReplicatedState> {
    /// The member's ID.
    pub id: MemberId,
    /// The member's role at probe time.
    pub role: Role,
    /// The member's current term.
    pub current_term: Term,
    /// The index of the highest entry the member knows to be committed.
    pub commit_index: LogIndex,
    /// The index of the last entry applied to the member's state machine.
    pub last_applied: LogIndex,
    /// The applied state machine, `None` for an uninitialized joiner.
    pub state: Option<S>,
    /// The member's persistent state.
    pub persistent: PersistentState<S>,
}

impl<S: ReplicatedState> MemberProbe<S> {
    fn latest_index(&self) -> LogIndex {
        self.persistent.log.latest_index()
    }

    /// Assert the invariants checkable from this member alone.
    fn check_local(&self) {
        assert!(
            self.commit_index >= self.persistent.log.prev_index,
            "member {}: commit index {} below the log base {}",
            self.id,
            self.commit_index,
            self.persistent.log.prev_index
        );
        assert!(
            self.last_applied <= self.commit_index,
            "member {}: last_applied {} exceeds commit_index {}",
            self.id,
            self.last_applied,
            self.commit_index
        );
        assert!(
            self.commit_index <= self.latest_index(),
            "member {}: commit_index {} exceeds latest log index {}",
            self.id,
            self.commit_index,
            self.latest_index()
        );
        assert_eq!(
            self.persistent.snapshot_state.is_some(),
            self.persistent.snapshot_membership.is_some(),
            "member {}: snapshot state and snapshot membership must be present together",
            self.id
        );
        assert!(
            self.persistent.log.prev_index == 0 || self.persistent.is_initialized(),
            "member {}: a compacted log requires a snapshot",
            self.id
        );
        assert_eq!(
            self.state.is_some(),
            self.persistent.is_initialized(),
            "member {}: live state must exist exactly when the snapshot does",
            self.id
        );
    }
}

/// Assert that the given collection of cluster members is in a valid,
/// consistent state.
///
/// The probes should cover every member of the cluster and be taken while
/// the cluster is quiescent enough that each probe is internally
/// consistent; probes of different members may be taken at slightly
/// different moments, which the checks below tolerate.
pub fn check_invariants<S: ReplicatedState>(probes: &[MemberProbe<S>]) {
    for probe in probes {
        probe.check_local();
    }

    // Election safety: at most one leader per term, across all members.
    for (i, a) in probes.iter().enumerate() {
        for b in probes.iter().skip(i + 1) {
            if a.role == Role::Leader && b.role == Role::Leader {
                assert_ne!(
                    a.current_term, b.current_term,
                    "members {} and {} both lead term {}",
                    a.id, b.id, a.current_term
                );
            }
        }
    }

    // Log matching: if two logs contain an entry with the same index and
    // term, the logs are identical through that index.
    for (i, a) in probes.iter().enumerate() {
        for b in probes.iter().skip(i + 1) {
            check_log_matching(a, b);
        }
    }

    // Leader completeness: an entry committed in term T is present in the
    // log of every leader of a term beyond T.
    for leader in probes.iter().filter(|p| p.role == Role::Leader) {
        for member in probes {
            check_leader_completeness(leader, member);
        }
    }

    // State machine safety: members which have applied through the same
    // index hold equal states, and snapshots taken at the same index are
    // equal.
    for (i, a) in probes.iter().enumerate() {
        for b in probes.iter().skip(i + 1) {
            if let (Some(sa), Some(sb)) = (&a.state, &b.state) {
                if a.last_applied == b.last_applied {
                    assert_eq!(
                        sa, sb,
                        "members {} and {} disagree on the state at applied index {}",
                        a.id, b.id, a.last_applied
                    );
                }
            }
            let (pa, pb) = (&a.persistent, &b.persistent);
            if pa.is_initialized() && pb.is_initialized() && pa.log.prev_index == pb.log.prev_index {
                assert_eq!(
                    pa.snapshot_state, pb.snapshot_state,
                    "members {} and {} disagree on the snapshot at index {}",
                    a.id, b.id, pa.log.prev_index
                );
            }
        }
    }
}

/// The index range over which both probes hold log entries.
fn overlap<S: ReplicatedState>(a: &MemberProbe<S>, b: &MemberProbe<S>) -> Option<(LogIndex, LogIndex)> {
    let lo = a.persistent.log.prev_index.max(b.persistent.log.prev_index) + 1;
    let hi = a.latest_index().min(b.latest_index());
    (lo <= hi).then_some((lo, hi))
}

fn check_log_matching<S: ReplicatedState>(a: &MemberProbe<S>, b: &MemberProbe<S>) {
    let Some((lo, hi)) = overlap(a, b) else { return };
    // Find the highest index where both logs hold the same term; below it,
    // every overlapping entry must be pairwise identical.
    let matched = (lo..=hi)
        .rev()
        .find(|i| a.persistent.log.term_at(*i) == b.persistent.log.term_at(*i));
    let Some(matched) = matched else { return };
    for i in lo..=matched {
        assert_eq!(
            a.persistent.log.entry_at(i),
            b.persistent.log.entry_at(i),
            "members {} and {} diverge at log index {} below matching entry {}",
            a.id,
            b.id,
            i,
            matched
        );
    }
}

fn check_leader_completeness<S: ReplicatedState>(leader: &MemberProbe<S>, member: &MemberProbe<S>) {
    let lo = leader.persistent.log.prev_index.max(member.persistent.log.prev_index) + 1;
    let hi = member.commit_index.min(member.latest_index());
    for i in lo..=hi {
        let entry_term = member.persistent.log.term_at(i);
        // A deposed leader that has not yet learned of the newer term is
        // excused; the invariant binds leaders of terms beyond the entry's.
        if leader.current_term <= entry_term {
            continue;
        }
        assert!(
            i <= leader.latest_index(),
            "leader {} of term {} is missing committed entry {}",
            leader.id,
            leader.current_term,
            i
        );
        assert_eq!(
            leader.persistent.log.entry_at(i),
            member.persistent.log.entry_at(i),
            "leader {} of term {} disagrees with member {} on committed entry {}",
            leader.id,
            leader.current_term,
            member.id,
            i
        );
    }
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

    fn probe(id: MemberId, role: Role, term: Term, changes: &[(Term, i64)], commit: LogIndex) -> MemberProbe<TestState> {
        let mut persistent = PersistentState::new_initial(TestState::default(), Membership::with_voting([1, 2, 3]));
        persistent.current_term = term;
        let mut state = TestState::default();
        for (entry_term, change) in changes {
            persistent.log.append(Entry {
                term: *entry_term,
                payload: EntryPayload::Normal(*change),
            });
        }
        for i in 1..=commit {
            if let EntryPayload::Normal(change) = &persistent.log.entry_at(i).payload {
                state.value += change;
            }
        }
        MemberProbe {
            id,
            role,
            current_term: term,
            commit_index: commit,
            last_applied: commit,
            state: Some(state),
            persistent,
        }
    }

    #[test]
    fn test_consistent_cluster_passes() {
        let probes = vec![
            probe(1, Role::Leader, 2, &[(1, 10), (2, 20)], 2),
            probe(2, Role::Follower, 2, &[(1, 10), (2, 20)], 2),
            probe(3, Role::Follower, 2, &[(1, 10)], 1),
        ];
        check_invariants(&probes);
    }

    #[test]
    fn test_stale_leader_in_an_older_term_is_tolerated() {
        // A partitioned leader of term 1 may lack entries committed in
        // term 2; only leaders of newer terms must contain them.
        let probes = vec![
            probe(1, Role::Leader, 1, &[(1, 10)], 1),
            probe(2, Role::Leader, 3, &[(1, 10), (2, 20)], 2),
            probe(3, Role::Follower, 3, &[(1, 10), (2, 20)], 2),
        ];
        check_invariants(&probes);
    }

    #[test]
    #[should_panic(expected = "both lead term")]
    fn test_two_leaders_in_one_term_panics() {
        let probes = vec![
            probe(1, Role::Leader, 2, &[(1, 10)], 1),
            probe(2, Role::Leader, 2, &[(1, 10)], 1),
        ];
        check_invariants(&probes);
    }

    #[test]
    #[should_panic(expected = "diverge at log index")]
    fn test_log_matching_violation_panics() {
        // Same term at index 2, but different entries at index 1.
        let probes = vec![
            probe(1, Role::Follower, 2, &[(1, 10), (2, 20)], 0),
            probe(2, Role::Follower, 2, &[(1, 99), (2, 20)], 0),
        ];
        check_invariants(&probes);
    }

    #[test]
    #[should_panic(expected = "missing committed entry")]
    fn test_leader_completeness_violation_panics() {
        let probes = vec![
            probe(1, Role::Leader, 5, &[(1, 10)], 1),
            probe(2, Role::Follower, 5, &[(1, 10), (2, 20)], 2),
        ];
        check_invariants(&probes);
    }

    #[test]
    #[should_panic(expected = "disagree on the state")]
    fn test_state_machine_safety_violation_panics() {
        let mut a = probe(1, Role::Follower, 2, &[(1, 10)], 1);
        let b = probe(2, Role::Follower, 2, &[(1, 10)], 1);
        a.state = Some(TestState { value: 999 });
        check_invariants(&[a, b]);
    }
}
