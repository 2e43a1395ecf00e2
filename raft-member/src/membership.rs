//! Cluster membership configuration and quorum computation.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::MemberId;

/// The set of members involved in a Raft cluster.
///
/// Regular members go in `voting`. `non_voting` is for members that should
/// receive updates but that don't count for voting purposes; a freshly
/// joined member stays non-voting until it has been brought up to speed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Members which vote in elections and count towards commit quorums.
    pub voting: BTreeSet<MemberId>,
    /// Members which receive replicated entries but never vote.
    pub non_voting: BTreeSet<MemberId>,
}

impl Membership {
    /// Create a membership with the given voting members and no non-voting
    /// members.
    pub fn with_voting(voting: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            voting: voting.into_iter().collect(),
            non_voting: BTreeSet::new(),
        }
    }

    /// Return all members, voting and non-voting.
    pub fn all_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.voting.clone();
        members.extend(self.non_voting.iter().copied());
        members
    }

    /// Return `true` if `members` constitutes a majority of the voting set.
    pub fn is_quorum(&self, members: &BTreeSet<MemberId>) -> bool {
        let votes = members.intersection(&self.voting).count();
        votes * 2 > self.voting.len()
    }

    /// Return `true` if the given member can act as a leader.
    pub fn is_leader_eligible(&self, member: MemberId) -> bool {
        self.voting.contains(&member)
    }
}

/// Either a single [`Membership`] or a joint consensus of an old and a new
/// one.
///
/// For a regular configuration, `membership` holds the configuration and
/// `membership_after_consensus` is `None`. For a joint consensus
/// configuration, `membership` holds the old configuration and
/// `membership_after_consensus` holds the new one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// The current configuration; under joint consensus, the old one.
    pub membership: Membership,
    /// The new configuration, present while in joint consensus.
    pub membership_after_consensus: Option<Membership>,
}

impl MembershipConfig {
    /// Create a simple (non-joint) configuration.
    pub fn simple(membership: Membership) -> Self {
        Self {
            membership,
            membership_after_consensus: None,
        }
    }

    /// Create a joint configuration transitioning from `old` to `new`.
    pub fn joint(old: Membership, new: Membership) -> Self {
        Self {
            membership: old,
            membership_after_consensus: Some(new),
        }
    }

    /// Check whether the config is currently in joint consensus.
    pub fn is_in_joint_consensus(&self) -> bool {
        self.membership_after_consensus.is_some()
    }

    /// Return all members of both configurations, voting and non-voting.
    ///
    /// Entries are replicated to every member of both configurations while
    /// in joint consensus.
    pub fn all_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.membership.all_members();
        if let Some(new) = &self.membership_after_consensus {
            members.extend(new.all_members());
        }
        members
    }

    /// Return the union of the voting sets of both configurations.
    pub fn voting_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.membership.voting.clone();
        if let Some(new) = &self.membership_after_consensus {
            members.extend(new.voting.iter().copied());
        }
        members
    }

    /// Return `true` if `members` constitutes a quorum.
    ///
    /// Agreement, for elections and entry commitment, requires separate
    /// majorities from both the old and new configurations while in joint
    /// consensus.
    pub fn is_quorum(&self, members: &BTreeSet<MemberId>) -> bool {
        match &self.membership_after_consensus {
            Some(new) => self.membership.is_quorum(members) && new.is_quorum(members),
            None => self.membership.is_quorum(members),
        }
    }

    /// Return `true` if the given member can act as a leader.
    ///
    /// Any voting member from either configuration may serve as leader.
    pub fn is_leader_eligible(&self, member: MemberId) -> bool {
        self.membership.is_leader_eligible(member)
            || self
                .membership_after_consensus
                .as_ref()
                .map(|new| new.is_leader_eligible(member))
                .unwrap_or(false)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
