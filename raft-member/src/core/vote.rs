use tokio::sync::mpsc;
use tracing::Instrument;

use crate::core::CandidateState;
use crate::core::MemberCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::MemberResult;
use crate::membership::MembershipConfig;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::network::RaftNetwork;
use crate::storage::RaftStorage;
use crate::MemberId;
use crate::ReplicatedState;

impl<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> MemberCore<S, N, St> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "trace", skip(self, msg), fields(candidate = msg.candidate_id, rpc_term = msg.term))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> MemberResult<VoteResponse> {
        // A candidate from a stale term is refused outright.
        if msg.term < self.ps.current_term {
            tracing::trace!(current_term = self.ps.current_term, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.ps.current_term,
                vote_granted: false,
            });
        }

        let mut changed = false;
        if msg.term > self.ps.current_term {
            self.adopt_term(msg.term);
            changed = true;
            if !self.target_role.is_follower() {
                self.set_target_role(Role::Follower);
            }
        }

        // Grant only if the candidate's log is at least as up-to-date as
        // ours: compare (last term, last index) lexicographically.
        let local = (self.ps.last_log_term(), self.ps.log.latest_index());
        let candidate = (msg.last_log_term, msg.last_log_index);
        let candidate_is_up_to_date = candidate >= local;
        if !candidate_is_up_to_date {
            tracing::trace!("refusing vote, candidate log is not up-to-date");
        }

        // One vote per term, first come first served; a repeated request
        // from the member we already voted for is granted again.
        let vote_granted = candidate_is_up_to_date
            && match self.ps.voted_for {
                None => true,
                Some(voted_for) => voted_for == msg.candidate_id,
            };

        if vote_granted {
            self.ps.voted_for = Some(msg.candidate_id);
            self.update_next_election_timeout(false);
            changed = true;
            tracing::debug!(term = self.ps.current_term, "voted for candidate");
        }

        // The vote, and any adopted term, must be durable before the reply
        // leaves this member.
        if changed {
            self.save_persistent_state().await?;
            self.report_metrics();
        }

        Ok(VoteResponse {
            term: self.ps.current_term,
            vote_granted,
        })
    }
}

impl<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> CandidateState<'a, S, N, St> {
    /// Handle a response from a vote request sent to a peer.
    #[tracing::instrument(level = "trace", skip(self, res, membership), fields(peer = target))]
    pub(super) async fn handle_vote_response(
        &mut self,
        res: VoteResponse,
        target: MemberId,
        membership: &MembershipConfig,
    ) -> MemberResult<()> {
        // If the peer is in a greater term, revert to follower.
        if res.term > self.core.ps.current_term {
            tracing::debug!("reverting to follower due to greater term observed in RequestVote RPC response");
            self.core.adopt_term(res.term);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_persistent_state().await?;
            self.core.set_target_role(Role::Follower);
            self.core.report_metrics();
            return Ok(());
        }

        if res.vote_granted {
            self.granted.insert(target);
            // Under a joint configuration this requires a majority from
            // each half, not just of the union.
            if membership.is_quorum(&self.granted) {
                tracing::debug!("transitioning to leader, a quorum of votes has been granted");
                self.core.set_target_role(Role::Leader);
            }
        }

        Ok(())
    }

    /// Spawn parallel vote requests to all voting members of the effective
    /// configuration.
    #[tracing::instrument(level = "trace", skip(self, membership))]
    pub(super) fn spawn_parallel_vote_requests(
        &self,
        membership: &MembershipConfig,
    ) -> mpsc::Receiver<(VoteResponse, MemberId)> {
        let peers: Vec<MemberId> = membership
            .voting_members()
            .into_iter()
            .filter(|member| *member != self.core.id)
            .collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        for member in peers {
            let rpc = VoteRequest::new(
                self.core.ps.current_term,
                self.core.id,
                self.core.ps.log.latest_index(),
                self.core.ps.last_log_term(),
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => {
                            tracing::warn!(error=%err, peer = member, "error while requesting vote from peer")
                        }
                    }
                }
                .instrument(tracing::trace_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }
}
