use crate::core::MemberCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::MemberResult;
use crate::log::Log;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::network::RaftNetwork;
use crate::storage::RaftStorage;
use crate::ReplicatedState;

impl<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> MemberCore<S, N, St> {
    /// An RPC invoked by the leader to bring this member up to speed when
    /// the entries it needs have been compacted away (§7).
    ///
    /// The snapshot arrives as a whole state machine value, so there is no
    /// chunk bookkeeping here: one accepted request replaces the log, the
    /// snapshot and the live state in a single step.
    #[tracing::instrument(
        level = "trace",
        skip(self, req),
        fields(
            leader_id = req.leader_id,
            rpc_term = req.term,
            last_included_index = req.last_included_index,
            last_included_term = req.last_included_term,
        ),
    )]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest<S>,
    ) -> MemberResult<InstallSnapshotResponse> {
        // A leader from a stale term is ignored; the term in the reply
        // tells it to step down.
        if req.term < self.ps.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.ps.current_term,
            });
        }

        let mut term_changed = false;
        if req.term > self.ps.current_term {
            self.adopt_term(req.term);
            term_changed = true;
        }

        self.update_next_election_timeout(true);
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherMember(req.leader_id));
        }
        if !self.target_role.is_follower() {
            debug_assert!(
                !self.target_role.is_leader(),
                "two leaders acting in the same term"
            );
            self.set_target_role(Role::Follower);
        }

        // A snapshot at or below our commit index carries nothing we do not
        // already have. An uninitialized joiner installs unconditionally:
        // its commit index is meaningless until it holds a base state.
        if self.ps.is_initialized() && req.last_included_index <= self.commit_index {
            tracing::debug!(
                commit_index = self.commit_index,
                "ignoring snapshot already covered by the local commit index",
            );
            if term_changed {
                self.save_persistent_state().await?;
                self.report_metrics();
            }
            return Ok(InstallSnapshotResponse {
                term: self.ps.current_term,
            });
        }

        tracing::info!("installing snapshot");
        self.ps.log = Log::new(req.last_included_index, req.last_included_term);
        self.ps.snapshot_state = Some(req.snapshot_state.clone());
        self.ps.snapshot_membership = Some(req.snapshot_membership);
        self.state = Some(req.snapshot_state);
        self.commit_index = req.last_included_index;
        self.last_applied = req.last_included_index;
        self.publish_state();

        // Persist before acknowledging; the leader will advance our match
        // index to the snapshot boundary on reply.
        self.save_persistent_state().await?;
        self.report_metrics();
        Ok(InstallSnapshotResponse {
            term: self.ps.current_term,
        })
    }
}
