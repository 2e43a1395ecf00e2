use crate::core::MemberCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::MemberResult;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::network::RaftNetwork;
use crate::storage::RaftStorage;
use crate::ReplicatedState;

impl<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> MemberCore<S, N, St> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also
    /// used as heartbeat (§5.2).
    #[tracing::instrument(
        level = "trace",
        skip(self, msg),
        fields(
            leader_id = msg.leader_id,
            rpc_term = msg.term,
            prev_log_index = msg.entries.prev_index,
            prev_log_term = msg.entries.prev_term,
            leader_commit = msg.leader_commit,
        ),
    )]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<S>,
    ) -> MemberResult<AppendEntriesResponse> {
        // A leader from a stale term is refused; the term in the reply
        // tells it to step down.
        if msg.term < self.ps.current_term {
            tracing::trace!(current_term = self.ps.current_term, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.ps.current_term,
                success: false,
            });
        }

        let mut term_changed = false;
        if msg.term > self.ps.current_term {
            self.adopt_term(msg.term);
            term_changed = true;
        }

        // The sender is the leader of the current term: note it, feed the
        // watchdog, and fall back to follower if we were campaigning.
        self.update_next_election_timeout(true);
        if self.current_leader != Some(msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherMember(msg.leader_id));
        }
        if !self.target_role.is_follower() {
            debug_assert!(
                !self.target_role.is_leader(),
                "two leaders acting in the same term"
            );
            self.set_target_role(Role::Follower);
        }

        // A joiner with no snapshot has no base state to extend. It refuses
        // entries until the leader installs a snapshot; the leader's
        // back-off walks down to our (empty) base and switches to a
        // snapshot by itself.
        if !self.ps.is_initialized() {
            if term_changed {
                self.save_persistent_state().await?;
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.ps.current_term,
                success: false,
            });
        }

        // Consistency check: our log must contain (prev_index, prev_term),
        // either as the snapshot boundary or as an existing entry.
        let prev_index = msg.entries.prev_index;
        let prev_term = msg.entries.prev_term;
        let consistent = prev_index >= self.ps.log.prev_index
            && prev_index <= self.ps.log.latest_index()
            && self.ps.log.term_at(prev_index) == prev_term;
        if !consistent {
            tracing::debug!(
                prev_index,
                prev_term,
                local_base = self.ps.log.prev_index,
                local_latest = self.ps.log.latest_index(),
                "log consistency check failed",
            );
            if term_changed {
                self.save_persistent_state().await?;
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.ps.current_term,
                success: false,
            });
        }

        // Accept the payload. An existing entry that conflicts with an
        // incoming one (same index, different term) takes its whole suffix
        // with it.
        for (offset, entry) in msg.entries.entries.iter().enumerate() {
            let index = prev_index + 1 + offset as u64;
            if index <= self.ps.log.prev_index {
                // Covered by our snapshot; committed entries never
                // conflict.
                continue;
            }
            if index <= self.ps.log.latest_index() {
                if self.ps.log.term_at(index) == entry.term {
                    continue;
                }
                debug_assert!(index > self.commit_index, "conflicting entry at or below the commit index");
                tracing::debug!(index, "truncating conflicting log suffix");
                self.ps.log.truncate_suffix_from(index);
            }
            self.ps.log.append(entry.clone());
        }

        if msg.leader_commit > self.commit_index {
            let new_commit = msg.leader_commit.min(self.ps.log.latest_index());
            if new_commit > self.commit_index {
                self.update_commit_index(new_commit);
            }
        }

        // Persist before acknowledging; the leader will count this member
        // as replicated the moment the reply arrives.
        self.save_persistent_state().await?;
        self.report_metrics();
        Ok(AppendEntriesResponse {
            term: self.ps.current_term,
            success: true,
        })
    }
}
