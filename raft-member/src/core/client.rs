use std::collections::BTreeSet;

use crate::core::LeaderState;
use crate::error::MemberResult;
use crate::error::ProposeError;
use crate::log::Entry;
use crate::log::EntryPayload;
use crate::member::MemberRespTx;
use crate::network::RaftNetwork;
use crate::replication::RaftEvent;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::MemberId;
use crate::ReplicatedState;

impl<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> LeaderState<'a, S, N, St> {
    /// Append the initial blank entry which new leaders are obligated to
    /// create when first coming to power, per §8.
    ///
    /// Entries of prior terms are never committed by counting replicas;
    /// committing this entry is what commits everything before it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> MemberResult<()> {
        self.leader_append_entry(EntryPayload::Blank).await?;
        Ok(())
    }

    /// Handle a proposal from the embedding application.
    ///
    /// The reply only means the change has been appended and made durable
    /// here; commitment and application happen asynchronously, and a
    /// deposed leader's uncommitted entries may never commit at all.
    #[tracing::instrument(level = "trace", skip(self, change, tx))]
    pub(super) async fn handle_propose_change(&mut self, change: S::Change, tx: MemberRespTx<(), ProposeError>) {
        let res = self.leader_append_entry(EntryPayload::Normal(change)).await;
        let _ = tx.send(res.map(|_index| ()).map_err(ProposeError::Member));
    }

    /// Append an entry to the log in the current term, make it durable, and
    /// hand it to the replication streams.
    pub(super) async fn leader_append_entry(&mut self, payload: EntryPayload<S>) -> MemberResult<LogIndex> {
        let is_config_change = matches!(&payload, EntryPayload::ConfigChange(_));
        self.core.ps.log.append(Entry {
            term: self.core.ps.current_term,
            payload,
        });
        self.core.save_persistent_state().await?;
        let index = self.core.ps.log.latest_index();
        tracing::debug!(index, "appended entry to leader log");

        // A configuration takes effect the moment it is in the log; new
        // members need replication streams right away.
        if is_config_change {
            self.update_replication_targets();
        }
        self.notify_replicators(RaftEvent::Replicate {
            last_log_index: index,
            commit_index: self.core.commit_index,
        });

        // With no peers to wait for (a single-voter cluster), this commits
        // the entry on the spot.
        self.leader_drive_commit().await?;
        self.core.report_metrics();
        Ok(index)
    }

    /// Send an event to every replication stream.
    pub(super) fn notify_replicators(&self, event: RaftEvent) {
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send(event.clone());
        }
    }

    /// Advance the commit index as far as the match indexes allow, apply
    /// the newly committed entries, and drive any pending reconfiguration
    /// forward.
    pub(super) async fn leader_drive_commit(&mut self) -> MemberResult<()> {
        loop {
            let new_commit = self.compute_commit_index();
            if new_commit > self.core.commit_index {
                tracing::debug!(new_commit, "commit index advanced by quorum");
                self.core.update_commit_index(new_commit);
                self.notify_replicators(RaftEvent::UpdateCommitIndex {
                    commit_index: new_commit,
                });
                self.core.report_metrics();
            }
            // A commit advance may complete a reconfiguration phase, which
            // appends another entry; loop so that entry gets its own chance
            // to commit (it does immediately on a single-voter cluster).
            match self.continue_reconfiguration().await? {
                super::admin::ReconfigurationStep::Appended => continue,
                _ => return Ok(()),
            }
        }
    }

    /// The highest index replicated to a quorum which also satisfies the
    /// current-term restriction (§5.4.2): only an entry of the leader's own
    /// term is committed by counting replicas, and it commits everything
    /// before it.
    fn compute_commit_index(&self) -> LogIndex {
        let membership = self
            .core
            .ps
            .effective_membership()
            .expect("a leader always has a configuration");
        let mut n = self.core.ps.log.latest_index();
        while n > self.core.commit_index {
            // Terms are non-decreasing along the log; once below the
            // current term, no smaller index can match it either.
            if self.core.ps.log.term_at(n) != self.core.ps.current_term {
                break;
            }
            let mut replicated: BTreeSet<MemberId> = self
                .nodes
                .iter()
                .filter(|(_, state)| state.matched >= n)
                .map(|(id, _)| *id)
                .collect();
            replicated.insert(self.core.id);
            if membership.is_quorum(&replicated) {
                return n;
            }
            n -= 1;
        }
        self.core.commit_index
    }
}
