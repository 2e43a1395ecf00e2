use crate::core::LeaderState;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::MemberResult;
use crate::log::Entry;
use crate::log::EntryPayload;
use crate::member::MemberRespTx;
use crate::membership::Membership;
use crate::membership::MembershipConfig;
use crate::network::RaftNetwork;
use crate::replication::RaftEvent;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::ReplicatedState;

/// The outcome of one reconfiguration-driving step.
pub(super) enum ReconfigurationStep {
    /// The latest configuration entry has not committed yet.
    Waiting,
    /// A new configuration entry was appended; the commit loop should run
    /// again.
    Appended,
    /// The configuration is settled and this leader remains in it.
    Settled,
    /// The final configuration committed without this member in its voting
    /// set; the leader has stepped down.
    SteppedDown,
}

impl<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> LeaderState<'a, S, N, St> {
    /// Handle a reconfiguration proposal from the embedding application.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_propose_config_change(
        &mut self,
        membership: Membership,
        tx: MemberRespTx<(), ChangeConfigError>,
    ) {
        let res = self.change_membership(membership).await;
        let _ = tx.send(res);
    }

    /// Start a joint-consensus transition to the given membership.
    ///
    /// The reply only means the joint entry has been appended and made
    /// durable; the two-phase transition itself runs asynchronously as the
    /// entries commit.
    async fn change_membership(&mut self, new_membership: Membership) -> Result<(), ChangeConfigError> {
        if new_membership.voting.is_empty() {
            return Err(ChangeConfigError::EmptyVotingSet);
        }

        // One reconfiguration at a time: refuse while a configuration entry
        // is uncommitted, or while a committed joint config awaits its
        // final entry.
        let config_index = self.latest_config_entry_index();
        let effective = self
            .core
            .ps
            .effective_membership()
            .expect("a leader always has a configuration");
        if config_index > self.core.commit_index || effective.is_in_joint_consensus() {
            return Err(ChangeConfigError::InProgress { at: config_index });
        }

        tracing::info!(?new_membership, "starting joint consensus reconfiguration");
        let joint = MembershipConfig::joint(effective.membership, new_membership);
        self.leader_append_entry(EntryPayload::ConfigChange(joint))
            .await
            .map_err(ChangeConfigError::Member)?;
        Ok(())
    }

    /// The index of the latest configuration entry in the log, or the log
    /// base when the effective configuration comes from the snapshot.
    pub(super) fn latest_config_entry_index(&self) -> LogIndex {
        let log = &self.core.ps.log;
        log.entries
            .iter()
            .enumerate()
            .rev()
            .find_map(|(offset, entry)| {
                matches!(entry.payload, EntryPayload::ConfigChange(_))
                    .then(|| log.prev_index + 1 + offset as u64)
            })
            .unwrap_or(log.prev_index)
    }

    /// Drive the two-phase joint consensus transition forward, per §6 of
    /// the Raft paper. Called whenever the commit index advances.
    ///
    /// Phase one: once the joint entry commits, append the final
    /// configuration. Phase two: once the final entry commits, drop the
    /// streams to departed members, and step down if this member is no
    /// longer a voting member itself. A leader elected mid-transition picks
    /// up whichever phase its predecessor left unfinished.
    pub(super) async fn continue_reconfiguration(&mut self) -> MemberResult<ReconfigurationStep> {
        let config_index = self.latest_config_entry_index();
        if config_index > self.core.commit_index {
            return Ok(ReconfigurationStep::Waiting);
        }
        let effective = self
            .core
            .ps
            .effective_membership()
            .expect("a leader always has a configuration");

        if let Some(new) = effective.membership_after_consensus {
            tracing::info!("joint configuration committed, appending the final configuration");
            self.append_config_entry(MembershipConfig::simple(new)).await?;
            return Ok(ReconfigurationStep::Appended);
        }

        self.prune_replication_targets();
        if !effective.membership.is_leader_eligible(self.core.id) {
            // Hold leadership just long enough for every reachable departed
            // peer to replicate the configuration that removed it; a peer
            // which never learns it would keep standing for election
            // against the new cluster. Unreachable peers are not waited
            // for.
            let connected = self.core.network.connected_members().borrow().clone();
            let departed_catching_up = self
                .nodes
                .iter()
                .any(|(id, node)| node.remove_after_matched.is_some() && connected.contains(id));
            if departed_catching_up {
                return Ok(ReconfigurationStep::Settled);
            }
            tracing::info!("removed from the voting set by a committed configuration, stepping down");
            self.core.set_target_role(Role::Follower);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.report_metrics();
            return Ok(ReconfigurationStep::SteppedDown);
        }
        Ok(ReconfigurationStep::Settled)
    }

    /// Append a configuration entry without re-entering the commit loop;
    /// the caller is already inside `leader_drive_commit`.
    async fn append_config_entry(&mut self, cfg: MembershipConfig) -> MemberResult<()> {
        self.core.ps.log.append(Entry {
            term: self.core.ps.current_term,
            payload: EntryPayload::ConfigChange(cfg),
        });
        self.core.save_persistent_state().await?;
        let index = self.core.ps.log.latest_index();
        self.update_replication_targets();
        self.notify_replicators(RaftEvent::Replicate {
            last_log_index: index,
            commit_index: self.core.commit_index,
        });
        self.core.report_metrics();
        Ok(())
    }
}
