use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::MemberResult;
use crate::network::RaftNetwork;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationPayload;
use crate::replication::ReplicationStream;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::MemberId;
use crate::ReplicatedState;

impl<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> LeaderState<'a, S, N, St> {
    /// Spawn a new replication stream for the target peer.
    fn spawn_replication_stream(&self, target: MemberId) -> ReplicationState {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.ps.current_term,
            self.core.config.clone(),
            self.core.ps.log.latest_index(),
            self.core.commit_index,
            self.core.network.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: 0,
            remove_after_matched: None,
            replstream,
        }
    }

    /// Ensure a replication stream exists for every peer of the effective
    /// configuration. Under joint consensus this covers both halves.
    pub(super) fn update_replication_targets(&mut self) {
        let membership = self
            .core
            .ps
            .effective_membership()
            .expect("a leader always has a configuration");
        for target in membership.all_members() {
            if target == self.core.id || self.nodes.contains_key(&target) {
                continue;
            }
            tracing::debug!(target = target, "spawning replication stream");
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }
    }

    /// Retire the streams to peers no longer in the effective
    /// configuration.
    ///
    /// Only called once the final configuration entry has committed.
    /// A departed peer which has already replicated that entry is dropped
    /// at once; the rest keep their streams until they have it, so a
    /// removed member still learns the configuration that removed it and
    /// stops standing for election.
    pub(super) fn prune_replication_targets(&mut self) {
        let membership = self
            .core
            .ps
            .effective_membership()
            .expect("a leader always has a configuration");
        let members = membership.all_members();
        let config_index = self.latest_config_entry_index();
        let stale: Vec<MemberId> = self.nodes.keys().copied().filter(|id| !members.contains(id)).collect();
        for target in stale {
            let node = match self.nodes.get_mut(&target) {
                Some(node) => node,
                None => continue,
            };
            if node.matched >= config_index {
                tracing::debug!(target = target, "removing replication stream for departed member");
                if let Some(node) = self.nodes.remove(&target) {
                    let _ = node.replstream.repl_tx.send(RaftEvent::Terminate);
                }
            } else {
                node.remove_after_matched = Some(config_index);
            }
        }
    }

    /// Handle an event coming from one of the replication streams.
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S>) -> MemberResult<()> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                // A stream for a pruned peer may still report; ignore it.
                let advanced = match self.nodes.get_mut(&target) {
                    Some(node) if matched > node.matched => {
                        node.matched = matched;
                        true
                    }
                    _ => false,
                };
                if advanced {
                    // A departing peer is retired once it holds the
                    // configuration that removed it.
                    let retire = self
                        .nodes
                        .get(&target)
                        .and_then(|node| node.remove_after_matched)
                        .map(|threshold| matched >= threshold)
                        .unwrap_or(false);
                    if retire {
                        tracing::debug!(target = target, "departed member caught up, removing replication stream");
                        if let Some(node) = self.nodes.remove(&target) {
                            let _ = node.replstream.repl_tx.send(RaftEvent::Terminate);
                        }
                    }
                    self.leader_drive_commit().await?;
                }
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.ps.current_term {
                    tracing::debug!(target = target, term = term, "reverting to follower, greater term observed during replication");
                    self.core.adopt_term(term);
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.save_persistent_state().await?;
                    self.core.set_target_role(Role::Follower);
                    self.core.report_metrics();
                }
            }
            ReplicaEvent::NeedsPayload { next_index, tx, .. } => {
                let _ = tx.send(self.build_replication_payload(next_index));
            }
        }
        Ok(())
    }

    /// Build the payload a stream should send for the given next index:
    /// a log slice while we still hold the entry, the snapshot once
    /// compaction has taken it.
    fn build_replication_payload(&self, next_index: LogIndex) -> ReplicationPayload<S> {
        let log = &self.core.ps.log;
        if next_index <= log.prev_index {
            return ReplicationPayload::Snapshot {
                last_included_index: log.prev_index,
                last_included_term: log.prev_term,
                snapshot_state: self
                    .core
                    .ps
                    .snapshot_state
                    .clone()
                    .expect("a leader always has a snapshot"),
                snapshot_membership: self
                    .core
                    .ps
                    .snapshot_membership
                    .clone()
                    .expect("a leader always has a snapshot"),
            };
        }
        let from = next_index.min(log.latest_index() + 1);
        ReplicationPayload::Entries {
            entries: log.slice_from(from),
            leader_commit: self.core.commit_index,
        }
    }
}
