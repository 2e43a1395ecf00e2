//! Replication stream.
//!
//! While a member leads, it runs one replication stream per peer. The
//! stream owns the peer's `next_index` and pushes append-entries and
//! install-snapshot RPCs out to the peer; match-index advances and
//! higher-term discoveries flow back to the member core as events. The
//! stream holds no log of its own: each send begins by asking the core for
//! the payload starting at `next_index`, which keeps the log under the
//! core's exclusive ownership.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;

use crate::config::Config;
use crate::log::Log;
use crate::membership::MembershipConfig;
use crate::message::AppendEntriesRequest;
use crate::message::InstallSnapshotRequest;
use crate::network::RaftNetwork;
use crate::LogIndex;
use crate::MemberId;
use crate::ReplicatedState;
use crate::Term;

/// The handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
}

impl ReplicationStream {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<S: ReplicatedState, N: RaftNetwork<S>>(
        id: MemberId,
        target: MemberId,
        term: Term,
        config: Arc<Config>,
        last_log_index: LogIndex,
        commit_index: LogIndex,
        network: Arc<N>,
        core_tx: mpsc::UnboundedSender<ReplicaEvent<S>>,
    ) -> Self {
        ReplicationCore::spawn(id, target, term, config, last_log_index, commit_index, network, core_tx)
    }
}

/// An event from the member core to a replication stream.
#[derive(Clone, Debug)]
pub(crate) enum RaftEvent {
    /// New entries have been appended to the leader's log.
    Replicate {
        /// The index of the most recent entry appended to the log.
        last_log_index: LogIndex,
        /// The index of the highest entry known to be committed.
        commit_index: LogIndex,
    },
    /// The leader has committed further entries.
    UpdateCommitIndex {
        /// The index of the highest entry known to be committed.
        commit_index: LogIndex,
    },
    /// The stream must shut down.
    Terminate,
}

/// An event from a replication stream to the member core.
pub(crate) enum ReplicaEvent<S: ReplicatedState> {
    /// The target's match index advanced.
    UpdateMatchIndex {
        /// The member the event relates to.
        target: MemberId,
        /// The most recent log index known to be replicated on the target.
        matched: LogIndex,
    },
    /// The target answered with a greater term; the leader must step down.
    RevertToFollower {
        /// The member the event relates to.
        target: MemberId,
        /// The new term observed.
        term: Term,
    },
    /// The stream needs the payload to send for the given next index.
    NeedsPayload {
        /// The member the event relates to.
        target: MemberId,
        /// The index of the first entry the payload must carry.
        next_index: LogIndex,
        /// The channel on which to deliver the payload.
        tx: oneshot::Sender<ReplicationPayload<S>>,
    },
}

/// The payload for one replication send, built by the member core.
pub(crate) enum ReplicationPayload<S: ReplicatedState> {
    /// A log slice starting at the requested index; empty when the peer is
    /// caught up, in which case the send is a heartbeat.
    Entries {
        entries: Log<S>,
        leader_commit: LogIndex,
    },
    /// The requested entries have been compacted away; the peer needs the
    /// snapshot.
    Snapshot {
        last_included_index: LogIndex,
        last_included_term: Term,
        snapshot_state: S,
        snapshot_membership: MembershipConfig,
    },
}

/// The state of a replication stream.
#[derive(Debug, Eq, PartialEq)]
enum TargetReplState {
    /// The stream is replicating normally.
    LineRate,
    /// The stream is shutting down.
    Shutdown,
}

/// The task responsible for replicating the leader's log to one peer.
struct ReplicationCore<S: ReplicatedState, N: RaftNetwork<S>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this member.
    id: MemberId,
    /// The ID of the target peer.
    target: MemberId,
    /// The leader's term; a stream never outlives the term it was spawned
    /// in.
    term: Term,

    /// The `RaftNetwork` interface.
    network: Arc<N>,
    /// The member's runtime config.
    config: Arc<Config>,
    /// A channel for sending events to the member core.
    core_tx: mpsc::UnboundedSender<ReplicaEvent<S>>,
    /// A channel for receiving events from the member core.
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,
    /// The set of peers currently believed reachable.
    connected_rx: watch::Receiver<BTreeSet<MemberId>>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this stream.
    target_state: TargetReplState,
    /// The index of the entry most recently appended to the leader's log.
    last_log_index: LogIndex,
    /// The index of the highest entry known to be committed.
    commit_index: LogIndex,
    /// The index of the next entry to send to the target.
    next_index: LogIndex,
    /// The most recent index known to be replicated on the target.
    matched: LogIndex,
    /// The commit index carried by the last accepted send.
    last_sent_commit: LogIndex,

    /// The interval which paces heartbeats and retries.
    heartbeat: Interval,
}

impl<S: ReplicatedState, N: RaftNetwork<S>> ReplicationCore<S, N> {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        id: MemberId,
        target: MemberId,
        term: Term,
        config: Arc<Config>,
        last_log_index: LogIndex,
        commit_index: LogIndex,
        network: Arc<N>,
        core_tx: mpsc::UnboundedSender<ReplicaEvent<S>>,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_interval = Duration::from_millis(config.heartbeat_interval);
        let connected_rx = network.connected_members();
        let this = Self {
            id,
            target,
            term,
            network,
            config,
            core_tx,
            repl_rx,
            connected_rx,
            target_state: TargetReplState::LineRate,
            last_log_index,
            commit_index,
            next_index: last_log_index + 1,
            matched: 0,
            last_sent_commit: 0,
            heartbeat: interval(heartbeat_interval),
        };
        let _handle = tokio::spawn(
            this.main()
                .instrument(tracing::debug_span!("replication", target = target)),
        );
        ReplicationStream { repl_tx }
    }

    async fn main(mut self) {
        // An initial heartbeat announces the new leader without waiting for
        // the first tick.
        if self.is_connected() {
            self.send_next().await;
        }
        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            // Stream the backlog eagerly; a send which made progress (even a
            // rejection, which narrows next_index) is followed up at once,
            // while delivery failures wait for the next tick. A commit
            // advance the peer has not seen yet counts as backlog.
            let behind = self.matched < self.last_log_index || self.last_sent_commit < self.commit_index;
            if behind && self.is_connected() {
                let progressed = self.send_next().await;
                if self.target_state != TargetReplState::LineRate {
                    return;
                }
                if progressed {
                    continue;
                }
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    if self.is_connected() {
                        self.send_next().await;
                    }
                }
                event = self.repl_rx.recv() => match event {
                    Some(event) => self.drain_raft_rx(event),
                    None => self.target_state = TargetReplState::Shutdown,
                }
            }
        }
    }

    /// Whether the target is currently believed reachable. Dispatching to a
    /// disconnected peer is pointless; the heartbeat tick retries once the
    /// network reports it back.
    fn is_connected(&self) -> bool {
        self.connected_rx.borrow().contains(&self.target)
    }

    /// Ask the core for the payload at `next_index` and send it, returning
    /// `true` if the exchange moved replication forward.
    async fn send_next(&mut self) -> bool {
        let (tx, rx) = oneshot::channel();
        let res = self.core_tx.send(ReplicaEvent::NeedsPayload {
            target: self.target,
            next_index: self.next_index,
            tx,
        });
        if res.is_err() {
            self.target_state = TargetReplState::Shutdown;
            return false;
        }
        let payload = match rx.await {
            Ok(payload) => payload,
            Err(_) => {
                self.target_state = TargetReplState::Shutdown;
                return false;
            }
        };
        match payload {
            ReplicationPayload::Entries { entries, leader_commit } => {
                self.send_append_entries(entries, leader_commit).await
            }
            ReplicationPayload::Snapshot {
                last_included_index,
                last_included_term,
                snapshot_state,
                snapshot_membership,
            } => {
                self.send_install_snapshot(last_included_index, last_included_term, snapshot_state, snapshot_membership)
                    .await
            }
        }
    }

    /// Send an AppendEntries RPC to the target.
    ///
    /// The request times out at the heartbeat interval so a hung send never
    /// blocks the heartbeat cadence.
    async fn send_append_entries(&mut self, entries: Log<S>, leader_commit: LogIndex) -> bool {
        let last_sent = entries.latest_index();
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            entries,
            leader_commit,
        };
        let ttl = Duration::from_millis(self.config.heartbeat_interval);
        let res = match timeout(ttl, self.network.append_entries(self.target, rpc)).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, target = self.target, "error sending AppendEntries RPC to target");
                return false;
            }
            Err(_) => {
                tracing::warn!(target = self.target, "timeout while sending AppendEntries RPC to target");
                return false;
            }
        };

        if res.term > self.term {
            tracing::debug!(res.term, "append entries failed, reverting to follower");
            let _ = self.core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.target_state = TargetReplState::Shutdown;
            return true;
        }

        if res.success {
            self.next_index = last_sent + 1;
            if leader_commit > self.last_sent_commit {
                self.last_sent_commit = leader_commit;
            }
            if last_sent > self.matched {
                self.matched = last_sent;
                self.update_matched();
            }
            return true;
        }

        // The consistency check failed; back next_index off by one and let
        // the next payload fetch decide between older entries and a
        // snapshot.
        tracing::debug!(next_index = self.next_index, target = self.target, "append entries rejected, backing off");
        self.next_index = self.next_index.saturating_sub(1);
        true
    }

    /// Send the leader's current snapshot to the target.
    async fn send_install_snapshot(
        &mut self,
        last_included_index: LogIndex,
        last_included_term: Term,
        snapshot_state: S,
        snapshot_membership: MembershipConfig,
    ) -> bool {
        tracing::info!(target = self.target, last_included_index, "sending snapshot to target");
        let rpc = InstallSnapshotRequest {
            term: self.term,
            leader_id: self.id,
            last_included_index,
            last_included_term,
            snapshot_state,
            snapshot_membership,
        };
        let ttl = Duration::from_millis(self.config.install_snapshot_timeout);
        let res = match timeout(ttl, self.network.install_snapshot(self.target, rpc)).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, target = self.target, "error sending InstallSnapshot RPC to target");
                return false;
            }
            Err(_) => {
                tracing::warn!(target = self.target, "timeout while sending InstallSnapshot RPC to target");
                return false;
            }
        };

        if res.term > self.term {
            let _ = self.core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.target_state = TargetReplState::Shutdown;
            return true;
        }

        self.next_index = last_included_index + 1;
        if last_included_index > self.matched {
            self.matched = last_included_index;
            self.update_matched();
        }
        true
    }

    fn update_matched(&mut self) {
        tracing::debug!(target = self.target, matched = self.matched, "update_matched");
        let res = self.core_tx.send(ReplicaEvent::UpdateMatchIndex {
            target: self.target,
            matched: self.matched,
        });
        if res.is_err() {
            self.target_state = TargetReplState::Shutdown;
        }
    }

    /// Fully drain the channel coming in from the member core.
    fn drain_raft_rx(&mut self, first: RaftEvent) {
        let mut event_opt = Some(first);
        loop {
            let event = match event_opt.take() {
                Some(event) => event,
                None => return,
            };
            match event {
                RaftEvent::Replicate {
                    last_log_index,
                    commit_index,
                } => {
                    self.last_log_index = last_log_index;
                    self.commit_index = commit_index;
                }
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                RaftEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }
            if let Some(next) = self.repl_rx.recv().now_or_never() {
                match next {
                    Some(event) => event_opt = Some(event),
                    None => {
                        self.target_state = TargetReplState::Shutdown;
                        return;
                    }
                }
            }
        }
    }
}
