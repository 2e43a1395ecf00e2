//! The core logic of a Raft member.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::CompactionError;
use crate::error::MemberError;
use crate::error::MemberResult;
use crate::error::ProposeError;
use crate::invariants::MemberProbe;
use crate::log::EntryPayload;
use crate::member::MemberMsg;
use crate::member::MemberRespTx;
use crate::membership::MembershipConfig;
use crate::metrics::MemberMetrics;
use crate::network::RaftNetwork;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::PersistentState;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::MemberId;
use crate::ReplicatedState;

/// The core type implementing the Raft protocol for one member.
pub(crate) struct MemberCore<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> {
    /// This member's ID.
    id: MemberId,
    /// This member's runtime config.
    config: Arc<Config>,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<St>,

    /// Everything this member persists; written through the storage port
    /// before any reply that depends on it is sent.
    ps: PersistentState<S>,
    /// The live state machine: the snapshot state with all applied entries
    /// folded in. `None` until a joiner receives its first snapshot.
    state: Option<S>,

    /// The role this member is transitioning to (or holding).
    target_role: Role,
    /// The index of the highest entry known to be committed cluster-wide.
    ///
    /// Volatile: it restarts at the snapshot boundary on boot and is
    /// re-learned from the leader (or re-derived from match indexes when
    /// leading).
    commit_index: LogIndex,
    /// The index of the highest entry applied to the state machine.
    last_applied: LogIndex,
    /// The member acting as leader this term, as far as we know. Used to
    /// redirect proposals.
    current_leader: Option<MemberId>,

    /// The last time a message from the current-term leader arrived.
    last_heard_from_leader: Option<Instant>,
    /// The deadline of the election watchdog.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<MemberMsg<S>>,
    tx_metrics: watch::Sender<MemberMetrics>,
    tx_state: watch::Sender<Option<S>>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> MemberCore<S, N, St> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: MemberId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<St>,
        persistent_state: PersistentState<S>,
        rx_api: mpsc::UnboundedReceiver<MemberMsg<S>>,
        tx_metrics: watch::Sender<MemberMetrics>,
        tx_state: watch::Sender<Option<S>>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<MemberResult<()>> {
        let this = Self {
            id,
            config,
            network,
            storage,
            ps: persistent_state,
            state: None,
            target_role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            last_heard_from_leader: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            tx_state,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    /// The main loop of the member.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> MemberResult<()> {
        tracing::debug!("raft member is initializing");
        self.state = self.ps.snapshot_state.clone();
        // Entries past the snapshot boundary cannot be assumed committed;
        // the commit index is re-learned from the leader of the new term.
        self.commit_index = self.ps.log.prev_index;
        self.last_applied = self.ps.log.prev_index;
        self.publish_state();
        self.report_metrics();

        // The member assumes one of a few roles based on cluster activity.
        // Control is delegated to the role's own loop, which returns only
        // when a role change (or an error) calls for it.
        loop {
            match &self.target_role {
                Role::Follower => FollowerState::new(&mut self).run().await?,
                Role::Candidate => CandidateState::new(&mut self).run().await?,
                Role::Leader => LeaderState::new(&mut self).run().await?,
                Role::Shutdown => {
                    tracing::info!("member has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the member.
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(MemberMetrics {
            id: self.id,
            role: self.target_role,
            current_term: self.ps.current_term,
            last_log_index: self.ps.log.latest_index(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            membership_config: self.ps.effective_membership(),
            initialized: self.ps.is_initialized(),
        });
        if let Err(err) = res {
            tracing::debug!(error=%err, id = self.id, "error reporting metrics");
        }
    }

    /// Publish the applied state to observers.
    fn publish_state(&mut self) {
        self.tx_state.send_replace(self.state.clone());
    }

    /// Flush the member's persistent state through the storage port.
    ///
    /// This returns only once the state is durable; every reply that
    /// depends on persisted state awaits this first.
    async fn save_persistent_state(&mut self) -> MemberResult<()> {
        let storage = self.storage.clone();
        match storage.write_persistent_state(&self.ps).await {
            Ok(()) => {
                self.check_local_invariants();
                Ok(())
            }
            Err(err) => Err(self.map_fatal_storage_error(err)),
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage
    /// error. A member which cannot persist cannot safely promise anything,
    /// so there is no retry path here.
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> MemberError {
        tracing::error!(error=%err, id = self.id, "fatal storage error, shutting down");
        self.set_target_role(Role::Shutdown);
        MemberError::Storage(err)
    }

    /// Update the member's target role.
    fn set_target_role(&mut self, target_role: Role) {
        tracing::debug!(from = ?self.target_role, to = ?target_role, "role transition");
        self.target_role = target_role;
    }

    /// Get the watchdog deadline, generating a new value if unset.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Re-arm the watchdog with a fresh randomized deadline.
    ///
    /// If `heard_from_leader` is true, also record the contact time.
    fn update_next_election_timeout(&mut self, heard_from_leader: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heard_from_leader {
            self.last_heard_from_leader = Some(now);
        }
    }

    /// Whether the current-term leader has gone silent: no AppendEntries
    /// or InstallSnapshot contact within the election timeout minimum. A
    /// live leader refreshes the contact time at every heartbeat, a small
    /// fraction of that window.
    fn leader_is_silent(&self) -> bool {
        match self.last_heard_from_leader {
            Some(at) => at.elapsed() >= Duration::from_millis(self.config.election_timeout_min),
            None => true,
        }
    }

    /// Update the value of the `current_leader` property.
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisMember => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherMember(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Adopt a higher term observed from a peer, which resets all per-term
    /// state. The caller must persist before taking any further action
    /// under the new term.
    fn adopt_term(&mut self, new_term: u64) {
        debug_assert!(new_term > self.ps.current_term, "terms never move backwards");
        self.ps.current_term = new_term;
        self.ps.voted_for = None;
        self.current_leader = None;
    }

    /// The configuration in effect at this member.
    fn effective_membership(&self) -> Option<MembershipConfig> {
        self.ps.effective_membership()
    }

    /// Whether this member may stand for election under the effective
    /// configuration. An uninitialized joiner has no configuration and is
    /// never eligible.
    fn is_leader_eligible(&self) -> bool {
        self.effective_membership()
            .map(|cfg| cfg.is_leader_eligible(self.id))
            .unwrap_or(false)
    }

    /// Advance the commit index and apply the newly committed entries, in
    /// index order, to the state machine.
    fn update_commit_index(&mut self, new_commit: LogIndex) {
        debug_assert!(new_commit >= self.commit_index, "commit index never moves backwards");
        debug_assert!(new_commit <= self.ps.log.latest_index(), "cannot commit entries we do not have");
        self.commit_index = new_commit;
        if self.last_applied >= new_commit {
            return;
        }
        let state = self.state.as_mut().expect("applying entries on an uninitialized member");
        for index in (self.last_applied + 1)..=new_commit {
            if let EntryPayload::Normal(change) = &self.ps.log.entry_at(index).payload {
                state.apply(change);
            }
            self.last_applied = index;
        }
        tracing::trace!(commit_index = self.commit_index, last_applied = self.last_applied, "applied committed entries");
        self.publish_state();
        self.check_local_invariants();
    }

    /// Snapshot the applied state and truncate the log prefix it covers.
    ///
    /// The policy deciding when to compact lives outside the core; this is
    /// the mechanism. The snapshot always covers exactly the applied
    /// prefix, which is the only state this member can actually vouch for.
    async fn handle_compact_log(&mut self) -> Result<LogIndex, CompactionError> {
        if !self.ps.is_initialized() {
            return Err(CompactionError::Uninitialized);
        }
        let through = self.last_applied;
        if through <= self.ps.log.prev_index {
            return Err(CompactionError::NothingToCompact {
                base: self.ps.log.prev_index,
            });
        }
        let membership = self
            .ps
            .membership_as_of(through)
            .expect("an initialized member always has a configuration");
        self.ps.snapshot_state = self.state.clone();
        self.ps.snapshot_membership = Some(membership);
        self.ps.log.truncate_prefix_through(through);
        self.save_persistent_state().await?;
        self.report_metrics();
        tracing::info!(through, "log compacted");
        Ok(through)
    }

    /// Take a consistent snapshot of this member's visible state, for the
    /// cluster-wide invariant checker.
    fn probe(&self) -> MemberProbe<S> {
        MemberProbe {
            id: self.id,
            role: self.target_role,
            current_term: self.ps.current_term,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            state: self.state.clone(),
            persistent: self.ps.clone(),
        }
    }

    /// Assert the invariants that can be checked from this member alone.
    fn check_local_invariants(&self) {
        debug_assert!(self.commit_index >= self.ps.log.prev_index);
        debug_assert!(self.last_applied <= self.commit_index);
        debug_assert!(self.commit_index <= self.ps.log.latest_index());
        debug_assert_eq!(self.ps.snapshot_state.is_some(), self.ps.snapshot_membership.is_some());
        debug_assert!(self.ps.log.prev_index == 0 || self.ps.is_initialized());
        debug_assert_eq!(self.state.is_some(), self.ps.is_initialized());
    }

    /// Reject a proposal because this member is not the leader.
    fn reject_proposal_not_leader(&self, tx: MemberRespTx<(), ProposeError>) {
        let _ = tx.send(Err(ProposeError::NotLeader {
            leader_hint: self.current_leader,
        }));
    }

    /// Reject a configuration change because this member is not the leader.
    fn reject_config_change_not_leader(&self, tx: MemberRespTx<(), crate::error::ChangeConfigError>) {
        let _ = tx.send(Err(crate::error::ChangeConfigError::NotLeader {
            leader_hint: self.current_leader,
        }));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
enum UpdateCurrentLeader {
    Unknown,
    OtherMember(MemberId),
    ThisMember,
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible roles of a Raft member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The member is replicating entries from the leader (or waiting to
    /// hear from one). This is the initial role, and the role every
    /// transition passes through.
    Follower,
    /// The member is campaigning to become the cluster leader.
    Candidate,
    /// The member is the cluster leader.
    Leader,
    /// The member is shutting down.
    Shutdown,
}

impl Role {
    /// Check if currently in follower role.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate role.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader role.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a member in follower role.
struct FollowerState<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> {
    core: &'a mut MemberCore<S, N, St>,
}

impl<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> FollowerState<'a, S, N, St> {
    fn new(core: &'a mut MemberCore<S, N, St>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "follower"))]
    async fn run(mut self) -> MemberResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_role.is_follower() {
                return Ok(());
            }

            let election_timeout = sleep_until(self.core.get_next_election_timeout());
            tokio::select! {
                // The watchdog fired. Candidacy requires both a silent
                // leader and a seat in the voting set of the effective
                // configuration; anything else just re-arms the watchdog.
                _ = election_timeout => {
                    if self.core.leader_is_silent() && self.core.is_leader_eligible() {
                        self.core.set_target_role(Role::Candidate);
                    } else {
                        self.core.update_next_election_timeout(false);
                    }
                }
                Some(msg) = self.core.rx_api.recv() => match msg {
                    MemberMsg::AppendEntries { rpc, tx } => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    MemberMsg::RequestVote { rpc, tx } => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    MemberMsg::InstallSnapshot { rpc, tx } => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    MemberMsg::ProposeChange { tx, .. } => {
                        self.core.reject_proposal_not_leader(tx);
                    }
                    MemberMsg::ProposeConfigChange { tx, .. } => {
                        self.core.reject_config_change_not_leader(tx);
                    }
                    MemberMsg::CompactLog { tx } => {
                        let _ = tx.send(self.core.handle_compact_log().await);
                    }
                    MemberMsg::Probe { tx } => {
                        let _ = tx.send(self.core.probe());
                    }
                },
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a member in candidate role.
struct CandidateState<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> {
    core: &'a mut MemberCore<S, N, St>,
    /// The members which granted their vote this term, ourselves included.
    granted: BTreeSet<MemberId>,
}

impl<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> CandidateState<'a, S, N, St> {
    fn new(core: &'a mut MemberCore<S, N, St>) -> Self {
        Self {
            core,
            granted: BTreeSet::new(),
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "candidate"))]
    async fn run(mut self) -> MemberResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_role.is_candidate() {
                return Ok(());
            }

            // The configuration under which this election runs. Votes are
            // counted against it, including both halves of a joint config.
            let membership = self
                .core
                .effective_membership()
                .expect("a candidate always has a configuration");

            // Setup new term.
            self.core.update_next_election_timeout(false);
            self.core.ps.current_term += 1;
            self.core.ps.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_persistent_state().await?;
            self.core.report_metrics();
            tracing::debug!(term = self.core.ps.current_term, "campaigning for leadership");

            self.granted.clear();
            self.granted.insert(self.core.id);

            // A single-member cluster wins without sending a single RPC.
            if membership.is_quorum(&self.granted) {
                self.core.set_target_role(Role::Leader);
                continue;
            }

            // Send RequestVote RPCs to all voting members in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests(&membership);

            // Inner processing loop for this term.
            loop {
                if !self.core.target_role.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());
                tokio::select! {
                    // This election timed out. Break to the outer loop,
                    // which starts a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => {
                        self.handle_vote_response(res, peer, &membership).await?;
                    }
                    Some(msg) = self.core.rx_api.recv() => match msg {
                        MemberMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        MemberMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        MemberMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        MemberMsg::ProposeChange { tx, .. } => {
                            self.core.reject_proposal_not_leader(tx);
                        }
                        MemberMsg::ProposeConfigChange { tx, .. } => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        MemberMsg::CompactLog { tx } => {
                            let _ = tx.send(self.core.handle_compact_log().await);
                        }
                        MemberMsg::Probe { tx } => {
                            let _ = tx.send(self.core.probe());
                        }
                    },
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the leader.
struct LeaderState<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> {
    core: &'a mut MemberCore<S, N, St>,
    /// The replication streams, one per peer in the effective
    /// configuration.
    nodes: BTreeMap<MemberId, ReplicationState>,
    /// The clonable sender for replication stream events.
    replication_tx: mpsc::UnboundedSender<ReplicaEvent<S>>,
    /// The stream of events coming from replication streams.
    replication_rx: mpsc::UnboundedReceiver<ReplicaEvent<S>>,
}

/// The per-peer replication state tracked by the leader.
struct ReplicationState {
    /// The most recent index known to be replicated on the peer.
    matched: LogIndex,
    /// Set once the peer has left the configuration: the stream is removed
    /// as soon as the peer has replicated through this index, so a
    /// departing member still learns the configuration that removed it.
    remove_after_matched: Option<LogIndex>,
    /// The handle to the peer's replication stream.
    replstream: ReplicationStream,
}

impl<'a, S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> LeaderState<'a, S, N, St> {
    fn new(core: &'a mut MemberCore<S, N, St>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            replication_tx,
            replication_rx,
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_role = "leader"))]
    async fn run(mut self) -> MemberResult<()> {
        // Spawn a replication stream to every peer of the effective
        // configuration (both halves, under joint consensus).
        self.update_replication_targets();

        // Setup state as leader.
        self.core.last_heard_from_leader = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisMember);
        self.core.report_metrics();

        // Per §8, append an initial blank entry so the new term has an
        // entry of its own to commit through.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_role.is_leader() {
                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send(RaftEvent::Terminate);
                }
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    MemberMsg::AppendEntries { rpc, tx } => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    MemberMsg::RequestVote { rpc, tx } => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    MemberMsg::InstallSnapshot { rpc, tx } => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    MemberMsg::ProposeChange { change, tx } => {
                        self.handle_propose_change(change, tx).await;
                    }
                    MemberMsg::ProposeConfigChange { membership, tx } => {
                        self.handle_propose_config_change(membership, tx).await;
                    }
                    MemberMsg::CompactLog { tx } => {
                        let _ = tx.send(self.core.handle_compact_log().await);
                    }
                    MemberMsg::Probe { tx } => {
                        let _ = tx.send(self.core.probe());
                    }
                },
                Some(event) = self.replication_rx.recv() => self.handle_replica_event(event).await?,
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
            }
        }
    }
}
