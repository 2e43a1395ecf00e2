//! Fixtures for testing the Raft member.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use maplit::btreeset;
use memstate::MemChange;
use memstate::MemState;
use memstate::MemStorage;
use raft_member::async_trait;
use raft_member::error::ChangeConfigError;
use raft_member::error::ProposeError;
use raft_member::invariants;
use raft_member::member::Member;
use raft_member::membership::Membership;
use raft_member::message::AppendEntriesRequest;
use raft_member::message::AppendEntriesResponse;
use raft_member::message::InstallSnapshotRequest;
use raft_member::message::InstallSnapshotResponse;
use raft_member::message::VoteRequest;
use raft_member::message::VoteResponse;
use raft_member::metrics::MemberMetrics;
use raft_member::storage::PersistentState;
use raft_member::Config;
use raft_member::MemberId;
use raft_member::RaftNetwork;
use raft_member::Role;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing_subscriber::prelude::*;

/// A concrete member type used during testing.
pub type MemRaft = Member<MemState, RaftRouter, MemStorage>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A config tuned so that clusters converge quickly in tests.
pub fn fast_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout_min(150)
            .election_timeout_max(300)
            .heartbeat_interval(40)
            .install_snapshot_timeout(1000)
            .validate()
            .expect("failed to build Raft config"),
    )
}

/// A config whose election timeout never fires within a test, for driving
/// the RPC handlers directly with crafted payloads.
pub fn quiescent_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout_min(60_000)
            .election_timeout_max(120_000)
            .heartbeat_interval(40)
            .validate()
            .expect("failed to build Raft config"),
    )
}

//////////////////////////////////////////////////////////////////////////////////////////////////
//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the
/// `RaftNetwork` trait.
pub struct RaftRouter {
    /// The runtime config which all members are using.
    config: Arc<Config>,
    /// The table of all members currently known to this router instance.
    routing_table: RwLock<BTreeMap<MemberId, (MemRaft, Arc<MemStorage>)>>,
    /// Members which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<MemberId>>,
    /// The connected-members observable handed to every member.
    tx_connected: watch::Sender<BTreeSet<MemberId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        let (tx_connected, _rx) = watch::channel(BTreeSet::new());
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            tx_connected,
        }
    }

    /// Create and register the founding members of a new cluster, all
    /// voting, all starting from the same initial state.
    pub async fn new_founder_cluster(self: &Arc<Self>, ids: impl IntoIterator<Item = MemberId>) {
        let ids: Vec<MemberId> = ids.into_iter().collect();
        let membership = Membership::with_voting(ids.clone());
        for id in ids {
            let persistent = PersistentState::new_initial(MemState::default(), membership.clone());
            self.register(id, persistent).await;
        }
    }

    /// Create and register a member that joins an existing cluster with no
    /// state of its own.
    pub async fn new_joining_node(self: &Arc<Self>, id: MemberId) {
        self.register(id, PersistentState::new_joining()).await;
    }

    /// Create and register a single member which believes the cluster has
    /// the given voting set, without registering its peers. Useful for
    /// driving the member's RPC handlers directly with crafted payloads.
    pub async fn new_lone_founder(self: &Arc<Self>, id: MemberId, voting: BTreeSet<MemberId>) {
        let persistent = PersistentState::new_initial(MemState::default(), Membership::with_voting(voting));
        self.register(id, persistent).await;
    }

    async fn register(self: &Arc<Self>, id: MemberId, persistent: PersistentState<MemState>) {
        let storage = Arc::new(MemStorage::new());
        let member = Member::new(id, self.config.clone(), self.clone(), storage.clone(), persistent);
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (member, storage));
        drop(rt);
        self.update_connected().await;
    }

    /// Remove the target member from the routing table & isolation,
    /// emulating a crash.
    pub async fn remove_node(&self, id: MemberId) -> Option<(MemRaft, Arc<MemStorage>)> {
        let mut rt = self.routing_table.write().await;
        let opt_handles = rt.remove(&id);
        drop(rt);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);
        drop(isolated);
        self.update_connected().await;
        opt_handles
    }

    /// Isolate the network of the specified member.
    pub async fn isolate_node(&self, id: MemberId) {
        tracing::info!(id, "isolating node");
        self.isolated_nodes.write().await.insert(id);
        self.update_connected().await;
    }

    /// Restore the network of the specified member.
    pub async fn restore_node(&self, id: MemberId) {
        tracing::info!(id, "restoring node");
        self.isolated_nodes.write().await.remove(&id);
        self.update_connected().await;
    }

    async fn update_connected(&self) {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let connected: BTreeSet<MemberId> = rt.keys().copied().filter(|id| !isolated.contains(id)).collect();
        self.tx_connected.send_replace(connected);
    }

    /// Get the API handle of the given member.
    pub async fn get_member(&self, id: MemberId) -> MemRaft {
        let rt = self.routing_table.read().await;
        rt.get(&id)
            .unwrap_or_else(|| panic!("member {} does not exist in routing table", id))
            .0
            .clone()
    }

    /// Get the storage of the given member.
    pub async fn get_storage(&self, id: MemberId) -> Arc<MemStorage> {
        let rt = self.routing_table.read().await;
        rt.get(&id)
            .unwrap_or_else(|| panic!("member {} does not exist in routing table", id))
            .1
            .clone()
    }

    /// Get a payload of the latest metrics from each member in the cluster.
    pub async fn latest_metrics(&self) -> Vec<MemberMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for member in rt.values() {
            metrics.push(member.0.metrics().borrow().clone());
        }
        metrics
    }

    /// Get the ID of the current non-isolated leader, if any.
    pub async fn leader(&self) -> Option<MemberId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|member| {
            if member.role == Role::Leader && !isolated.contains(&member.id) {
                Some(member.id)
            } else {
                None
            }
        })
    }

    /// Wait until a non-isolated leader emerges, or panic at the timeout.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> MemberId {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return leader;
            }
            assert!(Instant::now() < deadline, "timed out waiting for a leader: {}", msg);
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until every target's log contains exactly `want` entries.
    pub async fn wait_for_log(&self, targets: &BTreeSet<MemberId>, want: u64, timeout: Duration, msg: &str) {
        for id in targets {
            let member = self.get_member(*id).await;
            member
                .wait(Some(timeout))
                .log(want, format!("{} (member {})", msg, id))
                .await
                .unwrap_or_else(|err| panic!("{}: {}", msg, err));
        }
    }

    /// Wait until every target has applied at least `want` entries.
    pub async fn wait_for_applied(&self, targets: &BTreeSet<MemberId>, want: u64, timeout: Duration, msg: &str) {
        for id in targets {
            let member = self.get_member(*id).await;
            member
                .wait(Some(timeout))
                .applied_at_least(want, format!("{} (member {})", msg, id))
                .await
                .unwrap_or_else(|err| panic!("{}: {}", msg, err));
        }
    }

    /// Wait until the target's applied state reaches the given value.
    pub async fn wait_for_state_value(&self, target: MemberId, want: i64, timeout: Duration, msg: &str) {
        let member = self.get_member(target).await;
        let mut rx = member.current_state();
        let deadline = Instant::now() + timeout;
        loop {
            if rx.borrow().as_ref().map(|s| s.value) == Some(want) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for member {} to reach state {}: {} (current: {:?})",
                target,
                want,
                msg,
                rx.borrow().clone(),
            );
            let _ = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        }
    }

    /// Send a proposal to the target member, panicking on refusal.
    pub async fn propose(&self, target: MemberId, amount: i64) {
        let member = self.get_member(target).await;
        if let Err(err) = member.propose_change(MemChange::Add(amount)).await {
            panic!("proposal refused by member {}: {:?}", target, err)
        }
    }

    /// Propose against whichever member currently leads, retrying through
    /// leadership changes until accepted.
    pub async fn propose_retry(&self, amount: i64, timeout: Duration, msg: &str) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                let member = self.get_member(leader).await;
                match member.propose_change(MemChange::Add(amount)).await {
                    Ok(()) => return,
                    Err(err) => tracing::debug!(leader, ?err, "proposal refused, retrying"),
                }
            }
            assert!(Instant::now() < deadline, "timed out proposing a change: {}", msg);
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Send a proposal to the target member, returning the refusal.
    pub async fn propose_expect_refusal(&self, target: MemberId, amount: i64) -> ProposeError {
        let member = self.get_member(target).await;
        match member.propose_change(MemChange::Add(amount)).await {
            Ok(()) => panic!("expected member {} to refuse the proposal", target),
            Err(err) => err,
        }
    }

    /// Propose a configuration change through the target member.
    pub async fn propose_config_change(
        &self,
        target: MemberId,
        voting: BTreeSet<MemberId>,
    ) -> Result<(), ChangeConfigError> {
        let member = self.get_member(target).await;
        member.propose_config_change(Membership::with_voting(voting)).await
    }

    //////////////////////////////////////////////////////////////////////////////////////////////
    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert that the given members have converged: one leader among
    /// them, and all of them agreeing on term, log extent, applied extent
    /// and state value.
    pub async fn assert_converged(&self, members: &BTreeSet<MemberId>, expected_value: Option<i64>) {
        let mut leaders = vec![];
        let mut reference: Option<MemberMetrics> = None;
        for id in members {
            let member = self.get_member(*id).await;
            let metrics = member.metrics().borrow().clone();
            if metrics.role == Role::Leader {
                leaders.push(*id);
            }
            if let Some(reference) = &reference {
                assert_eq!(
                    metrics.current_term, reference.current_term,
                    "member {} has term {}, expected {}",
                    id, metrics.current_term, reference.current_term
                );
                assert_eq!(
                    metrics.last_log_index, reference.last_log_index,
                    "member {} has last_log_index {}, expected {}",
                    id, metrics.last_log_index, reference.last_log_index
                );
                assert_eq!(
                    metrics.last_applied, reference.last_applied,
                    "member {} has last_applied {}, expected {}",
                    id, metrics.last_applied, reference.last_applied
                );
            } else {
                reference = Some(metrics);
            }
            let state = member.current_state().borrow().clone();
            let state = state.unwrap_or_else(|| panic!("member {} is not initialized", id));
            if let Some(want) = expected_value {
                assert_eq!(
                    state.value, want,
                    "member {} has state value {}, expected {}",
                    id, state.value, want
                );
            }
        }
        assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
    }

    /// Collect a probe from every registered member and assert the
    /// cluster-wide invariants.
    pub async fn check_invariants(&self) {
        let rt = self.routing_table.read().await;
        let members: Vec<MemRaft> = rt.values().map(|(member, _)| member.clone()).collect();
        drop(rt);
        let mut probes = vec![];
        for member in members {
            probes.push(member.probe().await.expect("probe failed"));
        }
        invariants::check_invariants(&probes);
    }
}

#[async_trait]
impl RaftNetwork<MemState> for RaftRouter {
    /// Send a RequestVote RPC to the target member (§5).
    async fn vote(&self, target: MemberId, rpc: VoteRequest) -> Result<VoteResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target member not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target member is isolated"));
        }
        Ok(addr.0.vote(rpc).await?)
    }

    /// Send an AppendEntries RPC to the target member (§5).
    async fn append_entries(&self, target: MemberId, rpc: AppendEntriesRequest<MemState>) -> Result<AppendEntriesResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target member not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target member is isolated"));
        }
        Ok(addr.0.append_entries(rpc).await?)
    }

    /// Send an InstallSnapshot RPC to the target member (§7).
    async fn install_snapshot(&self, target: MemberId, rpc: InstallSnapshotRequest<MemState>) -> Result<InstallSnapshotResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target member not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target member is isolated"));
        }
        Ok(addr.0.install_snapshot(rpc).await?)
    }

    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>> {
        self.tx_connected.subscribe()
    }
}

/// The set of member IDs `0..n`.
pub fn ids(n: u64) -> BTreeSet<MemberId> {
    (0..n).collect()
}

/// Shorthand for a one-member set.
pub fn only(id: MemberId) -> BTreeSet<MemberId> {
    btreeset![id]
}
