//! The public interface to a running Raft member.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::MemberCore;
use crate::error::ChangeConfigError;
use crate::error::CompactionError;
use crate::error::MemberError;
use crate::error::MemberResult;
use crate::error::ProposeError;
use crate::invariants::MemberProbe;
use crate::membership::Membership;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::metrics::MemberMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::storage::PersistentState;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::MemberId;
use crate::ReplicatedState;

struct MemberInner<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> {
    tx_api: mpsc::UnboundedSender<MemberMsg<S>>,
    rx_metrics: watch::Receiver<MemberMetrics>,
    rx_state: watch::Receiver<Option<S>>,
    core_handle: Mutex<Option<JoinHandle<MemberResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_st: std::marker::PhantomData<St>,
}

/// The API handle to a single member of a Raft cluster.
///
/// Constructing one spawns the member's core task, which manages all
/// activity of this member: the election watchdog, campaigning, log
/// replication while leading, and the inbound halves of the three RPCs.
/// The handle itself is cheap to clone and all of its methods go through a
/// message channel to the core task, so it can be shared freely.
///
/// ### shutting down
/// If any method returns `MemberError::ShuttingDown`, the member has
/// stopped (possibly for data safety after a storage failure) and
/// [`shutdown`](Member::shutdown) should be called to await the core
/// task's exit. A method call interrupted by shutdown may or may not have
/// taken effect locally, but persisted state is always left consistent.
pub struct Member<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> {
    inner: Arc<MemberInner<S, N, St>>,
}

impl<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> Member<S, N, St> {
    /// Create and spawn a new Raft member.
    ///
    /// ### `id`
    /// The ID this member identifies itself by within the cluster. Must be
    /// stable across restarts.
    ///
    /// ### `persistent_state`
    /// The state recovered through the storage layer on boot. For a member
    /// of a brand new cluster use
    /// [`PersistentState::new_initial`](crate::PersistentState::new_initial)
    /// (identically on every founding member); for a member joining an
    /// existing cluster use
    /// [`PersistentState::new_joining`](crate::PersistentState::new_joining).
    #[tracing::instrument(level = "debug", skip(config, network, storage, persistent_state), fields(cluster = %config.cluster_name))]
    pub fn new(
        id: MemberId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<St>,
        persistent_state: PersistentState<S>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(MemberMetrics::new_initial(id));
        let (tx_state, rx_state) = watch::channel(None);
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = MemberCore::spawn(
            id,
            config,
            network,
            storage,
            persistent_state,
            rx_api,
            tx_metrics,
            tx_state,
            rx_shutdown,
        );
        let inner = MemberInner {
            tx_api,
            rx_metrics,
            rx_state,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_st: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this member.
    ///
    /// These are sent by the cluster leader to replicate log entries
    /// (§5.3) and as heartbeats (§5.2).
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<S>) -> Result<AppendEntriesResponse, MemberError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(MemberMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a RequestVote RPC to this member.
    ///
    /// These are sent by candidates gathering votes (§5.2).
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, MemberError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(MemberMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this member.
    ///
    /// These are sent by the leader to bring a new or lagging member up to
    /// speed (§7).
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest<S>) -> Result<InstallSnapshotResponse, MemberError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(MemberMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Propose a state machine change to this member.
    ///
    /// `Ok(())` means the change has been appended to the leader's log and
    /// made durable; commitment is asynchronous and is not waited for. A
    /// member which is not the leader refuses with
    /// [`ProposeError::NotLeader`], carrying a leader hint for redirect.
    ///
    /// There is no duplicate suppression: a caller which retries after an
    /// ambiguous outcome must handle idempotence itself.
    pub async fn propose_change(&self, change: S::Change) -> Result<(), ProposeError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(MemberMsg::ProposeChange { change, tx }, rx).await
    }

    /// Propose a cluster configuration change to this member.
    ///
    /// The change runs through joint consensus: the leader first commits a
    /// joint configuration carrying the old and new membership, then the
    /// new configuration alone. If the leader is not part of the new
    /// configuration's voting set, it steps down once the final entry
    /// commits.
    ///
    /// `Ok(())` means the joint entry has been appended and made durable;
    /// the transition completes asynchronously. At most one
    /// reconfiguration may be in flight at a time.
    pub async fn propose_config_change(&self, membership: Membership) -> Result<(), ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(MemberMsg::ProposeConfigChange { membership, tx }, rx).await
    }

    /// Snapshot the applied state and compact the log prefix it covers,
    /// returning the new log base index.
    ///
    /// When to compact is policy and stays with the caller; this is the
    /// mechanism only.
    pub async fn compact_log(&self) -> Result<LogIndex, CompactionError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(MemberMsg::CompactLog { tx }, rx).await
    }

    /// Track the applied state of this member's state machine.
    ///
    /// The value is `None` until the member is initialized: immediately for
    /// founding members, after the first snapshot arrives for joiners.
    pub fn current_state(&self) -> watch::Receiver<Option<S>> {
        self.inner.rx_state.clone()
    }

    /// Wait until this member has a valid state machine.
    ///
    /// Returns immediately for founding members; for a member joining an
    /// existing cluster this resolves once the leader has installed the
    /// first snapshot.
    pub async fn initialized(&self) -> MemberResult<()> {
        let mut rx = self.inner.rx_state.clone();
        loop {
            if rx.borrow().is_some() {
                return Ok(());
            }
            rx.changed().await.map_err(|_| MemberError::ShuttingDown)?;
        }
    }

    /// The member this member thinks is the current leader, if any.
    ///
    /// This hint does a good job of staying current, but it is a hint:
    /// only the consensus protocol itself decides what commits.
    pub fn leader_hint(&self) -> Option<MemberId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<MemberMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Take a snapshot of this member's state for the cluster-wide
    /// invariant checker. Intended for tests and debugging.
    pub async fn probe(&self) -> MemberResult<MemberProbe<S>> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(MemberMsg::Probe { tx })
            .map_err(|_| MemberError::ShuttingDown)?;
        rx.await.map_err(|_| MemberError::ShuttingDown)
    }

    /// Shut this member down, waiting for its background tasks to drain.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }

    /// Invoke the member core by sending a message and awaiting the
    /// response.
    pub(crate) async fn call_core<T, E>(&self, msg: MemberMsg<S>, rx: MemberRespRx<T, E>) -> Result<T, E>
    where E: From<MemberError> {
        let send_res = self.inner.tx_api.send(msg);
        if send_res.is_err() {
            return Err(MemberError::ShuttingDown.into());
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(MemberError::ShuttingDown.into()),
        }
    }
}

impl<S: ReplicatedState, N: RaftNetwork<S>, St: RaftStorage<S>> Clone for Member<S, N, St> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type MemberRespTx<T, E> = oneshot::Sender<Result<T, E>>;
pub(crate) type MemberRespRx<T, E> = oneshot::Receiver<Result<T, E>>;

/// A message from the API handle to the member core.
pub(crate) enum MemberMsg<S: ReplicatedState> {
    AppendEntries {
        rpc: AppendEntriesRequest<S>,
        tx: MemberRespTx<AppendEntriesResponse, MemberError>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: MemberRespTx<VoteResponse, MemberError>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest<S>,
        tx: MemberRespTx<InstallSnapshotResponse, MemberError>,
    },
    ProposeChange {
        change: S::Change,
        tx: MemberRespTx<(), ProposeError>,
    },
    ProposeConfigChange {
        membership: Membership,
        tx: MemberRespTx<(), ChangeConfigError>,
    },
    CompactLog {
        tx: MemberRespTx<LogIndex, CompactionError>,
    },
    Probe {
        tx: oneshot::Sender<MemberProbe<S>>,
    },
}
