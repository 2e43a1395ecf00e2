//! The Raft network interface.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::MemberId;
use crate::ReplicatedState;

/// A trait defining the interface a Raft member uses to send RPCs to its
/// peers.
///
/// The `send` methods all follow the same rules:
///
/// - the request is delivered by invoking the corresponding RPC entry point
///   on the target's [`Member`](crate::Member);
/// - on success, the peer's reply is returned;
/// - on error, the RPC may or may not have reached the peer. Callers treat
///   delivery failures as transient and retry, consulting
///   [`connected_members`](RaftNetwork::connected_members) to avoid
///   hammering peers that are known to be unreachable;
/// - a send future may be dropped at any await point when the caller is
///   cancelled (step-down, shutdown); a dropped send counts as a failure.
#[async_trait]
pub trait RaftNetwork<S>: Send + Sync + 'static
where S: ReplicatedState
{
    /// Send a RequestVote RPC to the target member (§5).
    async fn vote(&self, target: MemberId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send an AppendEntries RPC to the target member (§5).
    async fn append_entries(&self, target: MemberId, rpc: AppendEntriesRequest<S>) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target member (§7).
    async fn install_snapshot(&self, target: MemberId, rpc: InstallSnapshotRequest<S>)
        -> Result<InstallSnapshotResponse>;

    /// The set of members for which an RPC is likely to succeed, as a
    /// continuously updated observable.
    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>>;
}
