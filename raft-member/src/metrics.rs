//! Member metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious
//! use cases are to expose these metrics to a metrics collection system, or
//! to trigger events within higher levels of the parent application — the
//! leader hint for request routing, for instance.
//!
//! Metrics are observed on a running member via the
//! [`Member::metrics`](crate::Member::metrics) method, which returns a
//! watch channel; [`Member::wait`](crate::Member::wait) builds a [`Wait`]
//! helper on top of it for condition-based waiting in tests and tooling.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout_at;
use tokio::time::Instant;

use crate::core::Role;
use crate::membership::MembershipConfig;
use crate::LogIndex;
use crate::MemberId;
use crate::Term;

/// A set of metrics describing the current state of a Raft member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberMetrics {
    /// The ID of the member.
    pub id: MemberId,
    /// The member's current role.
    pub role: Role,
    /// The member's current term.
    pub current_term: Term,
    /// The index of the last entry in the member's log.
    pub last_log_index: LogIndex,
    /// The index of the highest entry known to be committed.
    pub commit_index: LogIndex,
    /// The index of the last entry applied to the state machine.
    pub last_applied: LogIndex,
    /// The leader of the current term, as far as this member knows.
    pub current_leader: Option<MemberId>,
    /// The configuration in effect at this member; `None` for a joiner
    /// which has not yet received a snapshot.
    pub membership_config: Option<MembershipConfig>,
    /// Whether the member has a valid state machine.
    pub initialized: bool,
}

impl MemberMetrics {
    pub(crate) fn new_initial(id: MemberId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: None,
            initialized: false,
        }
    }
}

/// Error variants related to waiting for metrics conditions.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// Timeout occurred while waiting for a condition.
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    /// The member shut down while waiting.
    #[error("the member is shutting down")]
    ShuttingDown,
}

/// A wrapper of the metrics channel which waits for the metrics to satisfy
/// some condition.
pub struct Wait {
    /// The timeout for waiting operations.
    pub timeout: Duration,
    /// The metrics receiver channel.
    pub rx: watch::Receiver<MemberMetrics>,
}

impl Wait {
    /// Wait for the metrics to satisfy the given condition, or time out.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<MemberMetrics, WaitError>
    where T: Fn(&MemberMetrics) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            match timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => {
                    return Err(WaitError::Timeout(
                        self.timeout,
                        format!("{} latest: {:?}", msg.to_string(), latest),
                    ))
                }
            }
        }
    }

    /// Wait for the member to reach the given role.
    pub async fn role(&self, want: Role, msg: impl ToString) -> Result<MemberMetrics, WaitError> {
        self.metrics(
            |m| m.role == want,
            format!("{} .role == {:?}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for `current_leader` to become the given member.
    pub async fn current_leader(&self, leader: MemberId, msg: impl ToString) -> Result<MemberMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            format!("{} .current_leader == {}", msg.to_string(), leader),
        )
        .await
    }

    /// Wait until the log contains exactly `want` entries.
    pub async fn log(&self, want: LogIndex, msg: impl ToString) -> Result<MemberMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index == want,
            format!("{} .last_log_index == {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait until at least `want` entries have been applied.
    pub async fn applied_at_least(&self, want: LogIndex, msg: impl ToString) -> Result<MemberMetrics, WaitError> {
        self.metrics(
            |m| m.last_applied >= want,
            format!("{} .last_applied >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait until exactly `want` entries have been applied.
    pub async fn applied(&self, want: LogIndex, msg: impl ToString) -> Result<MemberMetrics, WaitError> {
        self.metrics(
            |m| m.last_applied == want,
            format!("{} .last_applied == {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait until the member has a valid state machine.
    pub async fn initialized(&self, msg: impl ToString) -> Result<MemberMetrics, WaitError> {
        self.metrics(|m| m.initialized, format!("{} .initialized", msg.to_string())).await
    }

    /// Wait until the voting membership equals the given set.
    pub async fn voting_members(
        &self,
        want: BTreeSet<MemberId>,
        msg: impl ToString,
    ) -> Result<MemberMetrics, WaitError> {
        self.metrics(
            |m| {
                m.membership_config
                    .as_ref()
                    .map(|cfg| !cfg.is_in_joint_consensus() && cfg.membership.voting == want)
                    .unwrap_or(false)
            },
            format!("{} .membership.voting == {:?}", msg.to_string(), want),
        )
        .await
    }
}
