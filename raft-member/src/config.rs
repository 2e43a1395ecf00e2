//! Runtime configuration for a Raft member.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 1000;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 2000;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 500;
/// Default timeout for sending a whole-value snapshot, in milliseconds.
pub const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 10_000;

/// The runtime configuration for a Raft member.
///
/// The defaults are deliberately on the slow side: they keep idle clusters
/// quiet on the wire at the cost of a longer window of unavailability when
/// a leader dies. Values may be tuned, but the validation in
/// [`ConfigBuilder::validate`] always enforces the inequality the protocol
/// depends on: the heartbeat interval must be much smaller than the
/// election timeout minimum, else healthy leaders get deposed by their own
/// followers.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    ///
    /// This does not influence the protocol in any way, but is useful for
    /// observability.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The interval in milliseconds at which leaders send heartbeats.
    ///
    /// This also bounds the send rate of a replication stream and is used
    /// as the per-RPC timeout for append-entries sends.
    pub heartbeat_interval: u64,
    /// The per-RPC timeout in milliseconds for sending a snapshot.
    ///
    /// Snapshots carry the whole state machine value, so they are given a
    /// far more generous timeout than ordinary replication traffic.
    pub install_snapshot_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call
    /// `validate` when done.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            install_snapshot_timeout: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: Option<u64>,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: Option<u64>,
    /// The interval at which leaders send heartbeats, in milliseconds.
    pub heartbeat_interval: Option<u64>,
    /// The timeout for sending a snapshot, in milliseconds.
    pub install_snapshot_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config`
    /// instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::ElectionTimeoutLessThanHeartbeatInterval);
        }
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT);
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            install_snapshot_timeout,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
