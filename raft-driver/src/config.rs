//! Driver runtime configuration.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default broadcast time, in milliseconds.
///
/// All election timeouts are derived from this unit: a follower times out
/// uniformly in `[2T, 5T)` and a candidate in `[2T, 7T)`.
pub const DEFAULT_BROADCAST_TIME: u64 = 100;
/// Default sync timer interval, in milliseconds.
pub const DEFAULT_SYNC_INTERVAL: u64 = 10;
/// Default timeout for a single vote RPC, in milliseconds.
pub const DEFAULT_VOTE_RPC_TIMEOUT: u64 = 500;
/// Default grace period when stopping the replication proxy, in milliseconds.
pub const DEFAULT_PROXY_STOP_GRACE: u64 = 100;

/// The runtime configuration for a Raft role driver.
///
/// The defaults work for clusters with sub-millisecond transport latency.
/// Remember the inequality from the Raft paper when tuning:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`. The driver derives both
/// election ranges from `broadcast_time_ms`, so that single knob moves the
/// whole timing profile at once.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft group.
    ///
    /// This does not influence the protocol in any way, but is useful for
    /// observability.
    pub cluster_name: String,
    /// The base interval from which election timeouts are derived.
    pub broadcast_time_ms: u64,
    /// The one-shot sync timer interval, armed on request by the decision
    /// core to batch log flushes.
    pub sync_interval_ms: u64,
    /// How long a transient vote-request task waits for the peer before
    /// reporting the RPC as timed out.
    pub vote_rpc_timeout_ms: u64,
    /// How long a stopping replication proxy is given to drain before it is
    /// aborted.
    pub proxy_stop_grace_ms: u64,
    /// Seed for the election timer RNG.
    ///
    /// Unset in production; set by tests that need reproducible timer
    /// sequences.
    pub timer_seed: Option<u64>,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            broadcast_time_ms: None,
            sync_interval_ms: None,
            vote_rpc_timeout_ms: None,
            proxy_stop_grace_ms: None,
            timer_seed: None,
        }
    }

    /// Generate a new random follower election timeout in `[2T, 5T)`.
    pub fn new_follower_election_timeout(&self, rng: &mut impl Rng) -> Duration {
        let t = self.broadcast_time_ms;
        Duration::from_millis(rng.gen_range(2 * t..5 * t))
    }

    /// Generate a new random candidate election timeout in `[2T, 7T)`.
    ///
    /// The wider range spreads competing candidates further apart than
    /// followers, so a split vote resolves instead of repeating.
    pub fn new_candidate_election_timeout(&self, rng: &mut impl Rng) -> Duration {
        let t = self.broadcast_time_ms;
        Duration::from_millis(rng.gen_range(2 * t..7 * t))
    }

    /// The sync timer interval as a `Duration`.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// The vote RPC timeout as a `Duration`.
    pub fn vote_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_rpc_timeout_ms)
    }

    /// The proxy stop grace period as a `Duration`.
    pub fn proxy_stop_grace(&self) -> Duration {
        Duration::from_millis(self.proxy_stop_grace_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster_name: "default".to_string(),
            broadcast_time_ms: DEFAULT_BROADCAST_TIME,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL,
            vote_rpc_timeout_ms: DEFAULT_VOTE_RPC_TIMEOUT,
            proxy_stop_grace_ms: DEFAULT_PROXY_STOP_GRACE,
            timer_seed: None,
        }
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft group.
    pub cluster_name: String,
    /// The base interval from which election timeouts are derived.
    pub broadcast_time_ms: Option<u64>,
    /// The one-shot sync timer interval.
    pub sync_interval_ms: Option<u64>,
    /// The timeout for a single vote RPC.
    pub vote_rpc_timeout_ms: Option<u64>,
    /// The grace period when stopping the replication proxy.
    pub proxy_stop_grace_ms: Option<u64>,
    /// Seed for the election timer RNG.
    pub timer_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `broadcast_time_ms`.
    pub fn broadcast_time_ms(mut self, val: u64) -> Self {
        self.broadcast_time_ms = Some(val);
        self
    }

    /// Set the desired value for `sync_interval_ms`.
    pub fn sync_interval_ms(mut self, val: u64) -> Self {
        self.sync_interval_ms = Some(val);
        self
    }

    /// Set the desired value for `vote_rpc_timeout_ms`.
    pub fn vote_rpc_timeout_ms(mut self, val: u64) -> Self {
        self.vote_rpc_timeout_ms = Some(val);
        self
    }

    /// Set the desired value for `proxy_stop_grace_ms`.
    pub fn proxy_stop_grace_ms(mut self, val: u64) -> Self {
        self.proxy_stop_grace_ms = Some(val);
        self
    }

    /// Seed the election timer RNG for reproducible timer sequences.
    pub fn timer_seed(mut self, val: u64) -> Self {
        self.timer_seed = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let broadcast_time_ms = self.broadcast_time_ms.unwrap_or(DEFAULT_BROADCAST_TIME);
        if broadcast_time_ms == 0 {
            return Err(ConfigError::BroadcastTimeTooSmall);
        }
        let sync_interval_ms = self.sync_interval_ms.unwrap_or(DEFAULT_SYNC_INTERVAL);
        if sync_interval_ms == 0 {
            return Err(ConfigError::SyncIntervalTooSmall);
        }
        let vote_rpc_timeout_ms = self.vote_rpc_timeout_ms.unwrap_or(DEFAULT_VOTE_RPC_TIMEOUT);
        if vote_rpc_timeout_ms == 0 {
            return Err(ConfigError::VoteRpcTimeoutTooSmall);
        }
        let proxy_stop_grace_ms = self.proxy_stop_grace_ms.unwrap_or(DEFAULT_PROXY_STOP_GRACE);
        Ok(Config {
            cluster_name: self.cluster_name,
            broadcast_time_ms,
            sync_interval_ms,
            vote_rpc_timeout_ms,
            proxy_stop_grace_ms,
            timer_seed: self.timer_seed,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
