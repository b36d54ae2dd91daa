//! Error types exposed by this crate.

use crate::NodeId;

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given value for broadcast_time_ms is too small, must be > 0.
    #[error("the given value for broadcast_time_ms is too small, must be > 0")]
    BroadcastTimeTooSmall,

    /// The given value for sync_interval_ms is too small, must be > 0.
    #[error("the given value for sync_interval_ms is too small, must be > 0")]
    SyncIntervalTooSmall,

    /// The given value for vote_rpc_timeout_ms is too small, must be > 0.
    #[error("the given value for vote_rpc_timeout_ms is too small, must be > 0")]
    VoteRpcTimeoutTooSmall,
}

/// The set of errors a client call may resolve to.
///
/// Every variant carries the server the failing hop was addressed to, which
/// is not necessarily the server the call started at: the redirect loop
/// re-targets the call as leadership information comes in.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CallError {
    /// The caller-side deadline elapsed before a reply arrived.
    #[error("call timed out against {server}")]
    Timeout {
        /// The server being queried when the deadline elapsed.
        server: NodeId,
    },

    /// No driver task is registered under the target id.
    #[error("no process registered for {server}")]
    NoProc {
        /// The server the call was addressed to.
        server: NodeId,
    },

    /// The driver task for the target id has terminated.
    #[error("node {server} is down")]
    NodeDown {
        /// The server the call was addressed to.
        server: NodeId,
    },
}

/// The outcome of a single vote RPC, as reported back to the decision core.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The RPC did not complete within the configured vote timeout.
    #[error("vote RPC timed out")]
    Timeout,

    /// The transport failed to reach the peer.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A fatal condition that terminates the driver task abnormally.
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    /// The decision core emitted a bare `reply` effect while the driver was
    /// not dispatching a call event. This indicates a decision-core bug and
    /// the driver cannot continue safely.
    #[error("reply effect emitted outside of a call context")]
    ProtocolViolation,
}
