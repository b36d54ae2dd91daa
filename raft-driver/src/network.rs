//! The transport interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::Engine;
use crate::NodeId;

/// A trait defining how the driver reaches its peers.
///
/// Implementations deliver payloads by opaque node id; the driver never
/// learns addresses or wire formats. `send` must not block the caller:
/// delivery failures are invisible to the driver and surface, if at all, as
/// missing acknowledgements at the protocol level.
#[async_trait]
pub trait Transport<E: Engine>: Send + Sync + 'static {
    /// Perform a synchronous vote call against the target node.
    async fn vote(&self, target: &NodeId, req: E::VoteRequest) -> Result<E::VoteReply>;

    /// Fire-and-forget a protocol message to the target node.
    fn send(&self, target: &NodeId, msg: E::Message);
}
