//! The replication proxy contract.
//!
//! The proxy is the sub-driver that ships append-entries batches to peers on
//! the leader's behalf: it may coalesce non-urgent batches on its own
//! interval, but urgent batches go out immediately. This crate only defines
//! the contract and the supervision around it; the actual replication logic
//! is supplied by the application (or, in tests, by `memengine`).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::engine::Engine;
use crate::NodeId;

/// A message sent from the driver to the replication proxy.
#[derive(Debug)]
pub enum ProxyMsg<E: Engine> {
    /// Replicate a batch. Urgent batches bypass coalescing.
    Rpcs {
        /// Whether the batch must go out immediately.
        urgent: bool,
        /// The batch to replicate.
        batch: E::Batch,
    },
    /// Drain and exit.
    Stop,
}

/// Context handed to a freshly started proxy.
#[derive(Clone, Debug)]
pub struct ProxyContext {
    /// The id of the leader that spawned this proxy.
    pub parent: NodeId,
    /// The coalescing interval for non-urgent batches.
    pub interval: Duration,
}

/// A factory for replication proxy tasks.
pub trait ProxySpawner<E: Engine>: Send + Sync + 'static {
    /// Spawn the proxy task. The task must read `rx` until it receives
    /// [`ProxyMsg::Stop`] or the channel closes, then return.
    fn start(&self, ctx: ProxyContext, rx: mpsc::UnboundedReceiver<ProxyMsg<E>>) -> JoinHandle<()>;
}

/// The driver's handle to a live proxy task.
pub(crate) struct ProxyHandle<E: Engine> {
    tx: mpsc::UnboundedSender<ProxyMsg<E>>,
    abort: AbortHandle,
    pub(crate) generation: u64,
}

impl<E: Engine> ProxyHandle<E> {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<ProxyMsg<E>>,
        abort: AbortHandle,
        generation: u64,
    ) -> Self {
        Self { tx, abort, generation }
    }

    /// Hand a batch to the proxy. Delivery failures are ignored: a dead
    /// proxy announces itself through its exit notice and the driver
    /// restarts it with a rebuilt batch.
    pub(crate) fn forward(&self, urgent: bool, batch: E::Batch) {
        let _ = self.tx.send(ProxyMsg::Rpcs { urgent, batch });
    }

    /// Ask the proxy to drain and exit, aborting it after `grace`.
    pub(crate) fn stop(self, reason: &'static str, grace: Duration) {
        tracing::debug!(generation = self.generation, reason, "stopping replication proxy");
        let _ = self.tx.send(ProxyMsg::Stop);
        let abort = self.abort;
        tokio::spawn(async move {
            sleep(grace).await;
            abort.abort();
        });
    }
}
