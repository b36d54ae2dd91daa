//! A replication proxy that coalesces non-urgent batches.
//!
//! Urgent batches go out the moment they arrive; non-urgent ones replace any
//! batch still waiting and are flushed on the interval tick. The net effect
//! is that a busy leader sends at most one heartbeat-shaped batch per
//! interval, while client commands are never delayed.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use raft_driver::network::Transport;
use raft_driver::proxy::{ProxyContext, ProxyMsg, ProxySpawner};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;

use crate::{MemBatch, MemEngine};

/// Spawns replication proxy tasks that forward batches over the transport.
pub struct MemProxySpawner<T> {
    transport: Arc<T>,
    live: Mutex<Vec<AbortHandle>>,
}

impl<T: Transport<MemEngine>> MemProxySpawner<T> {
    /// Create a spawner forwarding batches over `transport`.
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            live: Mutex::new(Vec::new()),
        }
    }

    /// Abort every proxy task spawned so far. Returns how many were killed.
    ///
    /// Test hook: the driver under test must notice the exit and respawn.
    pub fn kill_all(&self) -> usize {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let n = live.len();
        for handle in live.drain(..) {
            handle.abort();
        }
        n
    }
}

fn send_all<T: Transport<MemEngine>>(transport: &T, batch: MemBatch) {
    for (target, msg) in batch {
        transport.send(&target, msg);
    }
}

impl<T: Transport<MemEngine>> ProxySpawner<MemEngine> for MemProxySpawner<T> {
    fn start(
        &self,
        ctx: ProxyContext,
        mut rx: mpsc::UnboundedReceiver<ProxyMsg<MemEngine>>,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let span = tracing::debug_span!("replication_proxy", parent_node = %ctx.parent);
        let handle = tokio::spawn(
            async move {
                let mut waiting: Option<MemBatch> = None;
                let mut tick = tokio::time::interval(ctx.interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        msg = rx.recv() => match msg {
                            Some(ProxyMsg::Rpcs { urgent: true, batch }) => {
                                send_all(transport.as_ref(), batch);
                            }
                            Some(ProxyMsg::Rpcs { urgent: false, batch }) => {
                                waiting = Some(batch);
                            }
                            Some(ProxyMsg::Stop) | None => {
                                if let Some(batch) = waiting.take() {
                                    send_all(transport.as_ref(), batch);
                                }
                                return;
                            }
                        },
                        _ = tick.tick() => {
                            if let Some(batch) = waiting.take() {
                                send_all(transport.as_ref(), batch);
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.abort_handle());
        handle
    }
}
