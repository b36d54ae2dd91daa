//! The public handle to a running driver task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::engine::{Engine, EngineConfig};
use crate::error::{CallError, Fatal};
use crate::event::{DriverMsg, Reply, ReplyHandle};
use crate::network::Transport;
use crate::proxy::ProxySpawner;
use crate::registry::Registry;
use crate::status::{NodeStatus, Wait};
use crate::NodeId;

struct NodeInner<E: Engine> {
    id: NodeId,
    tx_api: mpsc::UnboundedSender<DriverMsg<E>>,
    rx_status: watch::Receiver<NodeStatus>,
    handle: Mutex<Option<JoinHandle<Result<(), Fatal>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// A running Raft node.
///
/// Spawning a node starts its driver task and registers the mailbox under
/// the node id; the handle is the only way in from the outside. Clone it
/// liberally, the clone is an `Arc` bump.
pub struct Node<E: Engine> {
    inner: Arc<NodeInner<E>>,
}

impl<E: Engine> Node<E> {
    /// Create and spawn a new driver task.
    ///
    /// The decision core is built inside the task from `engine_config`; the
    /// transport delivers peer-bound payloads; the proxy spawner supplies
    /// the replication sub-driver when this node leads.
    #[tracing::instrument(level="debug", skip(config, engine_config, transport, proxy_spawner, registry), fields(id=%engine_config.id, cluster=%config.cluster_name))]
    pub fn spawn<T, P>(
        config: Arc<Config>,
        engine_config: EngineConfig,
        transport: Arc<T>,
        proxy_spawner: Arc<P>,
        registry: Arc<Registry<E>>,
    ) -> Self
    where
        T: Transport<E>,
        P: ProxySpawner<E>,
    {
        let id = engine_config.id.clone();
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_status, rx_status) =
            watch::channel(NodeStatus::initial(id.clone(), engine_config.cluster.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        registry.register(id.clone(), tx_api.clone());
        let handle = RaftCore::spawn(
            config,
            engine_config,
            transport,
            proxy_spawner,
            registry,
            tx_api.clone(),
            rx_api,
            tx_status,
            rx_shutdown,
        );

        let inner = NodeInner {
            id,
            tx_api,
            rx_status,
            handle: Mutex::new(Some(handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Self { inner: Arc::new(inner) }
    }

    /// This node's id.
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Inject a protocol message from a peer.
    ///
    /// This is the inbound half of the transport: whatever carried the
    /// payload across calls this on the receiving side.
    pub fn deliver(&self, from: NodeId, msg: E::Message) {
        let _ = self.inner.tx_api.send(DriverMsg::Peer { from, msg });
    }

    /// Submit a vote request from a campaigning peer and wait for the
    /// answer.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id=%self.inner.id))]
    pub async fn vote(&self, from: NodeId, req: E::VoteRequest) -> Result<E::VoteReply, CallError> {
        let (handle, rx) = ReplyHandle::new();
        if self
            .inner
            .tx_api
            .send(DriverMsg::VoteCall { from, req, reply: handle })
            .is_err()
        {
            return Err(CallError::NodeDown {
                server: self.inner.id.clone(),
            });
        }
        match rx.await {
            Ok(Reply::Vote(reply)) => Ok(reply),
            Ok(other) => {
                tracing::error!(reply = other.name(), "unexpected reply shape for a vote call");
                Err(CallError::NodeDown {
                    server: self.inner.id.clone(),
                })
            }
            Err(_) => Err(CallError::NodeDown {
                server: self.inner.id.clone(),
            }),
        }
    }

    /// Force an election timeout, as if the timer had fired.
    ///
    /// Intended for operators and tests; a healthy cluster never needs it.
    pub fn trigger_election(&self) {
        let _ = self.inner.tx_api.send(DriverMsg::TriggerElection);
    }

    /// Get a handle to the status channel.
    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.inner.rx_status.clone()
    }

    /// Get a handle to wait for the status to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_status.clone(),
        }
    }

    /// Shut this node down and wait for the driver task to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.handle.lock().await.take() {
            handle.await??;
        }
        Ok(())
    }
}

impl<E: Engine> Clone for Node<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
