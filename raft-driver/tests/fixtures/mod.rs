//! Fixtures for testing the role driver against the in-memory engine.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use memengine::{MemEngine, MemMessage, MemProxySpawner, VoteReply, VoteRequest};
use raft_driver::client::Client;
use raft_driver::engine::EngineConfig;
use raft_driver::network::Transport;
use raft_driver::registry::Registry;
use raft_driver::{Config, Node, NodeId, Role};
use tracing_subscriber::prelude::*;

/// A concrete node type used during testing.
pub type MemNode = Node<MemEngine>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A type which emulates a network transport between in-process nodes.
///
/// Isolated nodes can neither send nor receive frames, vote calls included.
pub struct Router {
    table: RwLock<BTreeMap<NodeId, MemNode>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
        }
    }

    pub fn add(&self, node: MemNode) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.insert(node.id().clone(), node);
    }

    pub fn get(&self, id: &NodeId) -> Option<MemNode> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.get(id).cloned()
    }

    /// Cut the given node off from the network.
    pub fn isolate(&self, id: &NodeId) {
        self.isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
    }

    /// Restore the given node's network.
    pub fn restore(&self, id: &NodeId) {
        self.isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn is_isolated(&self, id: &NodeId) -> bool {
        self.isolated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

#[async_trait]
impl Transport<MemEngine> for Router {
    async fn vote(&self, target: &NodeId, req: VoteRequest) -> Result<VoteReply> {
        if self.is_isolated(&req.candidate) || self.is_isolated(target) {
            bail!("vote call dropped: network isolated");
        }
        let node = self.get(target).ok_or_else(|| anyhow!("no route to {}", target))?;
        let reply = node.vote(req.candidate.clone(), req).await?;
        Ok(reply)
    }

    fn send(&self, target: &NodeId, msg: MemMessage) {
        let from = match &msg {
            MemMessage::Append { leader, .. } => leader.clone(),
            MemMessage::AppendOk { from, .. } => from.clone(),
        };
        if self.is_isolated(&from) || self.is_isolated(target) {
            return;
        }
        if let Some(node) = self.get(target) {
            node.deliver(from, msg);
        }
    }
}

/// An in-process cluster: nodes, transport, proxies and a client.
pub struct Cluster {
    pub config: Arc<Config>,
    pub router: Arc<Router>,
    pub registry: Arc<Registry<MemEngine>>,
    pub proxies: Arc<MemProxySpawner<Router>>,
    pub client: Client<MemEngine>,
    pub nodes: BTreeMap<NodeId, MemNode>,
}

impl Cluster {
    /// Spawn a cluster with the default test config.
    ///
    /// The broadcast time is deliberately long so no node elects itself
    /// behind a test's back; elections are forced via `trigger_election`.
    pub fn new(names: &[&str]) -> Self {
        let config = Arc::new(
            Config::build("fixture".to_string())
                .broadcast_time_ms(1000)
                .sync_interval_ms(10)
                .timer_seed(7)
                .validate()
                .expect("fixture config must be valid"),
        );
        Self::with_config(names, config)
    }

    /// Spawn a cluster with the given config.
    pub fn with_config(names: &[&str], config: Arc<Config>) -> Self {
        let router = Arc::new(Router::new());
        let registry = Arc::new(Registry::new());
        let proxies = Arc::new(MemProxySpawner::new(router.clone()));
        let cluster_ids: BTreeSet<NodeId> = names.iter().map(|n| NodeId::from(*n)).collect();

        let mut nodes = BTreeMap::new();
        for id in &cluster_ids {
            let node = Node::spawn(
                config.clone(),
                EngineConfig {
                    id: id.clone(),
                    cluster: cluster_ids.clone(),
                },
                router.clone(),
                proxies.clone(),
                registry.clone(),
            );
            router.add(node.clone());
            nodes.insert(id.clone(), node);
        }

        let client = Client::new(registry.clone());
        Self {
            config,
            router,
            registry,
            proxies,
            client,
            nodes,
        }
    }

    pub fn node(&self, id: &NodeId) -> &MemNode {
        self.nodes.get(id).expect("unknown node id in fixture")
    }

    /// Force an election on `id` and wait until it leads.
    pub async fn elect(&self, id: &NodeId) -> Result<()> {
        let node = self.node(id);
        node.trigger_election();
        node.wait(Some(Duration::from_secs(5))).role(Role::Leader, "elect").await?;
        Ok(())
    }

    /// Wait until `id` believes `leader` leads the group.
    pub async fn wait_leader_known(&self, id: &NodeId, leader: &NodeId) -> Result<()> {
        self.node(id)
            .wait(Some(Duration::from_secs(5)))
            .leader(leader, "learn leader")
            .await?;
        Ok(())
    }

    /// Wait until every node has applied at least `index`.
    pub async fn wait_applied(&self, index: u64) -> Result<()> {
        for node in self.nodes.values() {
            node.wait(Some(Duration::from_secs(5)))
                .applied(index, "replicate")
                .await?;
        }
        Ok(())
    }
}
