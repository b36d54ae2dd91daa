//! An async per-node Raft role driver.
//!
//! This crate implements the machinery that sits between inbound Raft
//! protocol events (peer RPCs, timers, client commands, vote replies) and a
//! pure, pluggable decision core. The decision core, anything implementing
//! the [`Engine`] trait, only ever computes `(next role, effects)` from
//! `(current role, event)`; the driver owns the event loop, executes the
//! effects, schedules the election and sync timers, buffers client commands
//! that arrive while no leader is known, and supervises the replication
//! proxy on the leader's behalf.

pub mod client;
pub mod config;
mod core;
pub mod effect;
pub mod engine;
pub mod error;
pub mod event;
pub mod network;
pub mod node;
pub mod proxy;
pub mod registry;
pub mod status;

pub use async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use crate::client::Client;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::effect::Effect;
pub use crate::engine::Engine;
pub use crate::engine::EngineConfig;
pub use crate::engine::Transition;
pub use crate::error::CallError;
pub use crate::error::ConfigError;
pub use crate::error::Fatal;
pub use crate::error::RpcError;
pub use crate::event::Class;
pub use crate::event::Event;
pub use crate::event::ReplyMode;
pub use crate::network::Transport;
pub use crate::node::Node;
pub use crate::proxy::ProxySpawner;
pub use crate::registry::Registry;
pub use crate::status::NodeStatus;
pub use crate::status::Wait;

/// The address by which a node is reached within its Raft group.
///
/// Structurally either a bare name or a name qualified by the host it runs
/// on. Must be unique within the group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeId {
    /// A node addressed by bare name.
    Name(String),
    /// A node addressed by name and host.
    Remote { name: String, host: String },
}

impl NodeId {
    /// The node's bare name, without any host qualification.
    pub fn name(&self) -> &str {
        match self {
            NodeId::Name(name) => name,
            NodeId::Remote { name, .. } => name,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeId::Name(name) => write!(f, "{}", name),
            NodeId::Remote { name, host } => write!(f, "{}@{}", name, host),
        }
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        NodeId::Name(name.to_string())
    }
}

/// The local Raft role of a node.
///
/// A node always boots as a follower; every other role is reached through a
/// transition emitted by the decision core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The node is replicating entries from the leader.
    Follower,
    /// The node is campaigning to become the group leader.
    Candidate,
    /// The node is the group leader.
    Leader,
}

impl Role {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// A trait defining application specific command data.
///
/// Applications using this crate present their command payloads as-is to the
/// decision core; the driver never inspects them. The serde bounds exist so
/// a transport or log store can move the payloads without an extra
/// translation layer in between.
pub trait AppData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific reply data.
///
/// This is the value a command reply or consensus notification carries back
/// to the client, produced by the decision core when it decides a command's
/// fate.
pub trait AppDataResponse: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}
