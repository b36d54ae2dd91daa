//! The local process registry.
//!
//! A driver task registers its mailbox under the node id when it starts and
//! deregisters when it terminates, the same lifecycle a named process would
//! have. Clients resolve targets through the registry; a missing entry maps
//! to "no such process", a closed mailbox to "node down".

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::engine::Engine;
use crate::event::DriverMsg;
use crate::NodeId;

/// A table of running driver tasks, keyed by node id.
pub struct Registry<E: Engine> {
    table: RwLock<HashMap<NodeId, mpsc::UnboundedSender<DriverMsg<E>>>>,
}

impl<E: Engine> Registry<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, id: NodeId, tx: mpsc::UnboundedSender<DriverMsg<E>>) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.insert(id.clone(), tx).is_some() {
            tracing::warn!(node = %id, "registering over a live entry, replacing");
        }
    }

    pub(crate) fn deregister(&self, id: &NodeId) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.remove(id);
    }

    pub(crate) fn lookup(&self, id: &NodeId) -> Option<mpsc::UnboundedSender<DriverMsg<E>>> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.get(id).cloned()
    }

    /// The ids currently registered.
    pub fn registered(&self) -> Vec<NodeId> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.keys().cloned().collect()
    }
}

impl<E: Engine> Default for Registry<E> {
    fn default() -> Self {
        Self::new()
    }
}
