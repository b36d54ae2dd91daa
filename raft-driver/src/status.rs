//! Node status for observability.
//!
//! Every driver task publishes its view of the group on a watch channel:
//! role, term, believed leader, applied index and membership. Applications
//! may feed this into a metrics system; the test-suite uses the [`Wait`]
//! helper to block until a node reaches an expected state.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout_at;
use tokio::time::Instant;

use crate::{NodeId, Role};

/// A snapshot of a driver's current view of itself and the group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// The node's id.
    pub id: NodeId,
    /// The node's current role.
    pub role: Role,
    /// The node's current term.
    pub current_term: u64,
    /// The leader this node currently believes in.
    pub leader: Option<NodeId>,
    /// The index of the last entry applied to the machine.
    pub last_applied: u64,
    /// The ids of every member of the group.
    pub members: BTreeSet<NodeId>,
}

impl NodeStatus {
    pub(crate) fn initial(id: NodeId, members: BTreeSet<NodeId>) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            leader: None,
            last_applied: 0,
            members,
        }
    }
}

/// Error variants related to waiting for status conditions.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// Timeout occurred while waiting for a condition.
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    /// The node shut down while waiting.
    #[error("node is shutting down")]
    ShuttingDown,
}

/// A helper that blocks until a node's status satisfies some condition.
pub struct Wait {
    /// The timeout for each waiting operation.
    pub timeout: Duration,
    /// The status receiver channel.
    pub rx: watch::Receiver<NodeStatus>,
}

impl Wait {
    /// Wait for the status to satisfy `func` or time out.
    #[tracing::instrument(level = "trace", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn status<T>(&self, func: T, msg: impl ToString) -> Result<NodeStatus, WaitError>
    where T: Fn(&NodeStatus) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            match timeout_at(deadline, rx.changed()).await {
                Err(_) => {
                    return Err(WaitError::Timeout(
                        self.timeout,
                        format!("{} latest: {:?}", msg.to_string(), latest),
                    ))
                }
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Wait for the node to assume `role`.
    pub async fn role(&self, role: Role, msg: impl ToString) -> Result<NodeStatus, WaitError> {
        self.status(|s| s.role == role, format!("{} .role == {:?}", msg.to_string(), role)).await
    }

    /// Wait for the node to believe in `leader`.
    pub async fn leader(&self, leader: &NodeId, msg: impl ToString) -> Result<NodeStatus, WaitError> {
        self.status(
            |s| s.leader.as_ref() == Some(leader),
            format!("{} .leader == {}", msg.to_string(), leader),
        )
        .await
    }

    /// Wait for the applied index to reach at least `index`.
    pub async fn applied(&self, index: u64, msg: impl ToString) -> Result<NodeStatus, WaitError> {
        self.status(
            |s| s.last_applied >= index,
            format!("{} .last_applied >= {}", msg.to_string(), index),
        )
        .await
    }

    /// Wait for the term to reach at least `term`.
    pub async fn term(&self, term: u64, msg: impl ToString) -> Result<NodeStatus, WaitError> {
        self.status(
            |s| s.current_term >= term,
            format!("{} .current_term >= {}", msg.to_string(), term),
        )
        .await
    }
}
