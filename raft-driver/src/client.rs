//! The client-facing API surface.
//!
//! Commands and consistent queries are *leader calls*: they must be served
//! by the current leader, and any other node answers with a redirect. The
//! [`Client`] hides the redirect loop, re-targeting the call as leadership
//! information comes back, bounded by one absolute deadline across all hops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout_at;
use tokio::time::Instant;

use crate::engine::Engine;
use crate::error::CallError;
use crate::event::{
    ClientRequest, CommandKind, DirtyReply, DriverMsg, QueryFn, Reply, ReplyHandle, ReplyMode,
    StateQuerySpec,
};
use crate::registry::Registry;
use crate::status::NodeStatus;
use crate::NodeId;

/// Default timeout for consistent queries, in milliseconds.
pub const DEFAULT_QUERY_TIMEOUT: u64 = 5000;

/// The answer to a state query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateQueryReply {
    /// The full node status.
    All(Box<NodeStatus>),
    /// The current member set.
    Members(std::collections::BTreeSet<NodeId>),
}

/// A handle for issuing client requests against a Raft group.
///
/// Cheap to clone; resolves servers through the shared [`Registry`].
pub struct Client<E: Engine> {
    registry: Arc<Registry<E>>,
}

impl<E: Engine> Client<E> {
    /// Create a client resolving servers through `registry`.
    pub fn new(registry: Arc<Registry<E>>) -> Self {
        Self { registry }
    }

    /// Submit a command to the group via `server`.
    ///
    /// If `server` is not the leader the call is transparently retried
    /// against whichever node the reply pointed at. The returned node id is
    /// the server that actually answered.
    #[tracing::instrument(level = "debug", skip(self, cmd, mode))]
    pub async fn command(
        &self,
        server: &NodeId,
        cmd: E::Command,
        mode: ReplyMode<E>,
        timeout: Duration,
    ) -> Result<(E::Reply, NodeId), CallError> {
        let req = ClientRequest::Command {
            kind: CommandKind::User(cmd),
            mode,
        };
        let (reply, who) = self.leader_call(server, req, timeout).await?;
        match reply {
            Reply::Applied(value) => Ok((value, who)),
            other => {
                tracing::error!(reply = other.name(), "unexpected reply shape for a command call");
                Err(CallError::NodeDown { server: who })
            }
        }
    }

    /// Evaluate `query` against `server`'s machine state, without consensus.
    ///
    /// The result may be stale; the reply carries the applied index and term
    /// it was computed at, plus the leader the node currently believes in.
    #[tracing::instrument(level = "debug", skip(self, query))]
    pub async fn query_dirty(
        &self,
        server: &NodeId,
        query: QueryFn<E>,
        timeout: Duration,
    ) -> Result<(DirtyReply<E>, NodeId), CallError> {
        let deadline = Instant::now() + timeout;
        let tx_api = self.registry.lookup(server).ok_or_else(|| CallError::NoProc {
            server: server.clone(),
        })?;
        let (tx, rx) = oneshot::channel();
        if tx_api.send(DriverMsg::DirtyQuery { query, reply: tx }).is_err() {
            return Err(CallError::NodeDown {
                server: server.clone(),
            });
        }
        match timeout_at(deadline, rx).await {
            Err(_) => Err(CallError::Timeout {
                server: server.clone(),
            }),
            Ok(Err(_)) => Err(CallError::NodeDown {
                server: server.clone(),
            }),
            Ok(Ok(reply)) => Ok((reply, server.clone())),
        }
    }

    /// Evaluate `query` against the machine once the entry reaches
    /// consensus. Equivalent to a command carrying the query payload with
    /// [`ReplyMode::AwaitConsensus`].
    #[tracing::instrument(level = "debug", skip(self, query))]
    pub async fn query_consistent(
        &self,
        server: &NodeId,
        query: QueryFn<E>,
    ) -> Result<(E::Reply, NodeId), CallError> {
        let req = ClientRequest::Command {
            kind: CommandKind::Query(query),
            mode: ReplyMode::AwaitConsensus,
        };
        let timeout = Duration::from_millis(DEFAULT_QUERY_TIMEOUT);
        let (reply, who) = self.leader_call(server, req, timeout).await?;
        match reply {
            Reply::Applied(value) => Ok((value, who)),
            other => {
                tracing::error!(reply = other.name(), "unexpected reply shape for a consistent query");
                Err(CallError::NodeDown { server: who })
            }
        }
    }

    /// Ask the group's leader for its view of the node or member set.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn state_query(
        &self,
        server: &NodeId,
        spec: StateQuerySpec,
        timeout: Duration,
    ) -> Result<(StateQueryReply, NodeId), CallError> {
        let (reply, who) = self.leader_call(server, ClientRequest::StateQuery(spec), timeout).await?;
        match reply {
            Reply::Status(status) => Ok((StateQueryReply::All(status), who)),
            Reply::Members(members) => Ok((StateQueryReply::Members(members), who)),
            other => {
                tracing::error!(reply = other.name(), "unexpected reply shape for a state query");
                Err(CallError::NodeDown { server: who })
            }
        }
    }

    /// Perform a leader call, following redirects until the deadline.
    ///
    /// The deadline is absolute across all hops: a redirect does not buy the
    /// call more time.
    async fn leader_call(
        &self,
        server: &NodeId,
        mut req: ClientRequest<E>,
        timeout: Duration,
    ) -> Result<(Reply<E>, NodeId), CallError> {
        let deadline = Instant::now() + timeout;
        let mut target = server.clone();
        loop {
            let tx_api = self.registry.lookup(&target).ok_or_else(|| CallError::NoProc {
                server: target.clone(),
            })?;
            let (handle, rx) = ReplyHandle::new();
            if tx_api.send(DriverMsg::Call { req, reply: handle }).is_err() {
                return Err(CallError::NodeDown { server: target });
            }
            let reply = match timeout_at(deadline, rx).await {
                Err(_) => return Err(CallError::Timeout { server: target }),
                Ok(Err(_)) => return Err(CallError::NodeDown { server: target }),
                Ok(Ok(reply)) => reply,
            };
            match reply {
                Reply::Redirect { leader, req: bounced } => {
                    tracing::debug!(from=%target, to=%leader, "leader call redirected");
                    req = bounced;
                    target = leader;
                }
                other => return Ok((other, target)),
            }
        }
    }
}

impl<E: Engine> Clone for Client<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}
