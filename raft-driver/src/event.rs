//! Events, command envelopes and reply plumbing.
//!
//! Everything the driver task receives is one of the message variants
//! defined here; everything the decision core sees is an [`Event`]. The
//! split matters: the driver resolves leader-call routing, dirty queries and
//! proxy lifecycle notices itself, and only the remainder reaches the core.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::engine::Engine;
use crate::error::RpcError;
use crate::status::NodeStatus;
use crate::NodeId;

/// The class of the event currently being dispatched.
///
/// A call expects a reply bound to the caller's handle; a cast and an
/// unsolicited info message do not. Events injected through the `next_event`
/// effect inherit the class of the event that produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    /// A synchronous client request.
    Call,
    /// An asynchronous message with no reply expected.
    Cast,
    /// An unsolicited message: peer RPC, timer, child exit.
    Info,
}

/// A clonable, single-shot reply slot bound to one caller.
///
/// The slot can be handed to the decision core inside a command envelope,
/// buffered across role changes and cloned freely; whichever copy replies
/// first wins, every later send is a no-op.
pub struct ReplyHandle<E: Engine> {
    slot: Arc<Mutex<Option<oneshot::Sender<Reply<E>>>>>,
}

impl<E: Engine> ReplyHandle<E> {
    /// Create a fresh handle together with the receiving end of the reply.
    pub fn new() -> (Self, oneshot::Receiver<Reply<E>>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (handle, rx)
    }

    /// Deliver the reply to the caller.
    ///
    /// Returns `false` if this handle already replied or the caller went
    /// away.
    pub fn send(&self, reply: Reply<E>) -> bool {
        let tx = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Whether this handle has already been used to reply.
    pub fn is_spent(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

impl<E: Engine> Clone for ReplyHandle<E> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<E: Engine> fmt::Debug for ReplyHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle").field("spent", &self.is_spent()).finish()
    }
}

/// The channel over which consensus notifications are delivered for
/// commands submitted with [`ReplyMode::NotifyOnConsensus`].
pub type NotifyTx<E> = mpsc::UnboundedSender<<E as Engine>::Reply>;

/// A query function evaluated against the machine state.
///
/// Dirty queries run it inside the driver against the current machine state;
/// consistent queries carry it through the log and run it when the entry
/// reaches consensus.
pub type QueryFn<E> =
    Arc<dyn Fn(&<E as Engine>::MachineState) -> <E as Engine>::Reply + Send + Sync + 'static>;

/// When the decision core should answer a command.
pub enum ReplyMode<E: Engine> {
    /// Reply as soon as the entry is appended to the local log.
    AfterLogAppend,
    /// Reply once the entry has reached consensus and been applied.
    AwaitConsensus,
    /// Do not reply; deliver an asynchronous consensus notification on the
    /// given channel instead.
    NotifyOnConsensus(NotifyTx<E>),
}

impl<E: Engine> Clone for ReplyMode<E> {
    fn clone(&self) -> Self {
        match self {
            ReplyMode::AfterLogAppend => ReplyMode::AfterLogAppend,
            ReplyMode::AwaitConsensus => ReplyMode::AwaitConsensus,
            ReplyMode::NotifyOnConsensus(tx) => ReplyMode::NotifyOnConsensus(tx.clone()),
        }
    }
}

impl<E: Engine> fmt::Debug for ReplyMode<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyMode::AfterLogAppend => write!(f, "AfterLogAppend"),
            ReplyMode::AwaitConsensus => write!(f, "AwaitConsensus"),
            ReplyMode::NotifyOnConsensus(_) => write!(f, "NotifyOnConsensus"),
        }
    }
}

/// The payload of a command: a user command or a consistent query.
pub enum CommandKind<E: Engine> {
    /// An application command to run through the log.
    User(E::Command),
    /// A query evaluated against the machine once the entry reaches
    /// consensus.
    Query(QueryFn<E>),
}

impl<E: Engine> fmt::Debug for CommandKind<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::User(_) => write!(f, "User"),
            CommandKind::Query(_) => write!(f, "Query"),
        }
    }
}

/// A command as the decision core receives it.
///
/// The driver injects the caller's reply handle before dispatch, so the core
/// can emit the matching `reply` or `notify` effect when it decides the
/// command's fate.
pub struct Command<E: Engine> {
    /// The caller's reply handle; present on leader calls.
    pub caller: Option<ReplyHandle<E>>,
    /// The command payload.
    pub kind: CommandKind<E>,
    /// When the command should be answered.
    pub mode: ReplyMode<E>,
}

/// A request that must be served by the current leader.
pub enum ClientRequest<E: Engine> {
    /// Append a command (or consistent query) to the replicated log.
    Command {
        /// The command payload.
        kind: CommandKind<E>,
        /// When the command should be answered.
        mode: ReplyMode<E>,
    },
    /// Inspect the node's own view of the group.
    StateQuery(StateQuerySpec),
}

impl<E: Engine> fmt::Debug for ClientRequest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRequest::Command { kind, mode } => {
                f.debug_struct("Command").field("kind", kind).field("mode", mode).finish()
            }
            ClientRequest::StateQuery(spec) => f.debug_tuple("StateQuery").field(spec).finish(),
        }
    }
}

/// What a state query should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateQuerySpec {
    /// The full node status.
    All,
    /// The current member set.
    Members,
}

/// The reply delivered through a [`ReplyHandle`].
pub enum Reply<E: Engine> {
    /// A command (or consistent query) result from the decision core.
    Applied(E::Reply),
    /// A vote RPC response.
    Vote(E::VoteReply),
    /// A full node status, answering `StateQuerySpec::All`.
    Status(Box<NodeStatus>),
    /// The member set, answering `StateQuerySpec::Members`.
    Members(BTreeSet<NodeId>),
    /// The request could not be served here; retry against `leader`. The
    /// original request rides along so the caller does not need to keep a
    /// copy.
    Redirect {
        /// The leader to retry against.
        leader: NodeId,
        /// The request being bounced back.
        req: ClientRequest<E>,
    },
}

impl<E: Engine> Reply<E> {
    /// A short variant name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Applied(_) => "applied",
            Reply::Vote(_) => "vote",
            Reply::Status(_) => "status",
            Reply::Members(_) => "members",
            Reply::Redirect { .. } => "redirect",
        }
    }
}

/// The result of a dirty query, served locally without consensus.
pub struct DirtyReply<E: Engine> {
    /// The index of the last entry applied to the machine the query ran
    /// against.
    pub last_applied: u64,
    /// The node's current term at evaluation time.
    pub term: u64,
    /// The query result.
    pub value: E::Reply,
    /// The leader this node currently believes in, if any.
    pub leader: Option<NodeId>,
}

/// An event as the decision core sees it.
pub enum Event<E: Engine> {
    /// A client command, dispatched while this node is leader.
    Command(Command<E>),
    /// A vote request from a campaigning peer. Dispatched as a call; the
    /// core answers with a bare `reply` effect.
    VoteRequest {
        /// The campaigning peer.
        from: NodeId,
        /// The vote request payload.
        req: E::VoteRequest,
    },
    /// A protocol message from a peer.
    Message {
        /// The sending peer.
        from: NodeId,
        /// The message payload.
        msg: E::Message,
    },
    /// The outcome of one of our own vote requests, cast back by the
    /// transient RPC task.
    VoteResult {
        /// The peer that was asked for its vote.
        from: NodeId,
        /// The peer's answer, or the RPC failure.
        result: Result<E::VoteReply, RpcError>,
    },
    /// The election timer fired.
    ElectionTimeout,
    /// The sync timer fired.
    Sync,
}

impl<E: Engine> Event<E> {
    /// A short variant name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Command(_) => "command",
            Event::VoteRequest { .. } => "vote_request",
            Event::Message { .. } => "message",
            Event::VoteResult { .. } => "vote_result",
            Event::ElectionTimeout => "election_timeout",
            Event::Sync => "sync",
        }
    }
}

/// A message coming into the driver task's mailbox.
pub(crate) enum DriverMsg<E: Engine> {
    /// A leader call from a client.
    Call {
        req: ClientRequest<E>,
        reply: ReplyHandle<E>,
    },
    /// A local query against the machine state, served without consensus.
    DirtyQuery {
        query: QueryFn<E>,
        reply: oneshot::Sender<DirtyReply<E>>,
    },
    /// A synchronous vote call from a campaigning peer.
    VoteCall {
        from: NodeId,
        req: E::VoteRequest,
        reply: ReplyHandle<E>,
    },
    /// A protocol message from a peer.
    Peer { from: NodeId, msg: E::Message },
    /// The outcome of one of our own vote requests.
    VoteResult {
        from: NodeId,
        result: Result<E::VoteReply, RpcError>,
    },
    /// Force an election timeout, as if the timer had fired.
    TriggerElection,
    /// The replication proxy task exited.
    ProxyExited { generation: u64 },
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::NullEngine;

    #[tokio::test]
    async fn test_reply_handle_is_single_use() {
        let (handle, rx) = ReplyHandle::<NullEngine>::new();
        let other = handle.clone();

        assert!(!handle.is_spent());
        assert!(handle.send(Reply::Members(Default::default())));
        assert!(handle.is_spent());
        assert!(other.is_spent());

        // Every later send is a no-op, from any clone.
        assert!(!other.send(Reply::Members(Default::default())));

        let got = rx.await.unwrap();
        assert!(matches!(got, Reply::Members(_)));
    }

    #[tokio::test]
    async fn test_reply_handle_detects_gone_caller() {
        let (handle, rx) = ReplyHandle::<NullEngine>::new();
        drop(rx);
        assert!(!handle.send(Reply::Members(Default::default())));
        assert!(handle.is_spent());
    }
}
