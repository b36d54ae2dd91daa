//! Side effects requested by the decision core.
//!
//! The core stays pure by describing what it wants done as a sequence of
//! `Effect` values; the driver executes them in emission order before the
//! next event is dispatched. The enum is closed on purpose: adding a variant
//! forces every interpreter match to be revisited at compile time.

use crate::engine::Engine;
use crate::event::{Event, NotifyTx, Reply, ReplyHandle};
use crate::NodeId;

/// A side effect emitted by the decision core, executed by the driver.
pub enum Effect<E: Engine> {
    /// Inject an event into the driver's own queue, processed after the
    /// current handler returns and ahead of other pending inbound events.
    /// The injected event inherits the class (and, for calls, the reply
    /// handle) of the event that produced it.
    NextEvent(Event<E>),

    /// Fire-and-forget a protocol message to a peer.
    SendMsg {
        /// The receiving peer.
        to: NodeId,
        /// The message payload.
        msg: E::Message,
    },

    /// Deliver an asynchronous consensus notification to a client.
    Notify {
        /// The client's notification channel.
        to: NotifyTx<E>,
        /// The client-supplied correlation value.
        reply: E::Reply,
    },

    /// Answer a call.
    ///
    /// With an explicit handle the reply is queued and issued once all
    /// effects of the current event have been applied. Without one the
    /// current event must be a call; anything else is a decision-core bug
    /// and terminates the driver.
    Reply {
        /// The caller to answer; `None` means the current call's caller.
        to: Option<ReplyHandle<E>>,
        /// The reply payload.
        reply: Reply<E>,
    },

    /// Ask every listed peer for its vote. Each request runs in a transient
    /// task performing a synchronous call with a short timeout; the outcome
    /// is cast back as a `VoteResult` event, timeouts included.
    SendVoteRequests(Vec<(NodeId, E::VoteRequest)>),

    /// Hand an append-entries batch to the replication proxy, spawning it if
    /// absent. Urgent batches bypass the proxy's coalescing.
    SendRpcs {
        /// Whether the batch must go out immediately.
        urgent: bool,
        /// The batch to replicate.
        batch: E::Batch,
    },

    /// Ask the decision core to take a snapshot up to `index`.
    ReleaseCursor {
        /// The highest index the snapshot may cover.
        index: u64,
    },

    /// Ask the decision core to record `index` as a candidate snapshot
    /// point.
    SnapshotPoint {
        /// The candidate index.
        index: u64,
    },

    /// Arm the one-shot sync timer, unless it is already armed.
    ScheduleSync,
}

impl<E: Engine> Effect<E> {
    /// A short variant name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Effect::NextEvent(_) => "next_event",
            Effect::SendMsg { .. } => "send_msg",
            Effect::Notify { .. } => "notify",
            Effect::Reply { .. } => "reply",
            Effect::SendVoteRequests(_) => "send_vote_requests",
            Effect::SendRpcs { .. } => "send_rpcs",
            Effect::ReleaseCursor { .. } => "release_cursor",
            Effect::SnapshotPoint { .. } => "snapshot_point",
            Effect::ScheduleSync => "schedule_sync",
        }
    }
}
