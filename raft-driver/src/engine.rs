//! The decision core interface.
//!
//! The driver never implements Raft's decision logic itself; it drives an
//! [`Engine`], a referentially transparent state machine that turns
//! `(role, event)` into `(transition, effects)`. The engine owns the node
//! state (term, log, cluster view, application machine) and never performs
//! I/O: everything observable it wants done comes back as an
//! [`Effect`](crate::effect::Effect) for the driver to execute.

use std::collections::BTreeSet;
use std::fmt;

use crate::effect::Effect;
use crate::event::Event;
use crate::{AppData, AppDataResponse, NodeId};

/// The initial configuration handed to [`Engine::init`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// This node's id.
    pub id: NodeId,
    /// The ids of every member of the group, this node included.
    pub cluster: BTreeSet<NodeId>,
}

/// The role the decision core wants the driver to assume next.
///
/// Returning the current role means "stay". A leader handler may only return
/// `Leader`, `Follower` or `Stop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Continue (or become) follower.
    Follower,
    /// Continue (or become) candidate.
    Candidate,
    /// Continue (or become) leader.
    Leader,
    /// Shut the node down in an orderly fashion after the accompanying
    /// effects have been applied.
    Stop,
}

/// The pure Raft decision core.
///
/// Handlers are invoked synchronously, at most once per inbound event, and
/// must not block: the driver executes the returned effects, applies the
/// transition and only then picks up the next event.
pub trait Engine: Send + Sized + 'static {
    /// Application command payload carried through the log.
    type Command: AppData;
    /// Reply payload for answered commands and consensus notifications.
    type Reply: AppDataResponse;
    /// The application state machine value that local queries run against.
    type MachineState: Send + Sync + 'static;
    /// Peer-bound protocol message payload.
    type Message: Send + fmt::Debug + 'static;
    /// An append-entries batch handed to the replication proxy.
    type Batch: Send + fmt::Debug + 'static;
    /// Vote RPC request payload.
    type VoteRequest: Send + fmt::Debug + 'static;
    /// Vote RPC reply payload.
    type VoteReply: Send + fmt::Debug + 'static;

    /// Build the initial node state.
    fn init(config: EngineConfig) -> Self;

    /// Handle an event while in the follower role.
    fn handle_follower(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>);

    /// Handle an event while in the candidate role.
    fn handle_candidate(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>);

    /// Handle an event while in the leader role.
    fn handle_leader(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>);

    /// Build the current append-entries batch for every peer.
    ///
    /// Used by the driver to re-seed a freshly restarted replication proxy.
    fn make_rpcs(&mut self) -> Self::Batch;

    /// Take a snapshot covering the log up to `index`, if worthwhile.
    fn maybe_snapshot(&mut self, index: u64);

    /// Record `index` as a candidate snapshot point.
    fn record_snapshot_point(&mut self, index: u64);

    /// Release any resources before the driver task exits.
    fn terminate(&mut self);

    /// The node's current term.
    fn current_term(&self) -> u64;

    /// The leader this node currently believes in, if any.
    fn leader_id(&self) -> Option<&NodeId>;

    /// The index of the last entry applied to the machine.
    fn last_applied(&self) -> u64;

    /// The application machine state, for locally evaluated queries.
    fn machine_state(&self) -> &Self::MachineState;

    /// The ids of every member of the group.
    fn members(&self) -> BTreeSet<NodeId>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// An engine that ignores every event. Used by unit tests that only
    /// exercise driver plumbing.
    pub(crate) struct NullEngine {
        config: EngineConfig,
    }

    impl Engine for NullEngine {
        type Command = String;
        type Reply = String;
        type MachineState = ();
        type Message = ();
        type Batch = ();
        type VoteRequest = ();
        type VoteReply = ();

        fn init(config: EngineConfig) -> Self {
            Self { config }
        }

        fn handle_follower(&mut self, _event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
            (Transition::Follower, Vec::new())
        }

        fn handle_candidate(&mut self, _event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
            (Transition::Candidate, Vec::new())
        }

        fn handle_leader(&mut self, _event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
            (Transition::Leader, Vec::new())
        }

        fn make_rpcs(&mut self) -> Self::Batch {}

        fn maybe_snapshot(&mut self, _index: u64) {}

        fn record_snapshot_point(&mut self, _index: u64) {}

        fn terminate(&mut self) {}

        fn current_term(&self) -> u64 {
            0
        }

        fn leader_id(&self) -> Option<&NodeId> {
            None
        }

        fn last_applied(&self) -> u64 {
            0
        }

        fn machine_state(&self) -> &Self::MachineState {
            &()
        }

        fn members(&self) -> BTreeSet<NodeId> {
            self.config.cluster.clone()
        }
    }
}
