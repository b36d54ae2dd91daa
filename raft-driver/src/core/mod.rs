//! The role driver task.
//!
//! One task per node serializes every inbound event, hands it to the
//! decision core under the current role, executes the returned effects and
//! applies the role transition. Nothing in here blocks mid-event: sends are
//! fire-and-forget, vote RPCs run in transient tasks of their own, and the
//! replication proxy is a separate task supervised from this one.

mod effects;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::engine::{Engine, EngineConfig, Transition};
use crate::error::Fatal;
use crate::event::{Class, ClientRequest, Command, DirtyReply, DriverMsg, Event, QueryFn, Reply, ReplyHandle};
use crate::network::Transport;
use crate::proxy::{ProxyContext, ProxyHandle, ProxySpawner};
use crate::registry::Registry;
use crate::status::NodeStatus;
use crate::{NodeId, Role};

/// The class and reply binding of the event currently being dispatched.
pub(crate) struct EventCtx<E: Engine> {
    pub(crate) class: Class,
    pub(crate) reply: Option<ReplyHandle<E>>,
}

impl<E: Engine> EventCtx<E> {
    pub(crate) fn call(reply: ReplyHandle<E>) -> Self {
        Self {
            class: Class::Call,
            reply: Some(reply),
        }
    }

    pub(crate) fn cast() -> Self {
        Self {
            class: Class::Cast,
            reply: None,
        }
    }

    pub(crate) fn info() -> Self {
        Self {
            class: Class::Info,
            reply: None,
        }
    }
}

impl<E: Engine> Clone for EventCtx<E> {
    fn clone(&self) -> Self {
        Self {
            class: self.class,
            reply: self.reply.clone(),
        }
    }
}

/// An item on the driver's internal queue, drained ahead of the mailbox.
pub(crate) enum Queued<E: Engine> {
    /// A leader call re-entering the routing logic (pending-buffer replay).
    Call {
        req: ClientRequest<E>,
        reply: ReplyHandle<E>,
    },
    /// An event injected by a `next_event` effect.
    Event { ctx: EventCtx<E>, event: Event<E> },
}

/// Whether the dispatch loop should keep running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// The core type driving a single Raft node.
pub(crate) struct RaftCore<E: Engine, T: Transport<E>, P: ProxySpawner<E>> {
    /// This node's id.
    pub(crate) id: NodeId,
    /// This node's runtime config.
    pub(crate) config: Arc<Config>,
    /// The decision core, owner of the node state.
    pub(crate) engine: E,
    /// The current role. All dispatch goes through the handler this selects.
    pub(crate) role: Role,

    pub(crate) transport: Arc<T>,
    pub(crate) proxy_spawner: Arc<P>,
    pub(crate) registry: Arc<Registry<E>>,

    /// The live replication proxy, present only while leader (or transiently
    /// during teardown).
    pub(crate) proxy: Option<ProxyHandle<E>>,
    /// Bumped on every proxy spawn; exit notices carrying a stale generation
    /// are ignored.
    pub(crate) proxy_generation: u64,

    /// Leader calls accepted while no leader was known, in arrival order.
    pub(crate) pending_commands: VecDeque<(ReplyHandle<E>, ClientRequest<E>)>,
    /// Events injected by `next_event` effects and pending-buffer replays,
    /// drained before the mailbox.
    pub(crate) queued: VecDeque<Queued<E>>,

    /// When the election timer fires. `None` while leader.
    pub(crate) election_deadline: Option<Instant>,
    /// When the sync timer fires. Armed iff a `schedule_sync` effect asked
    /// for it and it has not fired yet.
    pub(crate) sync_deadline: Option<Instant>,
    /// The RNG the election timers draw from.
    pub(crate) timer_rng: StdRng,

    /// A sender onto our own mailbox, for vote tasks and proxy watchers.
    pub(crate) tx_inbox: mpsc::UnboundedSender<DriverMsg<E>>,
    pub(crate) rx_api: mpsc::UnboundedReceiver<DriverMsg<E>>,
    pub(crate) tx_status: watch::Sender<NodeStatus>,
    pub(crate) rx_shutdown: oneshot::Receiver<()>,
}

impl<E: Engine, T: Transport<E>, P: ProxySpawner<E>> RaftCore<E, T, P> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<Config>,
        engine_config: EngineConfig,
        transport: Arc<T>,
        proxy_spawner: Arc<P>,
        registry: Arc<Registry<E>>,
        tx_inbox: mpsc::UnboundedSender<DriverMsg<E>>,
        rx_api: mpsc::UnboundedReceiver<DriverMsg<E>>,
        tx_status: watch::Sender<NodeStatus>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> Self {
        let id = engine_config.id.clone();
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let node_bits = hasher.finish();
        let timer_rng = match config.timer_seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ node_bits),
            None => StdRng::from_entropy(),
        };
        let engine = E::init(engine_config);
        Self {
            id,
            config,
            engine,
            role: Role::Follower,
            transport,
            proxy_spawner,
            registry,
            proxy: None,
            proxy_generation: 0,
            pending_commands: VecDeque::new(),
            queued: VecDeque::new(),
            election_deadline: None,
            sync_deadline: None,
            timer_rng,
            tx_inbox,
            rx_api,
            tx_status,
            rx_shutdown,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        config: Arc<Config>,
        engine_config: EngineConfig,
        transport: Arc<T>,
        proxy_spawner: Arc<P>,
        registry: Arc<Registry<E>>,
        tx_inbox: mpsc::UnboundedSender<DriverMsg<E>>,
        rx_api: mpsc::UnboundedReceiver<DriverMsg<E>>,
        tx_status: watch::Sender<NodeStatus>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<Result<(), Fatal>> {
        let this = Self::new(
            config,
            engine_config,
            transport,
            proxy_spawner,
            registry,
            tx_inbox,
            rx_api,
            tx_status,
            rx_shutdown,
        );
        tokio::spawn(this.main())
    }

    /// The main loop of the driver task.
    #[tracing::instrument(level="trace", skip(self), fields(id=%self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> Result<(), Fatal> {
        tracing::info!("raft role driver starting");
        self.refresh_timers();
        self.publish_status();

        let res = self.run().await;

        self.stop_proxy("driver terminating");
        self.engine.terminate();
        self.registry.deregister(&self.id);
        match &res {
            Ok(()) => tracing::info!("raft role driver stopped"),
            Err(err) => tracing::error!(error=%err, "raft role driver terminating abnormally"),
        }
        res
    }

    async fn run(&mut self) -> Result<(), Fatal> {
        loop {
            // Injected events go ahead of anything still sitting in the
            // mailbox, in injection order.
            if let Some(item) = self.queued.pop_front() {
                let flow = match item {
                    Queued::Call { req, reply } => self.handle_leader_call(req, reply)?,
                    Queued::Event { ctx, event } => self.handle_event(ctx, event)?,
                };
                if flow == Flow::Stop {
                    return Ok(());
                }
                continue;
            }

            let far = Instant::now() + Duration::from_secs(3600);
            let election_at = self.election_deadline.unwrap_or(far);
            let sync_at = self.sync_deadline.unwrap_or(far);

            tokio::select! {
                _ = sleep_until(election_at), if self.election_deadline.is_some() => {
                    self.election_deadline = None;
                    if self.handle_event(EventCtx::info(), Event::ElectionTimeout)? == Flow::Stop {
                        return Ok(());
                    }
                }
                _ = sleep_until(sync_at), if self.sync_deadline.is_some() => {
                    self.sync_deadline = None;
                    if self.handle_event(EventCtx::info(), Event::Sync)? == Flow::Stop {
                        return Ok(());
                    }
                }
                msg = self.rx_api.recv() => match msg {
                    Some(msg) => {
                        if self.dispatch(msg)? == Flow::Stop {
                            return Ok(());
                        }
                    }
                    // Every handle is gone; nothing can ever reach us again.
                    None => return Ok(()),
                },
                _ = &mut self.rx_shutdown => {
                    tracing::info!("external shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// Route one mailbox message.
    fn dispatch(&mut self, msg: DriverMsg<E>) -> Result<Flow, Fatal> {
        match msg {
            DriverMsg::Call { req, reply } => self.handle_leader_call(req, reply),
            DriverMsg::DirtyQuery { query, reply } => {
                self.handle_dirty_query(query, reply);
                Ok(Flow::Continue)
            }
            DriverMsg::VoteCall { from, req, reply } => {
                self.handle_event(EventCtx::call(reply), Event::VoteRequest { from, req })
            }
            DriverMsg::Peer { from, msg } => {
                self.handle_event(EventCtx::info(), Event::Message { from, msg })
            }
            DriverMsg::VoteResult { from, result } => {
                self.handle_event(EventCtx::cast(), Event::VoteResult { from, result })
            }
            DriverMsg::TriggerElection => self.handle_event(EventCtx::cast(), Event::ElectionTimeout),
            DriverMsg::ProxyExited { generation } => {
                self.handle_proxy_exit(generation);
                Ok(Flow::Continue)
            }
        }
    }

    /// Route a leader call: serve it here, redirect it, or buffer it.
    #[tracing::instrument(level = "trace", skip(self, req, reply), fields(role=?self.role))]
    fn handle_leader_call(
        &mut self,
        req: ClientRequest<E>,
        reply: ReplyHandle<E>,
    ) -> Result<Flow, Fatal> {
        match self.role {
            Role::Leader => match req {
                ClientRequest::Command { kind, mode } => {
                    let command = Command {
                        caller: Some(reply.clone()),
                        kind,
                        mode,
                    };
                    self.handle_event(EventCtx::call(reply), Event::Command(command))
                }
                ClientRequest::StateQuery(spec) => {
                    self.answer_state_query(spec, &reply);
                    self.refresh_timers();
                    Ok(Flow::Continue)
                }
            },
            Role::Follower => {
                if let Some(leader) = self.engine.leader_id().cloned() {
                    reply.send(Reply::Redirect { leader, req });
                } else {
                    self.pending_commands.push_back((reply, req));
                }
                self.refresh_timers();
                Ok(Flow::Continue)
            }
            Role::Candidate => {
                self.pending_commands.push_back((reply, req));
                self.refresh_timers();
                Ok(Flow::Continue)
            }
        }
    }

    /// Serve a dirty query against the live machine state. The decision core
    /// is not involved and no log index moves.
    fn handle_dirty_query(&mut self, query: QueryFn<E>, reply: oneshot::Sender<DirtyReply<E>>) {
        let value = query(self.engine.machine_state());
        let _ = reply.send(DirtyReply {
            last_applied: self.engine.last_applied(),
            term: self.engine.current_term(),
            value,
            leader: self.engine.leader_id().cloned(),
        });
        self.refresh_timers();
    }

    /// Dispatch one event to the decision core and apply the outcome.
    #[tracing::instrument(level = "trace", skip(self, ctx, event), fields(role=?self.role, event=event.name()))]
    fn handle_event(&mut self, ctx: EventCtx<E>, event: Event<E>) -> Result<Flow, Fatal> {
        let prior_leader = self.engine.leader_id().cloned();

        let (transition, effects) = match self.role {
            Role::Follower => self.engine.handle_follower(event),
            Role::Candidate => self.engine.handle_candidate(event),
            Role::Leader => self.engine.handle_leader(event),
        };

        let deferred = self.apply_effects(&ctx, effects)?;
        let flow = self.apply_transition(transition, prior_leader);
        self.refresh_timers();
        for action in deferred {
            action.run();
        }
        self.publish_status();
        Ok(flow)
    }

    /// Apply the role transition the decision core asked for.
    fn apply_transition(&mut self, transition: Transition, prior_leader: Option<NodeId>) -> Flow {
        let to = match transition {
            Transition::Follower => Role::Follower,
            Transition::Candidate => Role::Candidate,
            Transition::Leader => Role::Leader,
            Transition::Stop => {
                tracing::info!(role=?self.role, "decision core requested stop");
                return Flow::Stop;
            }
        };
        let from = self.role;
        if from != to {
            tracing::debug!(?from, ?to, "role transition");
        }

        if from.is_leader() && !to.is_leader() {
            self.stop_proxy("lost leadership");
        }
        self.role = to;

        if to.is_leader() {
            if !from.is_leader() {
                self.replay_pending();
            }
        } else {
            self.maybe_flush_redirects(prior_leader);
        }
        Flow::Continue
    }

    /// Replay every buffered leader call, in arrival order, ahead of any
    /// other inbound event. The decision core will see them as fresh leader
    /// calls now that this node leads.
    fn replay_pending(&mut self) {
        if self.pending_commands.is_empty() {
            return;
        }
        tracing::debug!(n = self.pending_commands.len(), "replaying buffered commands as leader");
        for (reply, req) in self.pending_commands.drain(..) {
            self.queued.push_back(Queued::Call { req, reply });
        }
    }

    /// Flush the pending buffer with redirects once a leader becomes known
    /// (or a different leader replaces the known one).
    fn maybe_flush_redirects(&mut self, prior_leader: Option<NodeId>) {
        let leader = match self.engine.leader_id() {
            Some(leader) => leader.clone(),
            None => return,
        };
        if prior_leader.as_ref() == Some(&leader) || self.pending_commands.is_empty() {
            return;
        }
        tracing::debug!(leader=%leader, n = self.pending_commands.len(), "flushing buffered commands with redirect");
        for (reply, req) in self.pending_commands.drain(..) {
            reply.send(Reply::Redirect {
                leader: leader.clone(),
                req,
            });
        }
    }

    /// Answer a state query from the driver's own view; the decision core is
    /// not involved.
    fn answer_state_query(&self, spec: crate::event::StateQuerySpec, reply: &ReplyHandle<E>) {
        use crate::event::StateQuerySpec;
        match spec {
            StateQuerySpec::All => {
                reply.send(Reply::Status(Box::new(self.current_status())));
            }
            StateQuerySpec::Members => {
                reply.send(Reply::Members(self.engine.members()));
            }
        }
    }

    /// Re-arm the election timer for the current role.
    ///
    /// Followers and candidates get a fresh randomized deadline after every
    /// processed event; leaders run without one.
    fn refresh_timers(&mut self) {
        self.election_deadline = match self.role {
            Role::Follower => {
                Some(Instant::now() + self.config.new_follower_election_timeout(&mut self.timer_rng))
            }
            Role::Candidate => {
                Some(Instant::now() + self.config.new_candidate_election_timeout(&mut self.timer_rng))
            }
            Role::Leader => None,
        };
    }

    /// Handle an exit notice from a replication proxy task.
    ///
    /// A notice for anything but the live proxy is stale: it belongs to a
    /// proxy that was already stopped or replaced.
    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_proxy_exit(&mut self, generation: u64) {
        let live = matches!(&self.proxy, Some(p) if p.generation == generation);
        if !live {
            tracing::trace!(generation, "ignoring exit notice from a stale replication proxy");
            return;
        }
        self.proxy = None;
        if self.role.is_leader() {
            tracing::warn!(generation, "replication proxy exited unexpectedly, restarting");
            let batch = self.engine.make_rpcs();
            self.spawn_proxy();
            if let Some(proxy) = &self.proxy {
                proxy.forward(true, batch);
            }
        }
    }

    /// Spawn a fresh replication proxy and a watcher that reports its exit
    /// back to this task's mailbox.
    pub(crate) fn spawn_proxy(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.proxy_generation += 1;
        let generation = self.proxy_generation;
        let ctx = ProxyContext {
            parent: self.id.clone(),
            interval: self.config.sync_interval(),
        };
        let join = self.proxy_spawner.start(ctx, rx);
        let abort = join.abort_handle();

        let inbox = self.tx_inbox.clone();
        tokio::spawn(
            async move {
                let _ = join.await;
                let _ = inbox.send(DriverMsg::ProxyExited { generation });
            }
            .instrument(tracing::trace_span!("proxy_watcher", generation)),
        );

        tracing::debug!(generation, "replication proxy started");
        self.proxy = Some(ProxyHandle::new(tx, abort, generation));
    }

    /// Stop the live proxy, if any, with the configured grace period.
    fn stop_proxy(&mut self, reason: &'static str) {
        if let Some(proxy) = self.proxy.take() {
            proxy.stop(reason, self.config.proxy_stop_grace());
        }
    }

    fn current_status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.role,
            current_term: self.engine.current_term(),
            leader: self.engine.leader_id().cloned(),
            last_applied: self.engine.last_applied(),
            members: self.engine.members(),
        }
    }

    /// Publish the node status if it changed.
    fn publish_status(&mut self) {
        let status = self.current_status();
        if *self.tx_status.borrow() != status {
            let _ = self.tx_status.send(status);
        }
    }
}
