//! Scripted collaborators for driver unit tests.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::effect::Effect;
use crate::engine::{Engine, EngineConfig, Transition};
use crate::event::{CommandKind, DriverMsg, Event};
use crate::network::Transport;
use crate::proxy::{ProxyContext, ProxyMsg, ProxySpawner};
use crate::registry::Registry;
use crate::status::NodeStatus;
use crate::{AppData, AppDataResponse, NodeId};

impl AppData for String {}
impl AppDataResponse for String {}

/// One scripted response from the engine.
pub(crate) struct Step {
    pub(crate) set_leader: Option<NodeId>,
    pub(crate) transition: Transition,
    pub(crate) effects: Vec<Effect<ScriptEngine>>,
}

impl Step {
    pub(crate) fn stay(role: Transition) -> Self {
        Self {
            set_leader: None,
            transition: role,
            effects: Vec::new(),
        }
    }
}

/// An engine whose responses are scripted by the test; it records every
/// event it is handed.
pub(crate) struct ScriptEngine {
    pub(crate) leader: Option<NodeId>,
    pub(crate) term: u64,
    pub(crate) applied: u64,
    pub(crate) machine: String,
    pub(crate) cluster: BTreeSet<NodeId>,
    pub(crate) script: VecDeque<Step>,
    pub(crate) events: Vec<String>,
    pub(crate) snapshots: Vec<u64>,
    pub(crate) snapshot_points: Vec<u64>,
    pub(crate) batches_built: u64,
}

fn event_label(event: &Event<ScriptEngine>) -> String {
    match event {
        Event::Command(cmd) => match &cmd.kind {
            CommandKind::User(data) => format!("command:{}", data),
            CommandKind::Query(_) => "query".to_string(),
        },
        other => other.name().to_string(),
    }
}

impl ScriptEngine {
    fn answer(&mut self, event: Event<Self>, default: Transition) -> (Transition, Vec<Effect<Self>>) {
        self.events.push(event_label(&event));
        match self.script.pop_front() {
            Some(step) => {
                if let Some(leader) = step.set_leader {
                    self.leader = Some(leader);
                }
                (step.transition, step.effects)
            }
            None => (default, Vec::new()),
        }
    }
}

impl Engine for ScriptEngine {
    type Command = String;
    type Reply = String;
    type MachineState = String;
    type Message = String;
    type Batch = String;
    type VoteRequest = String;
    type VoteReply = String;

    fn init(config: EngineConfig) -> Self {
        Self {
            leader: None,
            term: 1,
            applied: 0,
            machine: "machine".to_string(),
            cluster: config.cluster,
            script: VecDeque::new(),
            events: Vec::new(),
            snapshots: Vec::new(),
            snapshot_points: Vec::new(),
            batches_built: 0,
        }
    }

    fn handle_follower(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
        self.answer(event, Transition::Follower)
    }

    fn handle_candidate(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
        self.answer(event, Transition::Candidate)
    }

    fn handle_leader(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
        self.answer(event, Transition::Leader)
    }

    fn make_rpcs(&mut self) -> Self::Batch {
        self.batches_built += 1;
        format!("batch-{}", self.batches_built)
    }

    fn maybe_snapshot(&mut self, index: u64) {
        self.snapshots.push(index);
    }

    fn record_snapshot_point(&mut self, index: u64) {
        self.snapshot_points.push(index);
    }

    fn terminate(&mut self) {}

    fn current_term(&self) -> u64 {
        self.term
    }

    fn leader_id(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    fn last_applied(&self) -> u64 {
        self.applied
    }

    fn machine_state(&self) -> &Self::MachineState {
        &self.machine
    }

    fn members(&self) -> BTreeSet<NodeId> {
        self.cluster.clone()
    }
}

/// A transport that records everything it is asked to send.
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(NodeId, String)>>,
    vote_calls: Mutex<Vec<NodeId>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            vote_calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sent(&self) -> Vec<(NodeId, String)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn vote_calls(&self) -> Vec<NodeId> {
        self.vote_calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Transport<ScriptEngine> for RecordingTransport {
    async fn vote(&self, target: &NodeId, _req: String) -> Result<String> {
        self.vote_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target.clone());
        Ok("granted".to_string())
    }

    fn send(&self, target: &NodeId, msg: String) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target.clone(), msg));
    }
}

/// A proxy that consumes its input and exits on `Stop`.
pub(crate) struct NullProxySpawner;

impl ProxySpawner<ScriptEngine> for NullProxySpawner {
    fn start(
        &self,
        _ctx: ProxyContext,
        mut rx: mpsc::UnboundedReceiver<ProxyMsg<ScriptEngine>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if matches!(msg, ProxyMsg::Stop) {
                    break;
                }
            }
        })
    }
}

/// A constructed driver core plus the handles a test needs to poke it.
pub(crate) struct TestCore {
    pub(crate) core: RaftCore<ScriptEngine, RecordingTransport, NullProxySpawner>,
    pub(crate) transport: Arc<RecordingTransport>,
    pub(crate) rx_status: watch::Receiver<NodeStatus>,
    pub(crate) tx_api: mpsc::UnboundedSender<DriverMsg<ScriptEngine>>,
    pub(crate) _shutdown: oneshot::Sender<()>,
}

/// Build a core without spawning its task, so tests can drive the dispatch
/// functions directly.
pub(crate) fn new_test_core(id: &str, members: &[&str]) -> TestCore {
    let config = Arc::new(
        Config::build("unit".to_string())
            .timer_seed(1)
            .validate()
            .expect("test config must be valid"),
    );
    let cluster: BTreeSet<NodeId> = members.iter().map(|m| NodeId::from(*m)).collect();
    let engine_config = EngineConfig {
        id: NodeId::from(id),
        cluster: cluster.clone(),
    };
    let transport = Arc::new(RecordingTransport::new());
    let registry = Arc::new(Registry::new());
    let (tx_api, rx_api) = mpsc::unbounded_channel();
    let (tx_status, rx_status) = watch::channel(NodeStatus::initial(NodeId::from(id), cluster));
    let (tx_shutdown, rx_shutdown) = oneshot::channel();

    let core = RaftCore::new(
        config,
        engine_config,
        transport.clone(),
        Arc::new(NullProxySpawner),
        registry,
        tx_api.clone(),
        rx_api,
        tx_status,
        rx_shutdown,
    );

    TestCore {
        core,
        transport,
        rx_status,
        tx_api,
        _shutdown: tx_shutdown,
    }
}
