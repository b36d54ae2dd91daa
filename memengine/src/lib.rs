//! An in-memory decision core for demo and testing purposes related to
//! `raft-driver`.
//!
//! `MemEngine` implements just enough of the consensus protocol to drive a
//! small cluster end-to-end: leader election with majority vote counting,
//! log append with majority-ack commit, apply-on-commit against a key/value
//! machine, and heartbeats kept flowing through the driver's sync timer. It
//! is deliberately simple (no pre-vote, no joint membership, no snapshot
//! install) and is not a production Raft.

mod proxy;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use raft_driver::effect::Effect;
use raft_driver::engine::{Engine, EngineConfig, Transition};
use raft_driver::event::{Command, CommandKind, Event, NotifyTx, QueryFn, Reply, ReplyHandle, ReplyMode};
use raft_driver::{AppData, AppDataResponse, NodeId};
use serde::Deserialize;
use serde::Serialize;

pub use crate::proxy::MemProxySpawner;

/// Take a snapshot every this many applied entries.
pub const SNAPSHOT_INTERVAL: u64 = 32;

/// The command payload which `MemEngine` works with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MemCommand {
    /// The key to write.
    pub key: String,
    /// The value to store under the key.
    pub value: u64,
}

impl AppData for MemCommand {}

/// The reply payload which `MemEngine` works with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum MemReply {
    /// The position a command landed at in the log.
    Appended {
        /// The log index of the entry.
        index: u64,
        /// The term the entry was appended in.
        term: u64,
    },
    /// A value read by a query.
    Value(Option<u64>),
    /// A full copy of the machine, read by a query.
    State(BTreeMap<String, u64>),
}

impl AppDataResponse for MemReply {}

/// A single entry in the replicated log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The index of this entry.
    pub index: u64,
    /// The term this entry was created in.
    pub term: u64,
    /// The payload.
    pub payload: Payload,
}

/// Log entry payload variants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A key/value write.
    Put {
        /// The key to write.
        key: String,
        /// The value to store.
        value: u64,
    },
    /// An empty entry; used to anchor consistent queries and fresh
    /// leaderships in the log.
    Noop,
}

/// A protocol message between cluster members.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum MemMessage {
    /// Entries (possibly none, as a heartbeat) from the leader.
    Append {
        /// The leader's term.
        term: u64,
        /// The leader's id.
        leader: NodeId,
        /// The new entries to store.
        entries: Vec<Entry>,
        /// The leader's commit index.
        commit: u64,
    },
    /// A follower's acknowledgement of its log position.
    AppendOk {
        /// The follower's term.
        term: u64,
        /// The acknowledging follower.
        from: NodeId,
        /// The highest index present on the follower.
        matched: u64,
    },
}

/// A vote solicitation from a campaigning candidate.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VoteRequest {
    /// The candidate's term.
    pub term: u64,
    /// The campaigning candidate.
    pub candidate: NodeId,
    /// The index of the candidate's last log entry.
    pub last_index: u64,
    /// The term of the candidate's last log entry.
    pub last_term: u64,
}

/// The answer to a [`VoteRequest`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VoteReply {
    /// The responder's term.
    pub term: u64,
    /// Whether the responder granted its vote.
    pub granted: bool,
}

/// The batch handed to the replication proxy: one message per peer.
pub type MemBatch = Vec<(NodeId, MemMessage)>;

/// A snapshot of the machine at some log index.
#[derive(Debug, Clone)]
pub struct MemSnapshot {
    /// The last index covered by this snapshot.
    pub index: u64,
    /// The machine serialized at that index.
    pub data: Vec<u8>,
}

/// Something waiting for an entry to reach consensus.
enum PendingAnswer {
    /// Answer the caller with the entry's log position.
    Reply(ReplyHandle<MemEngine>),
    /// Deliver an asynchronous notification with the entry's log position.
    Notify(NotifyTx<MemEngine>),
    /// Run the query against the machine and answer the caller.
    Query {
        caller: ReplyHandle<MemEngine>,
        query: QueryFn<MemEngine>,
    },
}

/// An in-memory decision core driving a key/value machine.
pub struct MemEngine {
    id: NodeId,
    cluster: BTreeSet<NodeId>,

    term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,

    log: Vec<Entry>,
    commit: u64,
    applied: u64,
    machine: BTreeMap<String, u64>,

    /// Votes granted to us in the current campaign.
    votes_granted: BTreeSet<NodeId>,
    /// Leader bookkeeping: highest index known present on each member.
    match_index: BTreeMap<NodeId, u64>,
    /// Callers and notifications waiting on an index to commit.
    pending: BTreeMap<u64, Vec<PendingAnswer>>,

    snapshot: Option<MemSnapshot>,
    snapshot_point: Option<u64>,
}

impl MemEngine {
    fn last_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or_else(|| {
            self.snapshot.as_ref().map(|s| s.index).unwrap_or(0)
        })
    }

    fn last_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.cluster.iter().filter(move |m| **m != self.id)
    }

    fn majority(&self) -> usize {
        self.cluster.len() / 2 + 1
    }

    /// Begin a new campaign: bump the term, vote for ourselves and solicit
    /// the rest of the group.
    fn start_election(&mut self) -> (Transition, Vec<Effect<Self>>) {
        self.term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        self.votes_granted = [self.id.clone()].into_iter().collect();
        tracing::debug!(term = self.term, "starting election");

        if self.votes_granted.len() >= self.majority() {
            return self.become_leader();
        }

        let req = VoteRequest {
            term: self.term,
            candidate: self.id.clone(),
            last_index: self.last_index(),
            last_term: self.last_term(),
        };
        let requests = self.peers().map(|peer| (peer.clone(), req.clone())).collect();
        (Transition::Candidate, vec![Effect::SendVoteRequests(requests)])
    }

    /// Assume leadership: anchor the new term with an empty entry and start
    /// replicating.
    fn become_leader(&mut self) -> (Transition, Vec<Effect<Self>>) {
        tracing::info!(term = self.term, "won election, becoming leader");
        self.leader = Some(self.id.clone());
        self.match_index = self.peers().map(|p| (p.clone(), 0)).collect();
        let index = self.last_index() + 1;
        self.log.push(Entry {
            index,
            term: self.term,
            payload: Payload::Noop,
        });

        let mut effects = Vec::new();
        self.maybe_commit(&mut effects);
        effects.push(Effect::SendRpcs {
            urgent: true,
            batch: self.make_batch(),
        });
        effects.push(Effect::ScheduleSync);
        (Transition::Leader, effects)
    }

    /// Shared vote-granting logic. Returns the reply effect and whether a
    /// higher term forced us back to follower.
    fn answer_vote_request(&mut self, req: &VoteRequest) -> (Effect<Self>, bool) {
        let mut stepped_down = false;
        if req.term > self.term {
            self.term = req.term;
            self.voted_for = None;
            self.leader = None;
            stepped_down = true;
        }

        let up_to_date = (req.last_term, req.last_index) >= (self.last_term(), self.last_index());
        let granted = req.term == self.term
            && up_to_date
            && self
                .voted_for
                .as_ref()
                .map(|v| v == &req.candidate)
                .unwrap_or(true);
        if granted {
            self.voted_for = Some(req.candidate.clone());
        }
        tracing::debug!(candidate = %req.candidate, term = req.term, granted, "answering vote request");

        let reply = Effect::Reply {
            to: None,
            reply: Reply::Vote(VoteReply {
                term: self.term,
                granted,
            }),
        };
        (reply, stepped_down)
    }

    /// Ingest entries from the leader, advance commit and acknowledge.
    fn handle_append(
        &mut self,
        term: u64,
        leader: NodeId,
        entries: Vec<Entry>,
        commit: u64,
        effects: &mut Vec<Effect<Self>>,
    ) {
        if term > self.term {
            self.voted_for = None;
        }
        self.term = term;
        self.leader = Some(leader.clone());

        for entry in entries {
            match self.log.iter().position(|e| e.index == entry.index) {
                Some(pos) if self.log[pos].term == entry.term => {}
                Some(pos) => {
                    self.log.truncate(pos);
                    self.log.push(entry);
                }
                None => {
                    self.log.push(entry);
                }
            }
        }

        let matched = self.last_index();
        if commit > self.commit {
            self.commit = commit.min(matched);
            self.apply_committed(effects);
        }

        effects.push(Effect::SendMsg {
            to: leader,
            msg: MemMessage::AppendOk {
                term: self.term,
                from: self.id.clone(),
                matched,
            },
        });
    }

    /// Advance the commit index to the highest entry a majority holds.
    fn maybe_commit(&mut self, effects: &mut Vec<Effect<Self>>) {
        let last = self.last_index();
        let mut commit = self.commit;
        for index in (self.commit + 1)..=last {
            let acks = 1 + self.match_index.values().filter(|m| **m >= index).count();
            if acks >= self.majority() {
                commit = index;
            }
        }
        if commit > self.commit {
            self.commit = commit;
            self.apply_committed(effects);
        }
    }

    /// Apply every committed-but-unapplied entry to the machine and answer
    /// whatever was waiting on it.
    fn apply_committed(&mut self, effects: &mut Vec<Effect<Self>>) {
        while self.applied < self.commit {
            let next = self.applied + 1;
            let entry = match self.log.iter().find(|e| e.index == next) {
                Some(entry) => entry.clone(),
                None => break,
            };
            if let Payload::Put { key, value } = &entry.payload {
                self.machine.insert(key.clone(), *value);
            }
            self.applied = next;

            for answer in self.pending.remove(&next).unwrap_or_default() {
                let position = MemReply::Appended {
                    index: entry.index,
                    term: entry.term,
                };
                match answer {
                    PendingAnswer::Reply(caller) => effects.push(Effect::Reply {
                        to: Some(caller),
                        reply: Reply::Applied(position),
                    }),
                    PendingAnswer::Notify(tx) => effects.push(Effect::Notify {
                        to: tx,
                        reply: position,
                    }),
                    PendingAnswer::Query { caller, query } => {
                        let value = query(&self.machine);
                        effects.push(Effect::Reply {
                            to: Some(caller),
                            reply: Reply::Applied(value),
                        });
                    }
                }
            }

            if self.applied % SNAPSHOT_INTERVAL == 0 {
                effects.push(Effect::SnapshotPoint { index: self.applied });
                effects.push(Effect::ReleaseCursor { index: self.applied });
            }
        }
    }

    /// Append a client command as leader.
    fn append_command(&mut self, command: Command<Self>, effects: &mut Vec<Effect<Self>>) {
        let index = self.last_index() + 1;
        let position = MemReply::Appended {
            index,
            term: self.term,
        };

        let is_query = matches!(command.kind, CommandKind::Query(_));
        let payload = match command.kind {
            CommandKind::User(MemCommand { key, value }) => Payload::Put { key, value },
            CommandKind::Query(query) => {
                if let Some(caller) = command.caller.clone() {
                    self.pending
                        .entry(index)
                        .or_default()
                        .push(PendingAnswer::Query { caller, query });
                }
                Payload::Noop
            }
        };
        self.log.push(Entry {
            index,
            term: self.term,
            payload,
        });

        match command.mode {
            ReplyMode::AfterLogAppend => {
                effects.push(Effect::Reply {
                    to: command.caller,
                    reply: Reply::Applied(position),
                });
            }
            ReplyMode::AwaitConsensus => {
                // Queries answer through their pending entry already.
                if !is_query {
                    if let Some(caller) = command.caller {
                        self.pending.entry(index).or_default().push(PendingAnswer::Reply(caller));
                    }
                }
            }
            ReplyMode::NotifyOnConsensus(tx) => {
                self.pending.entry(index).or_default().push(PendingAnswer::Notify(tx));
                effects.push(Effect::Reply {
                    to: command.caller,
                    reply: Reply::Applied(position),
                });
            }
        }

        self.maybe_commit(effects);
        effects.push(Effect::SendRpcs {
            urgent: true,
            batch: self.make_batch(),
        });
        effects.push(Effect::ScheduleSync);
    }

    /// Build the per-peer append batch from each peer's acknowledged
    /// position.
    fn make_batch(&self) -> MemBatch {
        self.peers()
            .map(|peer| {
                let from = self.match_index.get(peer).copied().unwrap_or(0);
                let entries: Vec<Entry> =
                    self.log.iter().filter(|e| e.index > from).cloned().collect();
                (
                    peer.clone(),
                    MemMessage::Append {
                        term: self.term,
                        leader: self.id.clone(),
                        entries,
                        commit: self.commit,
                    },
                )
            })
            .collect()
    }
}

impl Engine for MemEngine {
    type Command = MemCommand;
    type Reply = MemReply;
    type MachineState = BTreeMap<String, u64>;
    type Message = MemMessage;
    type Batch = MemBatch;
    type VoteRequest = VoteRequest;
    type VoteReply = VoteReply;

    fn init(config: EngineConfig) -> Self {
        Self {
            id: config.id,
            cluster: config.cluster,
            term: 0,
            voted_for: None,
            leader: None,
            log: Vec::new(),
            commit: 0,
            applied: 0,
            machine: BTreeMap::new(),
            votes_granted: BTreeSet::new(),
            match_index: BTreeMap::new(),
            pending: BTreeMap::new(),
            snapshot: None,
            snapshot_point: None,
        }
    }

    fn handle_follower(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
        match event {
            Event::ElectionTimeout => self.start_election(),
            Event::VoteRequest { req, .. } => {
                let (reply, _) = self.answer_vote_request(&req);
                (Transition::Follower, vec![reply])
            }
            Event::Message { msg, .. } => match msg {
                MemMessage::Append {
                    term,
                    leader,
                    entries,
                    commit,
                } if term >= self.term => {
                    let mut effects = Vec::new();
                    self.handle_append(term, leader, entries, commit, &mut effects);
                    (Transition::Follower, effects)
                }
                _ => (Transition::Follower, Vec::new()),
            },
            // Stale campaign artifacts and sync ticks are meaningless here.
            Event::VoteResult { .. } | Event::Sync | Event::Command(_) => {
                (Transition::Follower, Vec::new())
            }
        }
    }

    fn handle_candidate(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
        match event {
            Event::ElectionTimeout => self.start_election(),
            Event::VoteRequest { req, .. } => {
                let (reply, stepped_down) = self.answer_vote_request(&req);
                let transition = if stepped_down {
                    Transition::Follower
                } else {
                    Transition::Candidate
                };
                (transition, vec![reply])
            }
            Event::VoteResult { from, result } => match result {
                Ok(reply) if reply.term > self.term => {
                    self.term = reply.term;
                    self.voted_for = None;
                    (Transition::Follower, Vec::new())
                }
                Ok(reply) if reply.granted && reply.term == self.term => {
                    self.votes_granted.insert(from);
                    if self.votes_granted.len() >= self.majority() {
                        self.become_leader()
                    } else {
                        (Transition::Candidate, Vec::new())
                    }
                }
                Ok(_) => (Transition::Candidate, Vec::new()),
                Err(err) => {
                    tracing::debug!(peer = %from, error = %err, "vote request failed");
                    (Transition::Candidate, Vec::new())
                }
            },
            Event::Message { msg, .. } => match msg {
                MemMessage::Append {
                    term,
                    leader,
                    entries,
                    commit,
                } if term >= self.term => {
                    let mut effects = Vec::new();
                    self.handle_append(term, leader, entries, commit, &mut effects);
                    (Transition::Follower, effects)
                }
                _ => (Transition::Candidate, Vec::new()),
            },
            Event::Sync | Event::Command(_) => (Transition::Candidate, Vec::new()),
        }
    }

    fn handle_leader(&mut self, event: Event<Self>) -> (Transition, Vec<Effect<Self>>) {
        match event {
            Event::Command(command) => {
                let mut effects = Vec::new();
                self.append_command(command, &mut effects);
                (Transition::Leader, effects)
            }
            Event::Sync => {
                let effects = vec![
                    Effect::SendRpcs {
                        urgent: false,
                        batch: self.make_batch(),
                    },
                    Effect::ScheduleSync,
                ];
                (Transition::Leader, effects)
            }
            Event::Message { msg, .. } => match msg {
                MemMessage::AppendOk { term, from, matched } => {
                    if term > self.term {
                        self.term = term;
                        self.voted_for = None;
                        self.leader = None;
                        return (Transition::Follower, Vec::new());
                    }
                    let entry = self.match_index.entry(from).or_insert(0);
                    *entry = (*entry).max(matched);
                    let mut effects = Vec::new();
                    self.maybe_commit(&mut effects);
                    (Transition::Leader, effects)
                }
                MemMessage::Append {
                    term,
                    leader,
                    entries,
                    commit,
                } if term > self.term => {
                    let mut effects = Vec::new();
                    self.handle_append(term, leader, entries, commit, &mut effects);
                    (Transition::Follower, effects)
                }
                MemMessage::Append { .. } => (Transition::Leader, Vec::new()),
            },
            Event::VoteRequest { req, .. } => {
                let (reply, stepped_down) = self.answer_vote_request(&req);
                let transition = if stepped_down {
                    Transition::Follower
                } else {
                    Transition::Leader
                };
                (transition, vec![reply])
            }
            // A leader ignores its own stale campaign and forced elections.
            Event::VoteResult { .. } | Event::ElectionTimeout => (Transition::Leader, Vec::new()),
        }
    }

    fn make_rpcs(&mut self) -> Self::Batch {
        self.make_batch()
    }

    fn maybe_snapshot(&mut self, index: u64) {
        if index > self.applied {
            return;
        }
        if let Some(snapshot) = &self.snapshot {
            if snapshot.index >= index {
                return;
            }
        }
        match serde_json::to_vec(&self.machine) {
            Ok(data) => {
                self.log.retain(|e| e.index > index);
                self.snapshot = Some(MemSnapshot { index, data });
                tracing::debug!(index, "took snapshot");
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize machine for snapshot");
            }
        }
    }

    fn record_snapshot_point(&mut self, index: u64) {
        self.snapshot_point = Some(index);
    }

    fn terminate(&mut self) {
        self.pending.clear();
    }

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

impl MemEngine {
    /// The current snapshot, if one was taken.
    pub fn snapshot(&self) -> Option<&MemSnapshot> {
        self.snapshot.as_ref()
    }

    /// The most recently recorded snapshot point.
    pub fn snapshot_point(&self) -> Option<u64> {
        self.snapshot_point
    }

    /// The number of live log entries.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }
}
