//! The effect interpreter.
//!
//! Effects from one event are executed strictly in emission order; anything
//! that answers a caller is deferred and issued only after the whole
//! sequence (and the role transition) has been applied.

use tokio::time::timeout;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::{EventCtx, Queued, RaftCore};
use crate::effect::Effect;
use crate::engine::Engine;
use crate::error::{Fatal, RpcError};
use crate::event::{Class, DriverMsg, Reply, ReplyHandle};
use crate::network::Transport;
use crate::proxy::ProxySpawner;
use crate::NodeId;

/// An action held back until all effects of the current event are applied.
pub(crate) enum Deferred<E: Engine> {
    Reply { to: ReplyHandle<E>, reply: Reply<E> },
}

impl<E: Engine> Deferred<E> {
    pub(crate) fn run(self) {
        match self {
            Deferred::Reply { to, reply } => {
                if !to.send(reply) {
                    tracing::trace!("caller went away before the reply was issued");
                }
            }
        }
    }
}

impl<E: Engine, T: Transport<E>, P: ProxySpawner<E>> RaftCore<E, T, P> {
    /// Execute a sequence of effects in order, returning the deferred
    /// actions for the dispatch layer to issue afterwards.
    pub(crate) fn apply_effects(
        &mut self,
        ctx: &EventCtx<E>,
        effects: Vec<Effect<E>>,
    ) -> Result<Vec<Deferred<E>>, Fatal> {
        let mut deferred = Vec::new();
        for effect in effects {
            tracing::trace!(effect = effect.name(), "applying effect");
            match effect {
                Effect::NextEvent(event) => {
                    self.queued.push_back(Queued::Event {
                        ctx: ctx.clone(),
                        event,
                    });
                }
                Effect::SendMsg { to, msg } => {
                    self.transport.send(&to, msg);
                }
                Effect::Notify { to, reply } => {
                    let _ = to.send(reply);
                }
                Effect::Reply { to, reply } => match to {
                    Some(handle) => deferred.push(Deferred::Reply { to: handle, reply }),
                    None => match (ctx.class, &ctx.reply) {
                        (Class::Call, Some(handle)) => deferred.push(Deferred::Reply {
                            to: handle.clone(),
                            reply,
                        }),
                        _ => {
                            tracing::error!(
                                class = ?ctx.class,
                                "decision core emitted a bare reply outside of a call"
                            );
                            return Err(Fatal::ProtocolViolation);
                        }
                    },
                },
                Effect::SendVoteRequests(requests) => {
                    self.spawn_vote_requests(requests);
                }
                Effect::SendRpcs { urgent, batch } => {
                    if self.proxy.is_none() {
                        self.spawn_proxy();
                    }
                    if let Some(proxy) = &self.proxy {
                        proxy.forward(urgent, batch);
                    }
                }
                Effect::ReleaseCursor { index } => {
                    self.engine.maybe_snapshot(index);
                }
                Effect::SnapshotPoint { index } => {
                    self.engine.record_snapshot_point(index);
                }
                Effect::ScheduleSync => {
                    if self.sync_deadline.is_none() {
                        self.sync_deadline = Some(Instant::now() + self.config.sync_interval());
                    }
                }
            }
        }
        Ok(deferred)
    }

    /// Ask each listed peer for its vote from a transient task of its own.
    ///
    /// Each task performs one synchronous call bounded by the vote RPC
    /// timeout and casts the outcome back, timeout included: the decision
    /// core decides what a silent peer means.
    fn spawn_vote_requests(&self, requests: Vec<(NodeId, E::VoteRequest)>) {
        let rpc_timeout = self.config.vote_rpc_timeout();
        for (target, req) in requests {
            let transport = self.transport.clone();
            let inbox = self.tx_inbox.clone();
            let span = tracing::debug_span!("vote_request", target = %target);
            tokio::spawn(
                async move {
                    let result = match timeout(rpc_timeout, transport.vote(&target, req)).await {
                        Ok(Ok(reply)) => Ok(reply),
                        Ok(Err(err)) => {
                            tracing::warn!(error=%err, "error while requesting vote from peer");
                            Err(RpcError::Transport(err.to_string()))
                        }
                        Err(_) => Err(RpcError::Timeout),
                    };
                    let _ = inbox.send(DriverMsg::VoteResult {
                        from: target,
                        result,
                    });
                }
                .instrument(span),
            );
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::core::testing::{new_test_core, TestCore};
    use crate::core::{EventCtx, Queued};
    use crate::effect::Effect;
    use crate::error::Fatal;
    use crate::event::{Class, Event, Reply, ReplyHandle};
    use crate::NodeId;

    #[tokio::test]
    async fn test_effects_execute_in_emission_order() {
        let TestCore { mut core, transport, .. } = new_test_core("n1", &["n1", "n2"]);

        let ctx = EventCtx::info();
        let effects = vec![
            Effect::SendMsg {
                to: NodeId::from("n2"),
                msg: "first".to_string(),
            },
            Effect::SendMsg {
                to: NodeId::from("n2"),
                msg: "second".to_string(),
            },
            Effect::SendMsg {
                to: NodeId::from("n2"),
                msg: "third".to_string(),
            },
        ];
        core.apply_effects(&ctx, effects).unwrap();

        let sent: Vec<String> = transport.sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(sent, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_schedule_sync_is_idempotent() {
        let TestCore { mut core, .. } = new_test_core("n1", &["n1"]);

        let ctx = EventCtx::info();
        core.apply_effects(&ctx, vec![Effect::ScheduleSync]).unwrap();
        let armed = core.sync_deadline.expect("sync timer should be armed");

        // A second request while armed must not move the deadline.
        tokio::time::sleep(Duration::from_millis(5)).await;
        core.apply_effects(&ctx, vec![Effect::ScheduleSync]).unwrap();
        assert_eq!(core.sync_deadline, Some(armed));
    }

    #[tokio::test]
    async fn test_bare_reply_outside_call_is_fatal() {
        let TestCore { mut core, .. } = new_test_core("n1", &["n1"]);

        let ctx = EventCtx::cast();
        let res = core.apply_effects(&ctx, vec![Effect::Reply {
            to: None,
            reply: Reply::Members(Default::default()),
        }]);
        assert!(matches!(res, Err(Fatal::ProtocolViolation)));
    }

    #[tokio::test]
    async fn test_bare_reply_in_call_uses_current_caller() {
        let TestCore { mut core, .. } = new_test_core("n1", &["n1"]);

        let (handle, mut rx) = ReplyHandle::new();
        let ctx = EventCtx::call(handle);
        let deferred = core
            .apply_effects(&ctx, vec![Effect::Reply {
                to: None,
                reply: Reply::Applied("done".to_string()),
            }])
            .unwrap();

        // The reply is deferred, not issued inline.
        assert!(rx.try_recv().is_err());
        for action in deferred {
            action.run();
        }
        let got = rx.await.unwrap();
        assert!(matches!(got, Reply::Applied(r) if r == "done"));
    }

    #[tokio::test]
    async fn test_next_event_inherits_class() {
        let TestCore { mut core, .. } = new_test_core("n1", &["n1"]);

        let (handle, _rx) = ReplyHandle::new();
        let ctx = EventCtx::call(handle);
        core.apply_effects(&ctx, vec![Effect::NextEvent(Event::Sync)]).unwrap();

        match core.queued.pop_front() {
            Some(Queued::Event { ctx, event }) => {
                assert_eq!(ctx.class, Class::Call);
                assert!(ctx.reply.is_some());
                assert!(matches!(event, Event::Sync));
            }
            _ => panic!("expected an injected event on the queue"),
        }
    }

    #[tokio::test]
    async fn test_send_rpcs_spawns_proxy_once() {
        let TestCore { mut core, .. } = new_test_core("n1", &["n1", "n2"]);
        core.role = crate::Role::Leader;

        let ctx = EventCtx::info();
        core.apply_effects(&ctx, vec![Effect::SendRpcs {
            urgent: true,
            batch: "b1".to_string(),
        }])
        .unwrap();
        assert!(core.proxy.is_some());
        let generation = core.proxy.as_ref().unwrap().generation;

        core.apply_effects(&ctx, vec![Effect::SendRpcs {
            urgent: false,
            batch: "b2".to_string(),
        }])
        .unwrap();
        assert_eq!(core.proxy.as_ref().unwrap().generation, generation);
    }

    #[tokio::test]
    async fn test_release_cursor_reaches_engine() {
        let TestCore { mut core, .. } = new_test_core("n1", &["n1"]);

        let ctx = EventCtx::info();
        core.apply_effects(&ctx, vec![
            Effect::SnapshotPoint { index: 3 },
            Effect::ReleaseCursor { index: 3 },
        ])
        .unwrap();
        assert_eq!(core.engine.snapshot_points, vec![3]);
        assert_eq!(core.engine.snapshots, vec![3]);
    }

    #[tokio::test]
    async fn test_explicit_reply_is_deferred_until_run() {
        let TestCore { mut core, .. } = new_test_core("n1", &["n1"]);

        let (handle, rx) = ReplyHandle::new();
        let ctx = EventCtx::info();
        let deferred = core
            .apply_effects(&ctx, vec![Effect::Reply {
                to: Some(handle),
                reply: Reply::Applied("later".to_string()),
            }])
            .unwrap();
        assert_eq!(deferred.len(), 1);
        for action in deferred {
            action.run();
        }
        let got = rx.await.unwrap();
        assert!(matches!(got, Reply::Applied(r) if r == "later"));
    }
}
