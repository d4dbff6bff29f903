// SPDX-License-Identifier: Apache-2.0

//! The per-stage event loop.
//!
//! Every stage owns a bounded MPSC queue with exactly one consumer task:
//! this runner. One item is dispatched at a time and each user handler is
//! awaited to completion before the next item is taken, so a slow handler
//! delays only its own stage. Handler panics are caught, logged, and — when
//! the item was a request — answered with `InternalError`.

use super::{
    pool::{
        StageFactory,
        StageHandle,
    },
    registry::{
        ActorEntry,
        ActorRegistry,
    },
    Actor,
    Stage,
};
use crate::{
    error::ErrorCode,
    packet::{
        JoinOutcome,
        Packet,
        RoutePacket,
    },
    sender::{
        ActorSender,
        ReplyTarget,
        RosterEntry,
        SenderCore,
        StageSender,
    },
    server::Runtime,
    AccountId,
    SessionId,
    StageId,
};
use futures::FutureExt;
use log::{
    debug,
    error,
    warn,
};
use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    },
};
use tokio::{
    sync::mpsc,
    time::Instant,
};

/// Await a user hook, converting a panic into a logged error.
async fn guarded<F, T>(stage_id: StageId, what: &str, fut: F) -> Result<T, ()>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(_) => {
            error!("stage {} handler panicked during {}", stage_id, what);
            Err(())
        }
    }
}

/// Build the factory closure for one registered stage type.
pub(crate) fn make_factory<S, FS, FA>(stage_builder: FS, actor_builder: FA) -> StageFactory
where
    S: Stage,
    FS: Fn(StageSender<S>) -> S + Send + Sync + 'static,
    FA: Fn(ActorSender) -> S::Actor + Send + Sync + 'static,
{
    let stage_builder = Arc::new(stage_builder);
    let actor_builder = Arc::new(actor_builder);
    Arc::new(move |runtime: Arc<Runtime>, stage_id, stage_type, packet: Packet| {
        let stage_builder = stage_builder.clone();
        let actor_builder = actor_builder.clone();
        async move {
            let (tx, rx) = mpsc::channel(runtime.cfg.stage_queue_capacity.max(1));
            let depth = Arc::new(AtomicUsize::new(0));
            let draining = Arc::new(AtomicBool::new(false));
            let core = Arc::new(SenderCore {
                stage_id,
                stage_type: stage_type.clone(),
                node_id: runtime.node_id.clone(),
                runtime: Arc::downgrade(&runtime),
                queue: tx.clone(),
                depth: depth.clone(),
                draining: draining.clone(),
                reply: Mutex::new(None),
                roster: Mutex::new(HashMap::new()),
            });
            let mut stage = (*stage_builder)(StageSender::new(core.clone()));
            let code = guarded(stage_id, "on_create", stage.on_create(&packet))
                .await
                .unwrap_or_else(|_| ErrorCode::InternalError.code());
            if code != 0 {
                return Err(code);
            }
            let handle = StageHandle {
                stage_id,
                stage_type,
                tx,
                depth: depth.clone(),
                draining: draining.clone(),
            };
            let runner = StageRunner {
                stage_id,
                runtime,
                stage,
                actors: ActorRegistry::new(),
                actor_builder,
                core,
                rx,
                depth,
                draining,
                closed: false,
            };
            tokio::spawn(runner.run());
            Ok(handle)
        }
        .boxed()
    })
}

struct StageRunner<S: Stage> {
    stage_id: StageId,
    runtime: Arc<Runtime>,
    stage: S,
    actors: ActorRegistry<S::Actor>,
    actor_builder: Arc<dyn Fn(ActorSender) -> S::Actor + Send + Sync>,
    core: Arc<SenderCore>,
    rx: mpsc::Receiver<RoutePacket>,
    depth: Arc<AtomicUsize>,
    draining: Arc<AtomicBool>,
    closed: bool,
}

impl<S: Stage> StageRunner<S> {
    async fn run(mut self) {
        while let Some(item) = self.rx.recv().await {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            self.draining.store(true, Ordering::Relaxed);
            let close = matches!(item, RoutePacket::Close);
            self.dispatch(item).await;
            self.draining.store(false, Ordering::Relaxed);
            if close {
                break;
            }
        }
        // closes the queue and runs the destroy path when the pool dropped
        // the handle without a close item
        self.destroy().await;
    }

    async fn dispatch(&mut self, item: RoutePacket) {
        match item {
            RoutePacket::PostCreate => {
                guarded(self.stage_id, "on_post_create", self.stage.on_post_create())
                    .await
                    .ok();
            }
            RoutePacket::Client {
                session_id,
                account_id,
                packet,
            } => self.dispatch_client(session_id, account_id, packet).await,
            RoutePacket::Stage {
                source_node,
                source_stage,
                packet,
            } => self.dispatch_stage(source_node, source_stage, packet).await,
            RoutePacket::Join(join) => {
                let outcome = self.handle_join(join.session_id, &join.packet).await;
                join.responder.send(outcome).ok();
            }
            RoutePacket::Leave {
                account_id,
                reason,
                responder,
            } => {
                let code = self.handle_leave(account_id, reason).await;
                if let Some(responder) = responder {
                    responder.send(code).ok();
                }
            }
            RoutePacket::ActorDisconnected {
                account_id,
                session_id,
            } => self.handle_disconnected(account_id, session_id).await,
            RoutePacket::Timer { timer_id, task } => {
                let stage: &mut (dyn Any + Send) = &mut self.stage;
                if guarded(self.stage_id, "timer", (*task)(stage)).await.is_err() {
                    warn!("stage {} timer {} callback panicked", self.stage_id, timer_id);
                }
            }
            RoutePacket::AsyncResult { task, value } => {
                let stage: &mut (dyn Any + Send) = &mut self.stage;
                guarded(self.stage_id, "async result", task(stage, value)).await.ok();
            }
            RoutePacket::Close => {
                self.destroy().await;
            }
        }
    }

    async fn dispatch_client(&mut self, session_id: SessionId, account_id: AccountId, packet: Packet) {
        let msg_seq = packet.msg_seq;
        let msg_id = packet.msg_id.clone();
        if !self.actors.contains(account_id) {
            warn!(
                "stage {} dropping {} for unknown account {}",
                self.stage_id, msg_id, account_id
            );
            if msg_seq > 0 {
                if let Some(rt) = self.core.runtime() {
                    rt.sessions
                        .send_to(session_id, Packet::error_reply(msg_id, msg_seq, ErrorCode::BadRequest.code()));
                }
            }
            return;
        }
        if msg_seq > 0 {
            self.core.set_reply(Some(ReplyTarget::Session {
                session_id,
                msg_seq,
                msg_id: msg_id.clone(),
            }));
        } else {
            self.core.set_reply(None);
        }
        let entry = self.actors.get_mut(account_id).expect("checked above");
        let result = guarded(
            self.stage_id,
            "on_dispatch",
            self.stage.on_dispatch(&mut entry.actor, packet),
        )
        .await;
        let leftover = self.core.take_reply();
        if result.is_err() {
            if let Some(target) = leftover {
                self.core.deliver_reply(
                    target,
                    Packet::error_reply(msg_id, msg_seq, ErrorCode::InternalError.code()),
                );
            }
        }
    }

    async fn dispatch_stage(&mut self, source_node: String, source_stage: StageId, packet: Packet) {
        let msg_seq = packet.msg_seq;
        let msg_id = packet.msg_id.clone();
        if msg_seq > 0 {
            self.core.set_reply(Some(ReplyTarget::Remote {
                node_id: source_node,
                stage_id: source_stage,
                msg_seq,
                msg_id: msg_id.clone(),
            }));
        } else {
            self.core.set_reply(None);
        }
        let result = guarded(self.stage_id, "on_stage_dispatch", self.stage.on_stage_dispatch(packet)).await;
        let leftover = self.core.take_reply();
        if result.is_err() {
            if let Some(target) = leftover {
                self.core.deliver_reply(
                    target,
                    Packet::error_reply(msg_id, msg_seq, ErrorCode::InternalError.code()),
                );
            }
        }
    }

    async fn handle_join(&mut self, session_id: SessionId, packet: &Packet) -> JoinOutcome {
        let account_id = match guarded(self.stage_id, "on_authenticate", self.stage.on_authenticate(packet)).await {
            Err(()) => return JoinOutcome::failure(ErrorCode::InternalError.code()),
            Ok(Err(code)) => return JoinOutcome::failure(code),
            Ok(Ok(account_id)) => account_id,
        };

        if self.actors.contains(account_id) {
            let (connected, old_session) = {
                let entry = self.actors.get_mut(account_id).expect("checked above");
                (entry.connected, entry.session_id)
            };
            if connected && old_session == session_id {
                // same session re-authenticating
                return JoinOutcome { error_code: 0, account_id };
            }
            if connected {
                // a newer session takes the account: kick the old actor
                let entry = self.actors.get_mut(account_id).expect("checked above");
                guarded(
                    self.stage_id,
                    "on_actor_connection_changed",
                    self.stage.on_actor_connection_changed(&mut entry.actor, false),
                )
                .await
                .ok();
                let mut entry = self.actors.remove(account_id).expect("checked above");
                guarded(
                    self.stage_id,
                    "on_leave_stage",
                    self.stage
                        .on_leave_stage(&mut entry.actor, super::leave_reason::DUPLICATE_LOGIN),
                )
                .await
                .ok();
                entry.actor.on_destroy();
                self.core.roster.lock().unwrap().remove(&account_id);
                if let Some(rt) = self.core.runtime() {
                    rt.sessions.close(old_session, ErrorCode::DuplicateLogin.code());
                }
                // fall through to a fresh join for the new session
            } else {
                // resume: rebind the lingering actor to the new session
                let entry = self.actors.get_mut(account_id).expect("checked above");
                entry.connected = true;
                entry.disconnected_at = None;
                entry.session_id = session_id;
                entry.sender.rebind(session_id);
                self.core.roster.lock().unwrap().insert(
                    account_id,
                    RosterEntry {
                        session_id,
                        connected: true,
                        disconnected_at: None,
                    },
                );
                guarded(
                    self.stage_id,
                    "on_actor_connection_changed",
                    self.stage.on_actor_connection_changed(&mut entry.actor, true),
                )
                .await
                .ok();
                return JoinOutcome { error_code: 0, account_id };
            }
        }

        let sender = ActorSender::new(self.core.clone(), account_id, session_id);
        let mut actor = (*self.actor_builder)(sender.clone());
        actor.on_create();
        let code = guarded(self.stage_id, "on_join_stage", self.stage.on_join_stage(&mut actor, packet))
            .await
            .unwrap_or_else(|_| ErrorCode::InternalError.code());
        if code != 0 {
            actor.on_destroy();
            return JoinOutcome::failure(code);
        }
        self.actors.insert(
            account_id,
            ActorEntry {
                actor,
                sender,
                session_id,
                connected: true,
                disconnected_at: None,
            },
        );
        self.core.roster.lock().unwrap().insert(
            account_id,
            RosterEntry {
                session_id,
                connected: true,
                disconnected_at: None,
            },
        );
        let entry = self.actors.get_mut(account_id).expect("just inserted");
        guarded(
            self.stage_id,
            "on_post_join_stage",
            self.stage.on_post_join_stage(&mut entry.actor),
        )
        .await
        .ok();
        JoinOutcome { error_code: 0, account_id }
    }

    async fn handle_leave(&mut self, account_id: AccountId, reason: u16) -> u16 {
        match self.actors.remove(account_id) {
            Some(mut entry) => {
                guarded(
                    self.stage_id,
                    "on_leave_stage",
                    self.stage.on_leave_stage(&mut entry.actor, reason),
                )
                .await
                .ok();
                entry.actor.on_destroy();
                self.core.roster.lock().unwrap().remove(&account_id);
                0
            }
            None => ErrorCode::BadRequest.code(),
        }
    }

    async fn handle_disconnected(&mut self, account_id: AccountId, session_id: SessionId) {
        let entry = match self.actors.get_mut(account_id) {
            Some(entry) => entry,
            None => return,
        };
        if entry.session_id != session_id {
            // the account already moved to a newer session
            return;
        }
        entry.connected = false;
        entry.disconnected_at = Some(Instant::now());
        if let Some(roster) = self.core.roster.lock().unwrap().get_mut(&account_id) {
            roster.connected = false;
            roster.disconnected_at = entry.disconnected_at;
        }
        guarded(
            self.stage_id,
            "on_actor_connection_changed",
            self.stage.on_actor_connection_changed(&mut entry.actor, false),
        )
        .await
        .ok();
    }

    /// Destroy exactly once: out of the pool, timers cancelled, destroy
    /// hooks run, actors dropped, queue closed. Anything still queued is
    /// discarded, so no timer or async-result callback runs afterwards.
    async fn destroy(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.runtime.stages.remove(self.stage_id);
        self.runtime.timers.cancel_all_for_stage(self.stage_id);
        guarded(self.stage_id, "on_destroy", self.stage.on_destroy()).await.ok();
        let actor_count = self.actors.len();
        for (_, mut entry) in self.actors.drain() {
            entry.actor.on_destroy();
        }
        self.core.roster.lock().unwrap().clear();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        debug!("stage {} destroyed, {} actors dropped", self.stage_id, actor_count);
    }
}
