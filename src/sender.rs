// SPDX-License-Identifier: Apache-2.0

//! The sender facades surfaced to user code.
//!
//! Senders hold ids and a weak runtime handle, never direct references to
//! sessions or stages; every send resolves its target through the central
//! registries at call time. [`StageSender`] is generic over the concrete
//! stage type so timer and async-block callbacks can mutate the stage
//! without exposing the type-erased plumbing underneath.

use crate::{
    error::{
        ErrorCode,
        PostError,
    },
    packet::{
        CreateStageMsg,
        Packet,
        RoutePacket,
        StageTask,
        StageTaskOnce,
        MSG_CREATE_STAGE,
    },
    server::Runtime,
    stage::{
        pool::StageHandle,
        Stage,
    },
    timer::TimerKind,
    AccountId,
    NodeId,
    SessionId,
    StageId,
    TimerId,
};
use log::{
    debug,
    error,
    warn,
};
use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{
            AtomicBool,
            AtomicI64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::Instant,
};

/// Where the currently dispatched request's reply must go.
#[derive(Clone, Debug)]
pub(crate) enum ReplyTarget {
    /// Reply to a client session on this node.
    Session {
        session_id: SessionId,
        msg_seq: u16,
        msg_id: String,
    },
    /// Reply to a stage (or Api caller) on `node_id`.
    Remote {
        node_id: NodeId,
        stage_id: StageId,
        msg_seq: u16,
        msg_id: String,
    },
}

/// Connection snapshot of one joined account, for broadcast filters and
/// eviction policies.
#[derive(Clone, Debug)]
pub struct ActorInfo {
    /// The account.
    pub account_id: AccountId,
    /// Whether a session is currently attached.
    pub connected: bool,
    /// How long the account has been disconnected, when it is.
    pub disconnected_for: Option<Duration>,
}

pub(crate) struct RosterEntry {
    pub session_id: SessionId,
    pub connected: bool,
    pub disconnected_at: Option<Instant>,
}

/// Shared, non-generic state behind the senders of one stage.
pub(crate) struct SenderCore {
    pub stage_id: StageId,
    pub stage_type: String,
    pub node_id: NodeId,
    pub runtime: Weak<Runtime>,
    pub queue: mpsc::Sender<RoutePacket>,
    pub depth: Arc<AtomicUsize>,
    pub draining: Arc<AtomicBool>,
    pub reply: Mutex<Option<ReplyTarget>>,
    pub roster: Mutex<HashMap<AccountId, RosterEntry>>,
}

impl SenderCore {
    pub fn set_reply(&self, target: Option<ReplyTarget>) {
        *self.reply.lock().unwrap() = target;
    }

    pub fn take_reply(&self) -> Option<ReplyTarget> {
        self.reply.lock().unwrap().take()
    }

    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.upgrade()
    }

    /// Self-post onto the owning stage's queue.
    pub fn post(&self, packet: RoutePacket) -> Result<(), PostError> {
        match self.queue.try_send(packet) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PostError::Overloaded(self.stage_id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PostError::Closed(self.stage_id)),
        }
    }

    /// A posting handle equivalent to the one in the stage pool.
    pub fn stage_handle(&self) -> StageHandle {
        StageHandle {
            stage_id: self.stage_id,
            stage_type: self.stage_type.clone(),
            tx: self.queue.clone(),
            depth: self.depth.clone(),
            draining: self.draining.clone(),
        }
    }

    fn request_timeout(&self) -> Duration {
        self.runtime()
            .map(|rt| Duration::from_millis(rt.cfg.request_timeout_ms))
            .unwrap_or_else(|| Duration::from_millis(10_000))
    }

    /// Route a reply packet to its captured target.
    pub fn deliver_reply(&self, target: ReplyTarget, mut packet: Packet) {
        let runtime = match self.runtime() {
            Some(rt) => rt,
            None => return,
        };
        match target {
            ReplyTarget::Session {
                session_id,
                msg_seq,
                msg_id,
            } => {
                packet.msg_seq = msg_seq;
                packet.stage_id = self.stage_id;
                if packet.msg_id.is_empty() {
                    packet.msg_id = msg_id;
                }
                runtime.sessions.send_to(session_id, packet);
            }
            ReplyTarget::Remote {
                node_id,
                stage_id,
                msg_seq,
                msg_id,
            } => {
                packet.msg_seq = msg_seq;
                if packet.msg_id.is_empty() {
                    packet.msg_id = msg_id;
                }
                let env = crate::packet::envelope::Envelope {
                    kind: crate::packet::envelope::EnvelopeKind::Reply,
                    source_node: self.node_id.clone(),
                    target_node: node_id,
                    target_service: 0,
                    target_stage: stage_id,
                    source_stage: self.stage_id,
                    account_id: 0,
                    packet,
                };
                runtime.send_envelope(env);
            }
        }
    }

    /// Point-in-time roster snapshot.
    pub fn actor_infos(&self) -> Vec<ActorInfo> {
        let now = Instant::now();
        self.roster
            .lock()
            .unwrap()
            .iter()
            .map(|(account_id, entry)| ActorInfo {
                account_id: *account_id,
                connected: entry.connected,
                disconnected_for: entry.disconnected_at.map(|at| now.duration_since(at)),
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn detached_for_test(stage_id: StageId) -> Arc<Self> {
        let (tx, _rx) = mpsc::channel(16);
        std::mem::forget(_rx);
        Arc::new(Self {
            stage_id,
            stage_type: "test".to_string(),
            node_id: "test-node".to_string(),
            runtime: Weak::new(),
            queue: tx,
            depth: Arc::new(AtomicUsize::new(0)),
            draining: Arc::new(AtomicBool::new(false)),
            reply: Mutex::new(None),
            roster: Mutex::new(HashMap::new()),
        })
    }
}

async fn request_via_stage(
    core: Arc<SenderCore>,
    target_node: NodeId,
    target_stage: StageId,
    packet: Packet,
) -> Packet {
    match core.runtime() {
        Some(rt) => {
            let timeout = core.request_timeout();
            rt.stage_request(target_node, target_stage, core.stage_id, packet, timeout).await
        }
        None => Packet::error_reply(packet.msg_id, packet.msg_seq, ErrorCode::Disconnected.code()),
    }
}

/// The sender bound to one stage, handed to the stage builder.
pub struct StageSender<S: Stage> {
    core: Arc<SenderCore>,
    _stage: PhantomData<fn(S) -> S>,
}

impl<S: Stage> Clone for StageSender<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _stage: PhantomData,
        }
    }
}

impl<S: Stage> StageSender<S> {
    pub(crate) fn new(core: Arc<SenderCore>) -> Self {
        Self {
            core,
            _stage: PhantomData,
        }
    }

    /// This stage's id.
    pub fn stage_id(&self) -> StageId {
        self.core.stage_id
    }

    /// The registered type this stage was created from.
    pub fn stage_type(&self) -> &str {
        &self.core.stage_type
    }

    /// The hosting node's id.
    pub fn node_id(&self) -> &str {
        &self.core.node_id
    }

    /// Reply to the request currently being dispatched. A no-op (with a
    /// log line) outside a request context or for push packets.
    pub fn reply(&self, packet: Packet) {
        match self.core.take_reply() {
            Some(target) => self.core.deliver_reply(target, packet),
            None => debug!("stage {} reply without request context dropped", self.core.stage_id),
        }
    }

    /// Reply with just an error code.
    pub fn reply_error(&self, error_code: u16) {
        self.reply(Packet {
            error_code,
            ..Default::default()
        });
    }

    /// Fire-and-forget packet to a stage anywhere in the fleet.
    pub fn send_to_stage(&self, node_id: &str, stage_id: StageId, mut packet: Packet) {
        packet.msg_seq = 0;
        if let Some(rt) = self.core.runtime() {
            let env = crate::packet::envelope::Envelope::request(
                self.core.node_id.clone(),
                node_id.to_string(),
                stage_id,
                self.core.stage_id,
                packet,
            );
            rt.send_envelope(env);
        }
    }

    /// Request/reply against a stage anywhere in the fleet. Resolves with
    /// exactly one packet: the reply, or an error packet on timeout,
    /// unreachable node, or disconnect.
    pub async fn request_to_stage(&self, node_id: &str, stage_id: StageId, packet: Packet) -> Packet {
        request_via_stage(self.core.clone(), node_id.to_string(), stage_id, packet).await
    }

    /// Callback form of [`Self::request_to_stage`]: the callback runs back
    /// inside this stage's loop with the reply.
    pub fn request_to_stage_callback<F>(&self, node_id: &str, stage_id: StageId, packet: Packet, callback: F)
    where
        F: FnOnce(&mut S, Packet) + Send + 'static,
    {
        let core = self.core.clone();
        let node = node_id.to_string();
        self.async_block(
            move || request_via_stage(core, node, stage_id, packet),
            callback,
        );
    }

    /// Fire-and-forget packet to any Api node serving `service_id`.
    pub fn send_to_api(&self, service_id: u16, mut packet: Packet) {
        packet.msg_seq = 0;
        if let Some(rt) = self.core.runtime() {
            rt.api_send(service_id, self.core.stage_id, packet);
        }
    }

    /// Request/reply against the Api service, load-balanced across its
    /// live nodes.
    pub async fn request_to_api(&self, service_id: u16, packet: Packet) -> Packet {
        match self.core.runtime() {
            Some(rt) => {
                let timeout = self.core.request_timeout();
                rt.api_request(service_id, self.core.stage_id, packet, timeout).await
            }
            None => Packet::error_reply(packet.msg_id, packet.msg_seq, ErrorCode::Disconnected.code()),
        }
    }

    /// Push a packet to every connected actor of this stage.
    pub fn broadcast_to_actors(&self, packet: Packet) {
        self.broadcast_to_actors_filtered(packet, |_| true);
    }

    /// Push a packet to every connected actor accepted by the filter.
    pub fn broadcast_to_actors_filtered<F>(&self, mut packet: Packet, filter: F)
    where
        F: Fn(&ActorInfo) -> bool,
    {
        packet.msg_seq = 0;
        packet.stage_id = self.core.stage_id;
        let runtime = match self.core.runtime() {
            Some(rt) => rt,
            None => return,
        };
        let now = Instant::now();
        let targets: Vec<SessionId> = self
            .core
            .roster
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.connected)
            .filter(|(account_id, entry)| {
                filter(&ActorInfo {
                    account_id: **account_id,
                    connected: entry.connected,
                    disconnected_for: entry.disconnected_at.map(|at| now.duration_since(at)),
                })
            })
            .map(|(_, entry)| entry.session_id)
            .collect();
        for session_id in targets {
            runtime.sessions.send_to(session_id, packet.clone());
        }
    }

    /// Schedule a callback every `period`, first firing after
    /// `initial_delay`. The callback runs inside this stage's loop.
    pub fn add_repeat_timer<F>(&self, initial_delay: Duration, period: Duration, callback: F) -> TimerId
    where
        F: Fn(&mut S) + Send + Sync + 'static,
    {
        self.add_timer(initial_delay, period, TimerKind::Repeat, callback)
    }

    /// Schedule a callback to fire at most `count` times.
    pub fn add_count_timer<F>(&self, initial_delay: Duration, period: Duration, count: u32, callback: F) -> TimerId
    where
        F: Fn(&mut S) + Send + Sync + 'static,
    {
        self.add_timer(initial_delay, period, TimerKind::Count(count), callback)
    }

    fn add_timer<F>(&self, initial_delay: Duration, period: Duration, kind: TimerKind, callback: F) -> TimerId
    where
        F: Fn(&mut S) + Send + Sync + 'static,
    {
        let task: StageTask = Arc::new(move |any| {
            match any.downcast_mut::<S>() {
                Some(stage) => callback(stage),
                None => error!("timer callback dropped: stage type mismatch"),
            }
            Box::pin(async {})
        });
        match self.core.runtime() {
            Some(rt) => rt
                .timers
                .add_timer(self.core.stage_handle(), initial_delay, period, kind, task),
            None => 0,
        }
    }

    /// Stop a timer scheduled by this stage.
    pub fn cancel_timer(&self, timer_id: TimerId) -> bool {
        match self.core.runtime() {
            Some(rt) => rt.timers.cancel(timer_id),
            None => false,
        }
    }

    /// Destroy this stage. Pending queue items are dropped, timers are
    /// cancelled, and every actor is destroyed.
    pub fn close_stage(&self) {
        if self.core.post(RoutePacket::Close).is_err() {
            debug!("stage {} close already in flight", self.core.stage_id);
        }
    }

    /// Run `pre` off-loop (it may block on I/O without stalling this
    /// stage), then run `post` back inside the loop with the result.
    pub fn async_block<T, Pre, PreFut, Post>(&self, pre: Pre, post: Post)
    where
        T: Send + 'static,
        Pre: FnOnce() -> PreFut + Send + 'static,
        PreFut: Future<Output = T> + Send + 'static,
        Post: FnOnce(&mut S, T) + Send + 'static,
    {
        let core = self.core.clone();
        tokio::spawn(async move {
            let value = pre().await;
            let task: StageTaskOnce = Box::new(move |any, boxed| {
                match (any.downcast_mut::<S>(), boxed.downcast::<T>()) {
                    (Some(stage), Ok(value)) => post(stage, *value),
                    _ => error!("async block post dropped: type mismatch"),
                }
                Box::pin(async {})
            });
            if core
                .post(RoutePacket::AsyncResult {
                    task,
                    value: Box::new(value),
                })
                .is_err()
            {
                debug!("async block result dropped: stage {} is gone", core.stage_id);
            }
        });
    }

    /// Connection snapshot of the joined accounts.
    pub fn actor_infos(&self) -> Vec<ActorInfo> {
        self.core.actor_infos()
    }

    /// Remove an account from the stage via the leave path.
    pub fn kick_actor(&self, account_id: AccountId, reason: u16) {
        if self
            .core
            .post(RoutePacket::Leave {
                account_id,
                reason,
                responder: None,
            })
            .is_err()
        {
            debug!("kick for account {} dropped: stage {} is gone", account_id, self.core.stage_id);
        }
    }
}

/// The sender bound to one actor of one stage.
#[derive(Clone)]
pub struct ActorSender {
    core: Arc<SenderCore>,
    account_id: AccountId,
    session_id: Arc<AtomicI64>,
}

impl ActorSender {
    pub(crate) fn new(core: Arc<SenderCore>, account_id: AccountId, session_id: SessionId) -> Self {
        Self {
            core,
            account_id,
            session_id: Arc::new(AtomicI64::new(session_id)),
        }
    }

    /// The account this sender is bound to.
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// The stage this actor lives in.
    pub fn stage_id(&self) -> StageId {
        self.core.stage_id
    }

    /// Reply to the request currently being dispatched.
    pub fn reply(&self, packet: Packet) {
        match self.core.take_reply() {
            Some(target) => self.core.deliver_reply(target, packet),
            None => debug!(
                "actor {} reply without request context dropped",
                self.account_id
            ),
        }
    }

    /// Reply with just an error code.
    pub fn reply_error(&self, error_code: u16) {
        self.reply(Packet {
            error_code,
            ..Default::default()
        });
    }

    /// Push a packet to this actor's session.
    pub fn send(&self, mut packet: Packet) {
        packet.msg_seq = 0;
        packet.stage_id = self.core.stage_id;
        if let Some(rt) = self.core.runtime() {
            rt.sessions.send_to(self.session_id.load(Ordering::Relaxed), packet);
        }
    }

    /// Server-initiated request to this actor's client. Resolves with the
    /// client's reply or an error packet on timeout/disconnect.
    pub async fn request_to_client(&self, mut packet: Packet) -> Packet {
        packet.stage_id = self.core.stage_id;
        let msg_id = packet.msg_id.clone();
        let rt = match self.core.runtime() {
            Some(rt) => rt,
            None => return Packet::error_reply(msg_id, 0, ErrorCode::Disconnected.code()),
        };
        let timeout = self.core.request_timeout();
        let rx = rt
            .sessions
            .request_to(self.session_id.load(Ordering::Relaxed), packet, timeout);
        match rx.await {
            Ok(reply) => reply,
            Err(_) => Packet::error_reply(msg_id, 0, ErrorCode::Disconnected.code()),
        }
    }

    /// Point the sender at the account's new session after a resume.
    pub(crate) fn rebind(&self, session_id: SessionId) {
        self.session_id.store(session_id, Ordering::Relaxed);
    }
}

struct ApiSenderInner {
    runtime: Arc<Runtime>,
    source_node: NodeId,
    source_stage: StageId,
    account_id: AccountId,
    msg_seq: u16,
    msg_id: String,
    replied: AtomicBool,
}

/// The sender bound to one Api request being handled.
#[derive(Clone)]
pub struct ApiSender {
    inner: Arc<ApiSenderInner>,
}

impl ApiSender {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        source_node: NodeId,
        source_stage: StageId,
        account_id: AccountId,
        msg_seq: u16,
        msg_id: String,
    ) -> Self {
        Self {
            inner: Arc::new(ApiSenderInner {
                runtime,
                source_node,
                source_stage,
                account_id,
                msg_seq,
                msg_id,
                replied: AtomicBool::new(false),
            }),
        }
    }

    /// The account the request concerns, when the caller set one.
    pub fn account_id(&self) -> AccountId {
        self.inner.account_id
    }

    /// Reply to the caller. A no-op for pushes; only the first reply of a
    /// request is delivered.
    pub fn reply(&self, mut packet: Packet) {
        if self.inner.msg_seq == 0 {
            debug!("api reply to push {} dropped", self.inner.msg_id);
            return;
        }
        if self.inner.replied.swap(true, Ordering::Relaxed) {
            warn!("api handler for {} replied more than once", self.inner.msg_id);
            return;
        }
        packet.msg_seq = self.inner.msg_seq;
        if packet.msg_id.is_empty() {
            packet.msg_id = self.inner.msg_id.clone();
        }
        let env = crate::packet::envelope::Envelope {
            kind: crate::packet::envelope::EnvelopeKind::Reply,
            source_node: self.inner.runtime.node_id.clone(),
            target_node: self.inner.source_node.clone(),
            target_service: 0,
            target_stage: self.inner.source_stage,
            source_stage: 0,
            account_id: self.inner.account_id,
            packet,
        };
        self.inner.runtime.send_envelope(env);
    }

    /// Reply with just an error code.
    pub fn reply_error(&self, error_code: u16) {
        self.reply(Packet {
            error_code,
            ..Default::default()
        });
    }

    pub(crate) fn replied(&self) -> bool {
        self.inner.replied.load(Ordering::Relaxed)
    }

    /// Fire-and-forget packet to a stage anywhere in the fleet.
    pub fn send_to_stage(&self, node_id: &str, stage_id: StageId, mut packet: Packet) {
        packet.msg_seq = 0;
        let env = crate::packet::envelope::Envelope::request(
            self.inner.runtime.node_id.clone(),
            node_id.to_string(),
            stage_id,
            0,
            packet,
        );
        self.inner.runtime.send_envelope(env);
    }

    /// Request/reply against a stage anywhere in the fleet.
    pub async fn request_to_stage(&self, node_id: &str, stage_id: StageId, packet: Packet) -> Packet {
        let timeout = Duration::from_millis(self.inner.runtime.cfg.request_timeout_ms);
        self.inner
            .runtime
            .stage_request(node_id.to_string(), stage_id, 0, packet, timeout)
            .await
    }

    /// Callback form of [`Self::request_to_stage`]; the callback runs on a
    /// worker task once the reply (or error packet) arrives.
    pub fn request_to_stage_callback<F>(&self, node_id: &str, stage_id: StageId, packet: Packet, callback: F)
    where
        F: FnOnce(Packet) + Send + 'static,
    {
        let this = self.clone();
        let node = node_id.to_string();
        tokio::spawn(async move {
            let reply = this.request_to_stage(&node, stage_id, packet).await;
            callback(reply);
        });
    }

    /// Create a stage on a Play node. Resolves with the creation error
    /// code and the reply packet (its payload carries the stage id).
    pub async fn create_stage(
        &self,
        node_id: &str,
        stage_type: &str,
        stage_id: Option<StageId>,
        payload: Vec<u8>,
    ) -> (u16, Packet) {
        let msg = CreateStageMsg {
            stage_type: stage_type.to_string(),
            payload,
        };
        let packet = match msg.encode() {
            Ok(encoded) => Packet::new(MSG_CREATE_STAGE, encoded),
            Err(e) => {
                warn!("create stage rejected: {}", e);
                let code = ErrorCode::BadRequest.code();
                return (code, Packet::error_reply(MSG_CREATE_STAGE, 0, code));
            }
        };
        let reply = self
            .request_to_stage(node_id, stage_id.unwrap_or(0), packet)
            .await;
        (reply.error_code, reply)
    }
}
