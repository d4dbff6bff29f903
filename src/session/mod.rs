// SPDX-License-Identifier: Apache-2.0

//! Client sessions.
//!
//! Each accepted connection runs one session task owning both transport
//! halves. The task decodes inbound frames, drives the authentication
//! exchange, routes joined traffic to the bound stage, flushes outbound
//! packets queued through the session handle, and keeps the heartbeat
//! clock. Server-initiated requests to the client allocate sequences from
//! the upper half of the range so they cannot collide with the client's
//! own request sequences.

use crate::{
    error::ErrorCode,
    packet::{
        frame,
        Packet,
        RoutePacket,
        MSG_PING,
    },
    request::RequestCache,
    server::Runtime,
    transport::{
        FrameSink,
        FrameSource,
    },
    AccountId,
    SessionId,
    StageId,
};
use log::{
    debug,
    info,
    warn,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicI64,
            Ordering,
        },
        Arc,
        RwLock,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        oneshot,
    },
    time::Instant,
};

pub mod bridge;

/// Sequence range for server-initiated requests to clients.
const SERVER_SEQ_LO: u16 = 32_768;
const SERVER_SEQ_HI: u16 = u16::MAX;

/// Commands accepted by a session task.
pub(crate) enum SessionCommand {
    /// Write a packet (push or reply) to the client.
    Send(Packet),
    /// Send a server-initiated request and resolve the responder with the
    /// client's reply or an error packet.
    Request {
        packet: Packet,
        responder: oneshot::Sender<Packet>,
        timeout: Duration,
    },
    /// Close the connection.
    Close { error_code: u16 },
}

/// Posting handle onto one session task.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub session_id: SessionId,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn send(&self, packet: Packet) -> bool {
        self.tx.send(SessionCommand::Send(packet)).is_ok()
    }

    pub fn request(&self, packet: Packet, timeout: Duration) -> oneshot::Receiver<Packet> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Request {
                packet,
                responder,
                timeout,
            })
            .ok();
        rx
    }

    pub fn close(&self, error_code: u16) {
        self.tx.send(SessionCommand::Close { error_code }).ok();
    }
}

/// The process-wide session table.
pub(crate) struct SessionTable {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicI64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(0),
        }
    }

    pub fn issue_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions.write().unwrap().insert(handle.session_id, handle);
    }

    pub fn remove(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.sessions.write().unwrap().remove(&session_id)
    }

    pub fn get(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.sessions.read().unwrap().get(&session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Push a packet to a session, logging when it is already gone.
    pub fn send_to(&self, session_id: SessionId, packet: Packet) -> bool {
        match self.get(session_id) {
            Some(handle) => handle.send(packet),
            None => {
                debug!("dropping {} for closed session {}", packet.msg_id, session_id);
                false
            }
        }
    }

    /// Request/reply against a client session.
    pub fn request_to(&self, session_id: SessionId, packet: Packet, timeout: Duration) -> oneshot::Receiver<Packet> {
        match self.get(session_id) {
            Some(handle) => handle.request(packet, timeout),
            None => {
                let (tx, rx) = oneshot::channel();
                tx.send(Packet::error_reply(packet.msg_id, 0, ErrorCode::Disconnected.code()))
                    .ok();
                rx
            }
        }
    }

    pub fn close(&self, session_id: SessionId, error_code: u16) {
        if let Some(handle) = self.get(session_id) {
            handle.close(error_code);
        }
    }
}

/// Mutable per-session state shared with the inbound bridge.
pub(crate) struct SessionState {
    pub session_id: SessionId,
    pub account: Option<AccountId>,
    pub current_stage: Option<StageId>,
    pub cache: Arc<RequestCache>,
}

/// Register a fresh session for an accepted connection and start its task.
pub(crate) fn spawn_session(runtime: Arc<Runtime>, source: FrameSource, sink: FrameSink) -> SessionId {
    let session_id = runtime.sessions.issue_id();
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.sessions.insert(SessionHandle { session_id, tx });
    tokio::spawn(run_session(runtime, session_id, source, sink, rx));
    session_id
}

async fn run_session(
    runtime: Arc<Runtime>,
    session_id: SessionId,
    mut source: FrameSource,
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let cache = Arc::new(RequestCache::with_range(SERVER_SEQ_LO, SERVER_SEQ_HI));
    RequestCache::spawn_sweeper(&cache, Duration::from_millis(50));
    let mut state = SessionState {
        session_id,
        account: None,
        current_stage: None,
        cache,
    };
    let heartbeat_interval = Duration::from_millis(runtime.cfg.heartbeat_interval_ms);
    let heartbeat_timeout = Duration::from_millis(runtime.cfg.heartbeat_timeout_ms);
    let idle_timeout = Duration::from_millis(runtime.cfg.connection_idle_timeout_ms);
    let mut ticker = tokio::time::interval((heartbeat_interval / 2).max(Duration::from_millis(250)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_recv = Instant::now();
    let mut last_activity = Instant::now();
    let mut last_ping = Instant::now();
    let mut close_reason: u16 = ErrorCode::Disconnected.code();

    'session: loop {
        tokio::select! {
            inbound = source.next() => {
                let body = match inbound {
                    Ok(Some(body)) => body,
                    Ok(None) => break 'session,
                    Err(e) => {
                        warn!("session {} read failed: {}", session_id, e);
                        break 'session;
                    }
                };
                last_recv = Instant::now();
                last_activity = last_recv;
                let packet = match frame::decode_request(&body) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("session {} sent a malformed frame: {}", session_id, e);
                        close_reason = ErrorCode::BadRequest.code();
                        break 'session;
                    }
                };
                match bridge::handle_inbound(&runtime, &mut state, &mut sink, packet).await {
                    bridge::Flow::Continue => {}
                    bridge::Flow::Close(code) => {
                        close_reason = code;
                        break 'session;
                    }
                }
            }
            command = rx.recv() => {
                match command {
                    Some(SessionCommand::Send(packet)) => {
                        if write_packet(&runtime, &mut sink, packet).await.is_err() {
                            break 'session;
                        }
                        last_activity = Instant::now();
                    }
                    Some(SessionCommand::Request { mut packet, responder, timeout }) => {
                        match state.cache.register(&packet.msg_id, responder, timeout) {
                            Ok(seq) => {
                                packet.msg_seq = seq;
                                if write_packet(&runtime, &mut sink, packet).await.is_err() {
                                    break 'session;
                                }
                                last_activity = Instant::now();
                            }
                            Err(e) => warn!("session {} request table full: {}", session_id, e),
                        }
                    }
                    Some(SessionCommand::Close { error_code }) => {
                        close_reason = error_code;
                        debug!("session {} closing with code {}", session_id, error_code);
                        break 'session;
                    }
                    None => break 'session,
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                if now.duration_since(last_recv) > heartbeat_timeout {
                    info!("session {} heartbeat timed out", session_id);
                    break 'session;
                }
                if now.duration_since(last_activity) > idle_timeout {
                    info!("session {} idle timed out", session_id);
                    break 'session;
                }
                if now.duration_since(last_recv) >= heartbeat_interval
                    && now.duration_since(last_ping) >= heartbeat_interval
                {
                    last_ping = now;
                    if write_packet(&runtime, &mut sink, Packet::new(MSG_PING, Vec::new())).await.is_err() {
                        break 'session;
                    }
                }
            }
        }
    }

    // every pending exchange resolves, the bound actor lingers disconnected
    state.cache.fail_all(ErrorCode::Disconnected);
    if let (Some(account_id), Some(stage_id)) = (state.account, state.current_stage) {
        if let Some(handle) = runtime.stages.get(stage_id) {
            handle
                .post(RoutePacket::ActorDisconnected {
                    account_id,
                    session_id,
                })
                .ok();
        }
    }
    runtime.sessions.remove(session_id);
    sink.close().await;
    debug!("session {} finished (code {})", session_id, close_reason);
}

pub(crate) async fn write_packet(runtime: &Arc<Runtime>, sink: &mut FrameSink, packet: Packet) -> anyhow::Result<()> {
    let frame = frame::encode_response(&packet, runtime.cfg.compression_threshold_bytes)?;
    sink.send(frame).await
}
