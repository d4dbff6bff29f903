// SPDX-License-Identifier: Apache-2.0

//! The client connector.
//!
//! One connector owns one connection (TCP, TCP-TLS, WS, or WSS per its
//! configuration), assigns request sequences from the lower half of the
//! range, answers server pings, and surfaces pushes through a channel.
//! Requests always resolve with exactly one packet; timeouts, disconnects,
//! and transport failures arrive as error packets.

use crate::{
    config::ConnectorConfig,
    error::ErrorCode,
    packet::{
        frame,
        ConnectStageMsg,
        Packet,
        MSG_CONNECT_STAGE,
        MSG_PING,
        MSG_PONG,
    },
    request::RequestCache,
    transport,
    StageId,
};
use log::{
    debug,
    info,
    warn,
};
use std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicI64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        oneshot,
        Notify,
    },
    time::Instant,
};

/// Sequence range for client-initiated requests; the server-initiated
/// range starts at 32768.
const CLIENT_SEQ_LO: u16 = 1;
const CLIENT_SEQ_HI: u16 = 32_767;

/// A connected client.
pub struct Connector {
    cfg: ConnectorConfig,
    addr: String,
    out_tx: mpsc::UnboundedSender<Packet>,
    cache: Arc<RequestCache>,
    push_rx: mpsc::UnboundedReceiver<Packet>,
    current_stage: AtomicI64,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
}

impl Connector {
    /// Open a connection to `addr` (`host:port`) per the configuration.
    pub async fn connect(cfg: ConnectorConfig, addr: &str) -> anyhow::Result<Self> {
        let (source, sink) = transport::connect_client(addr, &cfg).await?;
        let cache = Arc::new(RequestCache::with_range(CLIENT_SEQ_LO, CLIENT_SEQ_HI));
        RequestCache::spawn_sweeper(&cache, Duration::from_millis(25));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let close_signal = Arc::new(Notify::new());
        tokio::spawn(io_loop(
            cfg.clone(),
            source,
            sink,
            out_rx,
            out_tx.clone(),
            push_tx,
            cache.clone(),
            closed.clone(),
            close_signal.clone(),
        ));
        info!("connected to {}", addr);
        Ok(Self {
            cfg,
            addr: addr.to_string(),
            out_tx,
            cache,
            push_rx,
            current_stage: AtomicI64::new(0),
            closed,
            close_signal,
        })
    }

    /// Tear down the current connection (when still up) and dial the same
    /// endpoint again. The session starts fresh server-side: the caller
    /// re-binds and re-authenticates, which resumes a lingering actor
    /// under the same account.
    pub async fn reconnect(&mut self) -> anyhow::Result<()> {
        self.disconnect();
        let (source, sink) = transport::connect_client(&self.addr, &self.cfg).await?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        // fresh flags per connection generation; the old loop's final
        // bookkeeping must not touch the new one
        let closed = Arc::new(AtomicBool::new(false));
        let close_signal = Arc::new(Notify::new());
        tokio::spawn(io_loop(
            self.cfg.clone(),
            source,
            sink,
            out_rx,
            out_tx.clone(),
            push_tx,
            self.cache.clone(),
            closed.clone(),
            close_signal.clone(),
        ));
        self.out_tx = out_tx;
        self.push_rx = push_rx;
        self.closed = closed;
        self.close_signal = close_signal;
        info!("reconnected to {}", self.addr);
        Ok(())
    }

    /// Bind to a stage (creating it server-side when absent) and remember
    /// it as the target of subsequent requests.
    pub async fn connect_stage(&self, stage_id: StageId, stage_type: &str) -> Result<StageId, u16> {
        let msg = ConnectStageMsg {
            stage_id,
            stage_type: stage_type.to_string(),
        };
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("stage bind rejected: {}", e);
                return Err(ErrorCode::BadRequest.code());
            }
        };
        let reply = self.request(MSG_CONNECT_STAGE, payload).await;
        if reply.error_code != 0 {
            return Err(reply.error_code);
        }
        self.current_stage.store(reply.stage_id, Ordering::Relaxed);
        Ok(reply.stage_id)
    }

    /// Run the authentication exchange. Must be the first non-system
    /// request on a fresh connection.
    pub async fn authenticate(&self, payload: Vec<u8>) -> Result<Packet, u16> {
        let msg_id = self.cfg.authenticate_message_id.clone();
        let reply = self.request(&msg_id, payload).await;
        if reply.error_code != 0 {
            return Err(reply.error_code);
        }
        self.current_stage.store(reply.stage_id, Ordering::Relaxed);
        Ok(reply)
    }

    /// Send a request and await its single outcome packet.
    pub async fn request(&self, msg_id: &str, payload: Vec<u8>) -> Packet {
        if self.closed.load(Ordering::Relaxed) {
            return Packet::error_reply(msg_id, 0, ErrorCode::Disconnected.code());
        }
        let (tx, rx) = oneshot::channel();
        let timeout = Duration::from_millis(self.cfg.request_timeout_ms);
        let seq = match self.cache.register(msg_id, tx, timeout) {
            Ok(seq) => seq,
            Err(e) => {
                warn!("request table full: {}", e);
                return Packet::error_reply(msg_id, 0, ErrorCode::Overloaded.code());
            }
        };
        let packet = Packet {
            msg_id: msg_id.to_string(),
            msg_seq: seq,
            stage_id: self.current_stage.load(Ordering::Relaxed),
            error_code: 0,
            payload,
        };
        if self.out_tx.send(packet).is_err() {
            self.cache.fail(seq, ErrorCode::Disconnected);
        }
        match rx.await {
            Ok(reply) => reply,
            Err(_) => Packet::error_reply(msg_id, seq, ErrorCode::Disconnected.code()),
        }
    }

    /// Fire-and-forget push to the bound stage.
    pub fn send(&self, msg_id: &str, payload: Vec<u8>) {
        let packet = Packet {
            msg_id: msg_id.to_string(),
            msg_seq: 0,
            stage_id: self.current_stage.load(Ordering::Relaxed),
            error_code: 0,
            payload,
        };
        if self.out_tx.send(packet).is_err() {
            debug!("push {} dropped: connection closed", msg_id);
        }
    }

    /// The next server push (or server-initiated request). `None` once
    /// the connection is gone and the buffer is drained.
    pub async fn recv_push(&mut self) -> Option<Packet> {
        self.push_rx.recv().await
    }

    /// The stage currently bound.
    pub fn current_stage(&self) -> StageId {
        self.current_stage.load(Ordering::Relaxed)
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    /// Close the connection. Idempotent; pending requests fail
    /// `Disconnected`.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.close_signal.notify_waiters();
        self.cache.fail_all(ErrorCode::Disconnected);
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[allow(clippy::too_many_arguments)]
async fn io_loop(
    cfg: ConnectorConfig,
    mut source: transport::FrameSource,
    mut sink: transport::FrameSink,
    mut out_rx: mpsc::UnboundedReceiver<Packet>,
    out_tx: mpsc::UnboundedSender<Packet>,
    push_tx: mpsc::UnboundedSender<Packet>,
    cache: Arc<RequestCache>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
) {
    let heartbeat_interval = Duration::from_millis(cfg.heartbeat_interval_ms);
    let heartbeat_timeout = Duration::from_millis(cfg.heartbeat_timeout_ms);
    let mut ticker = tokio::time::interval((heartbeat_interval / 2).max(Duration::from_millis(250)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_recv = Instant::now();
    let mut last_ping = Instant::now();

    'io: loop {
        // a disconnect between polls must not get lost
        if closed.load(Ordering::Relaxed) {
            break 'io;
        }
        tokio::select! {
            _ = close_signal.notified() => break 'io,
            outgoing = out_rx.recv() => {
                let packet = match outgoing {
                    Some(packet) => packet,
                    None => break 'io,
                };
                let frame = match frame::encode_request(&packet) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping unencodable {}: {}", packet.msg_id, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    warn!("write failed: {}", e);
                    break 'io;
                }
            }
            inbound = source.next() => {
                let body = match inbound {
                    Ok(Some(body)) => body,
                    Ok(None) => break 'io,
                    Err(e) => {
                        warn!("read failed: {}", e);
                        break 'io;
                    }
                };
                last_recv = Instant::now();
                let packet = match frame::decode_response(&body) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("malformed server frame: {}", e);
                        break 'io;
                    }
                };
                if packet.msg_id == MSG_PING {
                    out_tx.send(Packet::new(MSG_PONG, Vec::new())).ok();
                    continue;
                }
                if packet.msg_id == MSG_PONG {
                    continue;
                }
                if (CLIENT_SEQ_LO..=CLIENT_SEQ_HI).contains(&packet.msg_seq) {
                    // a reply to one of our requests; stragglers for swept
                    // sequences are dropped inside the cache
                    cache.complete(packet.msg_seq, packet);
                } else {
                    // a push, or a server-initiated request the user answers
                    push_tx.send(packet).ok();
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                if now.duration_since(last_recv) > heartbeat_timeout {
                    warn!("server heartbeat timed out");
                    break 'io;
                }
                if now.duration_since(last_recv) >= heartbeat_interval
                    && now.duration_since(last_ping) >= heartbeat_interval
                {
                    last_ping = now;
                    out_tx.send(Packet::new(MSG_PING, Vec::new())).ok();
                }
            }
        }
    }

    closed.store(true, Ordering::Relaxed);
    cache.fail_all(ErrorCode::Disconnected);
    sink.close().await;
    debug!("connection closed");
}
