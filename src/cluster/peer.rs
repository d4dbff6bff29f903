// SPDX-License-Identifier: Apache-2.0

//! One outbound link to a peer node.
//!
//! Each direction of a node pair is an independent pipe: this link only
//! writes; inbound envelopes arrive through the S2S listener. The writer
//! reconnects with exponential backoff. Delivery is at-most-once — on
//! connection loss the pending table fails `NodeUnreachable` and queued
//! envelopes are discarded, never retried.

use super::LinkSettings;
use crate::{
    error::ErrorCode,
    packet::envelope::{
        Envelope,
        EnvelopeKind,
    },
    request::RequestCache,
    server::Runtime,
    NodeId,
};
use log::{
    debug,
    info,
    warn,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicU8,
            Ordering,
        },
        Arc,
        Weak,
    },
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
};

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DOWN: u8 = 2;

/// Posting side of one peer link, with its pending-reply table.
pub(crate) struct PeerLink {
    pub node_id: NodeId,
    pub cache: Arc<RequestCache>,
    state: Arc<AtomicU8>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PeerLink {
    /// The link a node keeps to itself: envelopes short-circuit back into
    /// the local dispatcher without touching a socket.
    pub fn loopback(node_id: NodeId, runtime: Weak<Runtime>, settings: &LinkSettings) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let cache = Arc::new(RequestCache::new());
        RequestCache::spawn_sweeper(&cache, settings.sweep_period);
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                match runtime.upgrade() {
                    Some(rt) => rt.dispatch_envelope(env),
                    None => break,
                }
            }
        });
        Arc::new(Self {
            node_id,
            cache,
            state: Arc::new(AtomicU8::new(STATE_CONNECTED)),
            tx,
        })
    }

    /// A link to a remote peer, connecting lazily and reconnecting with
    /// backoff.
    pub fn remote(node_id: NodeId, address: SocketAddr, settings: LinkSettings) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        let cache = Arc::new(RequestCache::new());
        RequestCache::spawn_sweeper(&cache, settings.sweep_period);
        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        tokio::spawn(write_loop(
            node_id.clone(),
            address,
            settings,
            cache.clone(),
            state.clone(),
            rx,
        ));
        Arc::new(Self {
            node_id,
            cache,
            state,
            tx,
        })
    }

    /// Queue an envelope for delivery. Fails fast while the link is down,
    /// handing the envelope back.
    pub fn send(&self, env: Envelope) -> Result<(), Envelope> {
        if self.state.load(Ordering::Relaxed) == STATE_DOWN {
            return Err(env);
        }
        self.tx.send(env).map_err(|e| e.0)
    }

    /// Whether the link is usable (connected or still on its first
    /// connection attempt).
    pub fn healthy(&self) -> bool {
        self.state.load(Ordering::Relaxed) != STATE_DOWN
    }
}

async fn write_loop(
    node_id: NodeId,
    address: SocketAddr,
    settings: LinkSettings,
    cache: Arc<RequestCache>,
    state: Arc<AtomicU8>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut backoff = settings.backoff_floor;
    loop {
        state.store(STATE_CONNECTING, Ordering::Relaxed);
        match TcpStream::connect(address).await {
            Ok(mut stream) => {
                stream.set_nodelay(true).ok();
                state.store(STATE_CONNECTED, Ordering::Relaxed);
                backoff = settings.backoff_floor;
                info!("link to {} at {} is up", node_id, address);
                loop {
                    match rx.recv().await {
                        Some(env) => match env.encode(settings.compression_threshold) {
                            Ok(frame) => {
                                if let Err(e) = stream.write_all(&frame).await {
                                    warn!("link to {} broke: {}", node_id, e);
                                    break;
                                }
                            }
                            Err(e) => warn!("dropping unencodable envelope for {}: {}", node_id, e),
                        },
                        // every sender dropped: the link is being torn down
                        None => return,
                    }
                }
            }
            Err(e) => debug!("connect to {} at {} failed: {}", node_id, address, e),
        }
        state.store(STATE_DOWN, Ordering::Relaxed);
        cache.fail_all(ErrorCode::NodeUnreachable);
        // at-most-once: discard what was queued behind the broken pipe
        while let Ok(env) = rx.try_recv() {
            if env.kind == EnvelopeKind::Request && env.packet.msg_seq > 0 {
                cache.fail(env.packet.msg_seq, ErrorCode::NodeUnreachable);
            } else {
                debug!("dropping queued {} for {}", env.packet.msg_id, node_id);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(settings.backoff_ceiling);
    }
}
