// SPDX-License-Identifier: Apache-2.0

//! The S2S listener: accepts peer connections and feeds decoded envelopes
//! into the local dispatcher.

use crate::{
    packet::{
        envelope::Envelope,
        frame::FrameAccumulator,
    },
    server::Runtime,
};
use log::{
    debug,
    info,
    warn,
};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::AsyncReadExt,
    net::{
        TcpListener,
        TcpStream,
    },
};

/// Accept loop for the S2S endpoint. Runs until the listener task is
/// aborted at shutdown.
pub(crate) async fn run_s2s_listener(runtime: Arc<Runtime>, listener: TcpListener) {
    info!(
        "{} accepting peer links on {}",
        runtime.node_id,
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tokio::spawn(read_envelopes(runtime.clone(), stream, peer_addr));
            }
            Err(e) => {
                warn!("s2s accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_envelopes(runtime: Arc<Runtime>, mut stream: TcpStream, peer_addr: SocketAddr) {
    stream.set_nodelay(true).ok();
    let mut acc = FrameAccumulator::new(runtime.cfg.max_packet_size as usize);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("peer link from {} broke: {}", peer_addr, e);
                break;
            }
        };
        acc.extend(&buf[..n]);
        loop {
            match acc.next() {
                Ok(Some(body)) => match Envelope::decode(&body) {
                    Ok(env) => runtime.dispatch_envelope(env),
                    Err(e) => {
                        warn!("malformed envelope from {}: {}", peer_addr, e);
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("closing peer link from {}: {}", peer_addr, e);
                    return;
                }
            }
        }
    }
    debug!("peer link from {} closed", peer_addr);
}
