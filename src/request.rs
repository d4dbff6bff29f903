// SPDX-License-Identifier: Apache-2.0

//! The pending-reply table correlating requests with their replies.
//!
//! Every request/reply exchange — client→server, server→client, and S2S —
//! registers a resolver here under a fresh sequence number and is resolved
//! exactly once: by the matching reply, by an explicit failure, or by the
//! deadline sweeper. Failures and timeouts surface as synthesized reply
//! packets carrying the error code, so a caller always receives exactly one
//! outcome packet.

use crate::{
    error::ErrorCode,
    packet::Packet,
};
use log::warn;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    time::Instant,
};

/// Sequence numbers cycle inside the cache's configured range and never use
/// 0, which marks push packets.
pub const SEQ_MIN: u16 = 1;
/// Upper bound of the full sequence range.
pub const SEQ_MAX: u16 = u16::MAX;

/// Registration failure.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// Every sequence in the range is outstanding.
    #[error("request table is full ({0} outstanding)")]
    Full(usize),
}

struct PendingRequest {
    msg_id: String,
    resolver: oneshot::Sender<Packet>,
    deadline: Instant,
}

struct CacheInner {
    next_seq: u16,
    pending: HashMap<u16, PendingRequest>,
}

/// Thread-safe pending-reply table with a bounded sequence range.
pub struct RequestCache {
    lo: u16,
    hi: u16,
    inner: Mutex<CacheInner>,
}

impl RequestCache {
    /// A cache over the full `[1, 65535]` range.
    pub fn new() -> Self {
        Self::with_range(SEQ_MIN, SEQ_MAX)
    }

    /// A cache cycling inside `[lo, hi]`. Both bounds must be non-zero.
    pub fn with_range(lo: u16, hi: u16) -> Self {
        assert!(lo >= SEQ_MIN && lo <= hi);
        Self {
            lo,
            hi,
            inner: Mutex::new(CacheInner {
                next_seq: lo,
                pending: HashMap::new(),
            }),
        }
    }

    /// Register a resolver and return its fresh sequence number. Refuses
    /// when every sequence in the range is outstanding.
    pub fn register(&self, msg_id: &str, resolver: oneshot::Sender<Packet>, timeout: Duration) -> Result<u16, RegisterError> {
        let mut inner = self.inner.lock().unwrap();
        let span = (self.hi - self.lo) as usize + 1;
        if inner.pending.len() >= span {
            return Err(RegisterError::Full(inner.pending.len()));
        }
        // cycle past outstanding sequences; bounded by the fullness check
        let mut seq = inner.next_seq;
        while inner.pending.contains_key(&seq) {
            seq = if seq == self.hi { self.lo } else { seq + 1 };
        }
        inner.next_seq = if seq == self.hi { self.lo } else { seq + 1 };
        inner.pending.insert(
            seq,
            PendingRequest {
                msg_id: msg_id.to_string(),
                resolver,
                deadline: Instant::now() + timeout,
            },
        );
        Ok(seq)
    }

    /// Whether a sequence is outstanding.
    pub fn is_pending(&self, seq: u16) -> bool {
        self.inner.lock().unwrap().pending.contains_key(&seq)
    }

    /// Resolve a pending sequence with its reply. Returns `false` when the
    /// sequence is unknown — e.g. a reply arriving after its deadline fired.
    pub fn complete(&self, seq: u16, reply: Packet) -> bool {
        let entry = self.inner.lock().unwrap().pending.remove(&seq);
        match entry {
            Some(pending) => {
                pending.resolver.send(reply).ok();
                true
            }
            None => {
                warn!("dropping reply {} for unknown seq {}", reply.msg_id, seq);
                false
            }
        }
    }

    /// Resolve a pending sequence with an error code.
    pub fn fail(&self, seq: u16, error_code: ErrorCode) -> bool {
        let entry = self.inner.lock().unwrap().pending.remove(&seq);
        match entry {
            Some(pending) => {
                pending
                    .resolver
                    .send(Packet::error_reply(pending.msg_id, seq, error_code.code()))
                    .ok();
                true
            }
            None => false,
        }
    }

    /// Resolve every pending sequence with an error code. Used when the
    /// owning session or link goes away.
    pub fn fail_all(&self, error_code: ErrorCode) {
        let drained: Vec<(u16, PendingRequest)> = self.inner.lock().unwrap().pending.drain().collect();
        for (seq, pending) in drained {
            pending
                .resolver
                .send(Packet::error_reply(pending.msg_id, seq, error_code.code()))
                .ok();
        }
    }

    /// Resolve entries past their deadline with `Timeout`. Returns how many
    /// entries fired.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(u16, PendingRequest)> = {
            let mut inner = self.inner.lock().unwrap();
            let seqs: Vec<u16> = inner
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();
            seqs.into_iter()
                .filter_map(|seq| inner.pending.remove(&seq).map(|p| (seq, p)))
                .collect()
        };
        let count = expired.len();
        for (seq, pending) in expired {
            pending
                .resolver
                .send(Packet::error_reply(pending.msg_id, seq, ErrorCode::Timeout.code()))
                .ok();
        }
        count
    }

    /// Outstanding entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the deadline sweeper for a shared cache. The task holds a weak
    /// reference and exits when the cache is dropped.
    pub fn spawn_sweeper(cache: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep(Instant::now());
                    }
                    None => break,
                }
            }
        });
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let cache = RequestCache::new();
        let (tx, rx) = oneshot::channel();
        let seq = cache.register("Echo", tx, Duration::from_secs(5)).unwrap();
        assert!(cache.is_pending(seq));
        assert!(cache.complete(seq, Packet::new("EchoReply", b"ok".to_vec()).with_seq(seq)));
        // second resolution attempts are no-ops
        assert!(!cache.complete(seq, Packet::new("EchoReply", Vec::new())));
        assert!(!cache.fail(seq, ErrorCode::Timeout));
        let reply = rx.await.unwrap();
        assert_eq!(reply.msg_id, "EchoReply");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failure_synthesizes_an_error_reply() {
        let cache = RequestCache::new();
        let (tx, rx) = oneshot::channel();
        let seq = cache.register("GetState", tx, Duration::from_secs(5)).unwrap();
        assert!(cache.fail(seq, ErrorCode::NodeUnreachable));
        let reply = rx.await.unwrap();
        assert_eq!(reply.error_code, ErrorCode::NodeUnreachable.code());
        assert_eq!(reply.msg_id, "GetState");
        assert_eq!(reply.msg_seq, seq);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_fires_timeouts_exactly_once() {
        let cache = RequestCache::new();
        let (tx, rx) = oneshot::channel();
        let seq = cache.register("Slow", tx, Duration::from_millis(200)).unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cache.sweep(Instant::now()), 0);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.sweep(Instant::now()), 1);
        assert_eq!(cache.sweep(Instant::now()), 0);
        let reply = rx.await.unwrap();
        assert_eq!(reply.error_code, ErrorCode::Timeout.code());
        // a straggler reply for the swept sequence is dropped
        assert!(!cache.complete(seq, Packet::new("Slow", Vec::new())));
    }

    #[tokio::test]
    async fn sequences_skip_zero_and_cycle() {
        let cache = RequestCache::with_range(1, 3);
        let mut keep = Vec::new();
        for expected in [1u16, 2, 3] {
            let (tx, _rx) = oneshot::channel();
            keep.push(_rx);
            assert_eq!(cache.register("m", tx, Duration::from_secs(1)).unwrap(), expected);
        }
        // full table refuses registration
        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            cache.register("m", tx, Duration::from_secs(1)),
            Err(RegisterError::Full(3))
        ));
        // freeing one slot lets the cursor wrap back around to it
        cache.fail(2, ErrorCode::Disconnected);
        let (tx, _rx2) = oneshot::channel();
        assert_eq!(cache.register("m", tx, Duration::from_secs(1)).unwrap(), 2);
    }

    #[tokio::test]
    async fn fail_all_drains_everything() {
        let cache = RequestCache::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = oneshot::channel();
            cache.register("m", tx, Duration::from_secs(5)).unwrap();
            receivers.push(rx);
        }
        cache.fail_all(ErrorCode::Disconnected);
        assert!(cache.is_empty());
        for rx in receivers {
            assert_eq!(rx.await.unwrap().error_code, ErrorCode::Disconnected.code());
        }
    }
}
