// SPDX-License-Identifier: Apache-2.0

//! The process-wide stage pool: live stage handles, id issuance, and the
//! per-type factories that construct user stages.

use crate::{
    error::{
        ErrorCode,
        PostError,
    },
    packet::{
        Packet,
        RoutePacket,
    },
    server::Runtime,
    StageId,
};
use futures::future::BoxFuture;
use log::warn;
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicI64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        RwLock,
    },
};
use tokio::sync::mpsc;

/// Spawns a user stage of one registered type: builds the instance, runs
/// its creation gate, and on success starts the stage loop.
pub(crate) type StageFactory =
    Arc<dyn Fn(Arc<Runtime>, StageId, String, Packet) -> BoxFuture<'static, Result<StageHandle, u16>> + Send + Sync>;

/// Posting handle onto one live stage's queue, plus its statistics gauges.
#[derive(Clone)]
pub(crate) struct StageHandle {
    pub stage_id: StageId,
    pub stage_type: String,
    pub(crate) tx: mpsc::Sender<RoutePacket>,
    pub(crate) depth: Arc<AtomicUsize>,
    pub(crate) draining: Arc<AtomicBool>,
}

impl StageHandle {
    /// Enqueue an item. Fails `Overloaded` at capacity and `Closed` once
    /// the stage is destroyed.
    pub fn post(&self, packet: RoutePacket) -> Result<(), PostError> {
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PostError::Overloaded(self.stage_id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PostError::Closed(self.stage_id)),
        }
    }

    /// Items currently queued.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether the loop is currently dispatching an item.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }
}

/// Point-in-time statistics for one stage.
#[derive(Clone, Debug)]
pub struct StageStats {
    /// The stage's id.
    pub stage_id: StageId,
    /// The registered type it was created from.
    pub stage_type: String,
    /// Items waiting in the queue.
    pub queue_depth: usize,
    /// Whether the loop is currently dispatching.
    pub draining: bool,
}

/// Live stages and type factories of one node.
pub(crate) struct StagePool {
    stages: RwLock<HashMap<StageId, StageHandle>>,
    creating: Mutex<HashSet<StageId>>,
    factories: RwLock<HashMap<String, StageFactory>>,
    next_stage_id: AtomicI64,
}

impl StagePool {
    pub fn new() -> Self {
        Self {
            stages: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashSet::new()),
            factories: RwLock::new(HashMap::new()),
            next_stage_id: AtomicI64::new(0),
        }
    }

    /// Register the factory for one stage type. Bootstrap-time only.
    pub fn register_factory(&self, stage_type: &str, factory: StageFactory) {
        self.factories.write().unwrap().insert(stage_type.to_string(), factory);
    }

    pub fn get(&self, stage_id: StageId) -> Option<StageHandle> {
        self.stages.read().unwrap().get(&stage_id).cloned()
    }

    pub fn remove(&self, stage_id: StageId) -> Option<StageHandle> {
        self.stages.write().unwrap().remove(&stage_id)
    }

    pub fn len(&self) -> usize {
        self.stages.read().unwrap().len()
    }

    /// Snapshot every live stage's gauges.
    pub fn stats(&self) -> Vec<StageStats> {
        self.stages
            .read()
            .unwrap()
            .values()
            .map(|handle| StageStats {
                stage_id: handle.stage_id,
                stage_type: handle.stage_type.clone(),
                queue_depth: handle.queue_depth(),
                draining: handle.is_draining(),
            })
            .collect()
    }

    /// Snapshot every live stage handle, for shutdown fan-out.
    pub fn handles(&self) -> Vec<StageHandle> {
        self.stages.read().unwrap().values().cloned().collect()
    }

    /// Create a stage of a registered type, honoring a caller-chosen id.
    ///
    /// An existing stage under the desired id is returned as-is when its
    /// type matches (`WrongStageType` otherwise). On success the stage is
    /// live in the pool and its `on_post_create` is queued.
    pub async fn create_stage(
        &self,
        runtime: &Arc<Runtime>,
        stage_type: &str,
        desired: Option<StageId>,
        packet: Packet,
    ) -> Result<StageId, u16> {
        let factory = self
            .factories
            .read()
            .unwrap()
            .get(stage_type)
            .cloned()
            .ok_or_else(|| {
                warn!("no stage factory registered for type {:?}", stage_type);
                ErrorCode::BadRequest.code()
            })?;

        let stage_id = {
            let mut creating = self.creating.lock().unwrap();
            match desired {
                Some(id) if id != 0 => {
                    if let Some(existing) = self.get(id) {
                        return if existing.stage_type == stage_type {
                            Ok(id)
                        } else {
                            Err(ErrorCode::WrongStageType.code())
                        };
                    }
                    if !creating.insert(id) {
                        warn!("stage {} is already being created", id);
                        return Err(ErrorCode::BadRequest.code());
                    }
                    // keep generated ids ahead of caller-chosen ones
                    self.next_stage_id.fetch_max(id, Ordering::Relaxed);
                    id
                }
                _ => {
                    let id = self.next_stage_id.fetch_add(1, Ordering::Relaxed) + 1;
                    creating.insert(id);
                    id
                }
            }
        };

        let result = (*factory)(runtime.clone(), stage_id, stage_type.to_string(), packet).await;
        match result {
            Ok(handle) => {
                handle.post(RoutePacket::PostCreate).ok();
                // land in the pool before releasing the creation guard, so
                // a concurrent create of the same id sees one or the other
                self.stages.write().unwrap().insert(stage_id, handle);
                self.creating.lock().unwrap().remove(&stage_id);
                Ok(stage_id)
            }
            Err(code) => {
                self.creating.lock().unwrap().remove(&stage_id);
                Err(code)
            }
        }
    }

    /// Post the destroy item to a stage. The loop removes itself from the
    /// pool, cancels its timers, and runs the destroy hooks.
    pub fn destroy_stage(&self, stage_id: StageId) -> bool {
        match self.get(stage_id) {
            Some(handle) => handle.post(RoutePacket::Close).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(stage_id: StageId, capacity: usize) -> (StageHandle, mpsc::Receiver<RoutePacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            StageHandle {
                stage_id,
                stage_type: "room".to_string(),
                tx,
                depth: Arc::new(AtomicUsize::new(0)),
                draining: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn post_reports_overload_and_closure() {
        let (h, mut rx) = handle(1, 1);
        assert!(h.post(RoutePacket::PostCreate).is_ok());
        assert!(matches!(h.post(RoutePacket::Close), Err(PostError::Overloaded(1))));
        assert_eq!(h.queue_depth(), 1);
        rx.close();
        while rx.try_recv().is_ok() {}
        assert!(matches!(h.post(RoutePacket::Close), Err(PostError::Closed(1))));
    }

    #[tokio::test]
    async fn pool_tracks_handles_and_stats() {
        let pool = StagePool::new();
        let (h, _rx) = handle(5, 4);
        pool.stages.write().unwrap().insert(5, h);
        assert!(pool.get(5).is_some());
        let stats = pool.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].stage_id, 5);
        assert!(!stats[0].draining);
        assert!(pool.remove(5).is_some());
        assert!(pool.get(5).is_none());
    }
}
