// SPDX-License-Identifier: Apache-2.0

//! The timer service.
//!
//! Timers never run user code on a timer thread: each firing enqueues a
//! timer item onto the target stage's queue, so the callback executes
//! inside that stage's single-writer loop. Late ticks fire once at the
//! next opportunity; missed periods are not replayed.

use crate::{
    packet::{
        RoutePacket,
        StageTask,
    },
    stage::pool::StageHandle,
    StageId,
    TimerId,
};
use log::debug;
use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicI64,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{
        interval_at,
        Instant,
        MissedTickBehavior,
    },
};

/// Fire forever or a fixed number of times.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Fire every period until cancelled.
    Repeat,
    /// Fire at most this many times.
    Count(u32),
}

struct TimerEntry {
    stage_id: StageId,
    handle: JoinHandle<()>,
}

/// Node-wide timer index. Ids are unique per node.
pub(crate) struct TimerService {
    next_id: AtomicI64,
    timers: Mutex<HashMap<TimerId, TimerEntry>>,
}

impl TimerService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(0),
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Schedule a timer against a stage queue and return its id.
    pub fn add_timer(
        self: &Arc<Self>,
        stage: StageHandle,
        initial_delay: Duration,
        period: Duration,
        kind: TimerKind,
        task: StageTask,
    ) -> TimerId {
        let timer_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stage_id = stage.stage_id;
        if matches!(kind, TimerKind::Count(0)) {
            return timer_id;
        }
        let service: Weak<Self> = Arc::downgrade(self);
        // hold the index lock across the spawn so the task's own cleanup
        // cannot observe the index before its entry lands
        let mut timers = self.timers.lock().unwrap();
        let handle = tokio::spawn(async move {
            // a zero period would make interval_at panic; clamp to 1ms
            let period = period.max(Duration::from_millis(1));
            let mut interval = interval_at(Instant::now() + initial_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut remaining = match kind {
                TimerKind::Repeat => None,
                TimerKind::Count(n) => Some(n),
            };
            loop {
                interval.tick().await;
                if stage
                    .post(RoutePacket::Timer {
                        timer_id,
                        task: task.clone(),
                    })
                    .is_err()
                {
                    debug!("timer {} stops: stage {} is gone", timer_id, stage.stage_id);
                    break;
                }
                if let Some(n) = remaining.as_mut() {
                    *n -= 1;
                    if *n == 0 {
                        break;
                    }
                }
            }
            if let Some(service) = service.upgrade() {
                service.timers.lock().unwrap().remove(&timer_id);
            }
        });
        timers.insert(timer_id, TimerEntry { stage_id, handle });
        timer_id
    }

    /// Cancel one timer. In-flight enqueued firings may still drain.
    pub fn cancel(&self, timer_id: TimerId) -> bool {
        match self.timers.lock().unwrap().remove(&timer_id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer of a stage. Invoked once during stage
    /// destruction.
    pub fn cancel_all_for_stage(&self, stage_id: StageId) {
        let mut timers = self.timers.lock().unwrap();
        let ids: Vec<TimerId> = timers
            .iter()
            .filter(|(_, entry)| entry.stage_id == stage_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(entry) = timers.remove(&id) {
                entry.handle.abort();
            }
        }
    }

    /// Scheduled timers.
    pub fn len(&self) -> usize {
        self.timers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{
        AtomicBool,
        AtomicUsize,
    };
    use tokio::sync::mpsc;

    fn stage_handle(stage_id: StageId) -> (StageHandle, mpsc::Receiver<RoutePacket>) {
        let (tx, rx) = mpsc::channel(64);
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

    fn noop_task() -> StageTask {
        Arc::new(|_stage| Box::pin(async {}))
    }

    #[tokio::test(start_paused = true)]
    async fn count_timer_fires_exactly_count_times() {
        let service = TimerService::new();
        let (handle, mut rx) = stage_handle(1);
        let id = service.add_timer(
            handle,
            Duration::from_millis(50),
            Duration::from_millis(50),
            TimerKind::Count(5),
            noop_task(),
        );
        assert!(id > 0);
        let mut fired = 0;
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(50)).await;
            tokio::task::yield_now().await;
            while let Ok(item) = rx.try_recv() {
                assert!(matches!(item, RoutePacket::Timer { .. }));
                fired += 1;
            }
        }
        assert_eq!(fired, 5);
        // no sixth firing
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(service.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_firings() {
        let service = TimerService::new();
        let (handle, mut rx) = stage_handle(1);
        let id = service.add_timer(
            handle,
            Duration::from_millis(10),
            Duration::from_millis(10),
            TimerKind::Repeat,
            noop_task(),
        );
        tokio::time::advance(Duration::from_millis(25)).await;
        let before = {
            let mut n = 0;
            while rx.try_recv().is_ok() {
                n += 1;
            }
            n
        };
        assert!(before >= 2);
        assert!(service.cancel(id));
        assert!(!service.cancel(id));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn destroying_a_stage_cancels_its_schedule() {
        let service = TimerService::new();
        let (handle_a, mut rx_a) = stage_handle(1);
        let (handle_b, mut rx_b) = stage_handle(2);
        service.add_timer(
            handle_a,
            Duration::from_millis(10),
            Duration::from_millis(10),
            TimerKind::Repeat,
            noop_task(),
        );
        service.add_timer(
            handle_b,
            Duration::from_millis(10),
            Duration::from_millis(10),
            TimerKind::Repeat,
            noop_task(),
        );
        service.cancel_all_for_stage(1);
        assert_eq!(service.len(), 1);
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_task_exits_when_stage_queue_closes() {
        let service = TimerService::new();
        let (handle, mut rx) = stage_handle(1);
        service.add_timer(
            handle,
            Duration::from_millis(10),
            Duration::from_millis(10),
            TimerKind::Repeat,
            noop_task(),
        );
        rx.close();
        while rx.try_recv().is_ok() {}
        tokio::time::advance(Duration::from_millis(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(service.len(), 0);
    }
}
