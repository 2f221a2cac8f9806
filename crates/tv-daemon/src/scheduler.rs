//! Cancellable periodic tasks, keyed by (session, purpose).
//!
//! Each task is a spawned interval loop that sends a pre-built `CoreEvent`
//! into the state machine's event channel every tick.  Tasks never mutate
//! state themselves — all mutation happens in the core's single event loop,
//! which drops ticks tagged with a stale session.  Together with the alive
//! flag checked at the top of every tick, that makes `cancel_all` total: once
//! it returns, no tick from the cancelled session will ever act.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::core::CoreEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    PersistProgress,
    NearEndCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub session: u64,
    pub kind: TaskKind,
}

struct ScheduledTask {
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct PollingScheduler {
    tasks: HashMap<TaskKey, ScheduledTask>,
}

impl PollingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a recurring task.  Re-scheduling an existing key replaces the
    /// old task, so there is at most one task per key.  The first tick fires
    /// one full period after scheduling.
    pub fn schedule(
        &mut self,
        key: TaskKey,
        period: Duration,
        tx: mpsc::Sender<CoreEvent>,
        event: CoreEvent,
    ) {
        self.cancel(key);

        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval's first tick completes immediately; swallow it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(event.clone()).await.is_err() {
                    break;
                }
            }
        });

        self.tasks.insert(key, ScheduledTask { alive, handle });
    }

    pub fn is_scheduled(&self, key: TaskKey) -> bool {
        self.tasks.contains_key(&key)
    }

    pub fn cancel(&mut self, key: TaskKey) {
        if let Some(task) = self.tasks.remove(&key) {
            task.alive.store(false, Ordering::SeqCst);
            task.handle.abort();
            debug!("scheduler: cancelled {:?}", key);
        }
    }

    /// Cancels every task belonging to a session.  Synchronous: the alive
    /// flags are cleared before this returns, so a tick that already passed
    /// the interval wait still bails out without sending.
    pub fn cancel_all(&mut self, session: u64) {
        let keys: Vec<TaskKey> = self
            .tasks
            .keys()
            .filter(|k| k.session == session)
            .copied()
            .collect();
        for key in keys {
            self.cancel(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(session: u64, kind: TaskKind) -> TaskKey {
        TaskKey { session, kind }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_sends_event_each_period() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut scheduler = PollingScheduler::new();
        scheduler.schedule(
            key(1, TaskKind::PersistProgress),
            Duration::from_millis(100),
            tx,
            CoreEvent::ProgressTick { session: 1 },
        );

        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            assert!(matches!(event, CoreEvent::ProgressTick { session: 1 }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_session_tasks() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut scheduler = PollingScheduler::new();
        scheduler.schedule(
            key(1, TaskKind::PersistProgress),
            Duration::from_millis(100),
            tx.clone(),
            CoreEvent::ProgressTick { session: 1 },
        );
        scheduler.schedule(
            key(1, TaskKind::NearEndCheck),
            Duration::from_millis(100),
            tx.clone(),
            CoreEvent::NearEndTick { session: 1 },
        );
        scheduler.schedule(
            key(2, TaskKind::PersistProgress),
            Duration::from_millis(100),
            tx,
            CoreEvent::ProgressTick { session: 2 },
        );

        scheduler.cancel_all(1);
        assert!(!scheduler.is_scheduled(key(1, TaskKind::PersistProgress)));
        assert!(!scheduler.is_scheduled(key(1, TaskKind::NearEndCheck)));
        assert!(scheduler.is_scheduled(key(2, TaskKind::PersistProgress)));

        // Only session 2 ticks keep arriving.
        for _ in 0..4 {
            match rx.recv().await.unwrap() {
                CoreEvent::ProgressTick { session } => assert_eq!(session, 2),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_task() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut scheduler = PollingScheduler::new();
        let k = key(1, TaskKind::NearEndCheck);
        scheduler.schedule(
            k,
            Duration::from_millis(100),
            tx.clone(),
            CoreEvent::NearEndTick { session: 1 },
        );
        scheduler.schedule(
            k,
            Duration::from_millis(100),
            tx,
            CoreEvent::NearEndTick { session: 1 },
        );
        assert_eq!(scheduler.tasks.len(), 1);

        // One event per period, not two — the first task is gone.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, CoreEvent::NearEndTick { session: 1 }));
        let wait = tokio::time::timeout(Duration::from_millis(90), rx.recv()).await;
        assert!(wait.is_err(), "replaced task must not tick");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_after_cancel() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut scheduler = PollingScheduler::new();
        let k = key(9, TaskKind::PersistProgress);
        scheduler.schedule(
            k,
            Duration::from_millis(50),
            tx,
            CoreEvent::ProgressTick { session: 9 },
        );
        rx.recv().await.unwrap();
        scheduler.cancel(k);

        let wait = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(wait, Ok(None) | Err(_)), "cancelled task ticked");
    }
}
