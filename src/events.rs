//! Engine event surface.
//!
//! Broadcasts structured engine activity to registered handlers, and
//! batches UI-bound deltas onto a fixed tick so the front end never sees
//! more than one message per id per tick.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::challenges::ChallengeKind;
use crate::products::CachedProduct;
use crate::tasks::{TaskId, TaskStatus};
use crate::workers::step::ShutdownFlag;

#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProductFoundEvent {
    pub task_id: TaskId,
    pub product: CachedProduct,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub task_id: TaskId,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeRaisedEvent {
    pub task_id: TaskId,
    pub kind: ChallengeKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WorkersRemovedEvent {
    pub task_ids: Vec<TaskId>,
    /// Groups touched by the removal, for view invalidation.
    pub group_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AutomationEvent {
    pub session_id: String,
    /// Groups carrying session tasks, for view invalidation.
    pub group_ids: Vec<String>,
    pub task_ids: Vec<TaskId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Status(StatusEvent),
    ProductFound(ProductFoundEvent),
    Queue(QueueEvent),
    ChallengeRaised(ChallengeRaisedEvent),
    WorkersRemoved(WorkersRemovedEvent),
    AutomationStarted(AutomationEvent),
    AutomationEnded(AutomationEvent),
    SignedOut { timestamp: DateTime<Utc> },
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Status(status) => {
                log::debug!(
                    "task {} -> {} ({:?})",
                    status.task_id,
                    status.status.text,
                    status.status.severity
                );
            }
            EngineEvent::ProductFound(found) => {
                log::info!("task {} found {}", found.task_id, found.product.title);
            }
            EngineEvent::Queue(queue) => {
                let phase = if queue.passed { "passed" } else { "entered" };
                log::info!("task {} {} queue", queue.task_id, phase);
            }
            EngineEvent::ChallengeRaised(raised) => {
                log::info!("task {} blocked by {:?}", raised.task_id, raised.kind);
            }
            EngineEvent::WorkersRemoved(removed) => {
                log::info!("removed {} workers", removed.task_ids.len());
            }
            EngineEvent::AutomationStarted(session) => {
                log::info!(
                    "automation session {} started {} tasks",
                    session.session_id,
                    session.task_ids.len()
                );
            }
            EngineEvent::AutomationEnded(session) => {
                log::info!("automation session {} ended", session.session_id);
            }
            EngineEvent::SignedOut { .. } => {
                log::warn!("signed out; engine locked");
            }
        }
    }
}

/// One tick's worth of coalesced UI deltas.
#[derive(Debug, Default, PartialEq)]
pub struct UiBatch {
    /// Latest status per task id; at most one entry per id.
    pub statuses: Vec<(TaskId, TaskStatus)>,
    /// Group ids whose task lists changed.
    pub invalidated: Vec<String>,
}

/// Front-end delivery seam for batched updates.
pub trait UiSink: Send + Sync {
    fn deliver(&self, batch: UiBatch);
}

#[derive(Default)]
struct PendingUi {
    statuses: HashMap<TaskId, TaskStatus>,
    invalidated: HashSet<String>,
}

/// Coalesces UI-bound deltas and flushes them on a ~12 Hz tick.
#[derive(Default)]
pub struct UiBatcher {
    pending: Mutex<PendingUi>,
}

impl UiBatcher {
    /// ~12 Hz.
    pub const TICK: Duration = Duration::from_millis(83);

    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Record a status delta; a later delta for the same id in the same
    /// tick replaces it.
    pub fn status(&self, task_id: TaskId, status: TaskStatus) {
        self.pending
            .lock()
            .expect("ui batch poisoned")
            .statuses
            .insert(task_id, status);
    }

    pub fn invalidate(&self, group_id: impl Into<String>) {
        self.pending
            .lock()
            .expect("ui batch poisoned")
            .invalidated
            .insert(group_id.into());
    }

    /// Take everything accumulated since the last drain.
    pub fn drain(&self) -> Option<UiBatch> {
        let mut pending = self.pending.lock().expect("ui batch poisoned");
        if pending.statuses.is_empty() && pending.invalidated.is_empty() {
            return None;
        }
        Some(UiBatch {
            statuses: pending.statuses.drain().collect(),
            invalidated: pending.invalidated.drain().collect(),
        })
    }

    /// Run the flush loop until shutdown. At most one delivery per tick.
    pub fn spawn(self: &Arc<Self>, sink: Arc<dyn UiSink>, shutdown: ShutdownFlag) {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Self::TICK);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Some(batch) = batcher.drain() {
                            sink.deliver(batch);
                        }
                    }
                    _ = shutdown.triggered() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Severity;

    struct CountingHandler(Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &EngineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(EngineEvent::WorkersRemoved(WorkersRemovedEvent {
            task_ids: vec!["t1".into()],
            group_ids: vec!["g1".into()],
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn a_tick_carries_one_status_per_id() {
        let batcher = UiBatcher::new();
        batcher.status("t1".into(), TaskStatus::new("carted", Severity::Info));
        batcher.status("t1".into(), TaskStatus::new("checked out", Severity::Success));
        batcher.invalidate("g1");
        batcher.invalidate("g1");

        let batch = batcher.drain().unwrap();
        assert_eq!(batch.statuses.len(), 1);
        assert_eq!(batch.statuses[0].1.text, "checked out");
        assert_eq!(batch.invalidated, vec!["g1".to_string()]);
        assert!(batcher.drain().is_none());
    }

    #[tokio::test]
    async fn flush_loop_delivers_and_stops_on_shutdown() {
        struct Collecting(Mutex<Vec<UiBatch>>);
        impl UiSink for Collecting {
            fn deliver(&self, batch: UiBatch) {
                self.0.lock().unwrap().push(batch);
            }
        }

        let batcher = UiBatcher::new();
        let sink = Arc::new(Collecting(Mutex::new(Vec::new())));
        let shutdown = ShutdownFlag::new();
        batcher.spawn(sink.clone(), shutdown.clone());

        batcher.status("t1".into(), TaskStatus::new("waiting", Severity::Info));
        tokio::time::sleep(UiBatcher::TICK * 3).await;
        shutdown.trigger();

        assert!(!sink.0.lock().unwrap().is_empty());
    }
}
