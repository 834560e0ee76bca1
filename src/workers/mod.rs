//! Worker processes and their shared machinery.
//!
//! A worker is one task's HTTP identity plus one step executor. Monitors
//! poll availability endpoints and feed the product cache; buyers wait on
//! the cache and drive a purchase flow. Everything a worker wants from the
//! outside world travels as a [`WorkerEvent`] through the pool's channel.

pub mod buyer;
pub mod http;
pub mod monitors;
pub mod pool;
pub mod step;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::challenges::ChallengeRequest;
use crate::products::CachedProduct;
use crate::tasks::{Severity, SharedTask, TaskId, TaskStatus};
use crate::workers::http::HttpSession;
use crate::workers::step::ShutdownFlag;

/// Everything a worker reports outward. Events from one worker arrive in
/// emission order; ordering across workers is unspecified.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Status text changed (identical repeats are suppressed at the task).
    Status { task_id: TaskId, status: TaskStatus },
    /// A monitor found a matching, stocked product.
    ProductFound {
        task_id: TaskId,
        product: CachedProduct,
    },
    /// The store put the worker into a third-party queue.
    QueueEntered { task_id: TaskId },
    QueuePassed { task_id: TaskId },
    /// A challenge now blocks the worker.
    ChallengeNeeded {
        task_id: TaskId,
        request: ChallengeRequest,
    },
    /// The worker wants a different proxy from its group.
    RotateProxy { task_id: TaskId },
    /// The worker observed its shutdown flag and is winding down.
    Shutdown { task_id: TaskId },
    /// The workflow reached a terminal state.
    Finished {
        task_id: TaskId,
        error: Option<String>,
    },
}

/// Per-task worker core: shared task handle, HTTP session, proxy lease,
/// shutdown flag, and the event channel into the pool.
pub struct Worker {
    task: SharedTask,
    task_id: TaskId,
    store: String,
    pub session: Arc<HttpSession>,
    pub shutdown: ShutdownFlag,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    pub fn new(
        task: SharedTask,
        session: Arc<HttpSession>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        shutdown: ShutdownFlag,
    ) -> Self {
        let (task_id, store) = {
            let task = task.lock().expect("task poisoned");
            (task.id.clone(), task.store.clone())
        };
        Self {
            task,
            task_id,
            store,
            session,
            shutdown,
            events,
        }
    }

    pub fn task(&self) -> &SharedTask {
        &self.task
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    /// Update the task status and broadcast it, unless it repeats the
    /// previous status verbatim.
    pub fn set_status(&self, text: impl Into<String>, severity: Severity) {
        let status = TaskStatus::new(text, severity);
        let changed = self
            .task
            .lock()
            .map(|mut task| task.set_status(status.clone()))
            .unwrap_or(false);
        if changed {
            self.emit(WorkerEvent::Status {
                task_id: self.task_id.clone(),
                status,
            });
        }
    }

    pub fn product_found(&self, product: CachedProduct) {
        self.emit(WorkerEvent::ProductFound {
            task_id: self.task_id.clone(),
            product,
        });
    }

    pub fn queue_entered(&self) {
        self.emit(WorkerEvent::QueueEntered {
            task_id: self.task_id.clone(),
        });
    }

    pub fn queue_passed(&self) {
        self.emit(WorkerEvent::QueuePassed {
            task_id: self.task_id.clone(),
        });
    }

    pub fn challenge_needed(&self, request: ChallengeRequest) {
        self.emit(WorkerEvent::ChallengeNeeded {
            task_id: self.task_id.clone(),
            request,
        });
    }

    pub fn request_rotation(&self) {
        self.emit(WorkerEvent::RotateProxy {
            task_id: self.task_id.clone(),
        });
    }

    fn emit(&self, event: WorkerEvent) {
        // A closed channel means the pool is gone; nothing to report to.
        let _ = self.events.send(event);
    }
}
