//! Task model shared by the worker pools, the automation trigger, and the
//! persistence collaborator.
//!
//! A task is the unit of monitoring or purchasing work. Worker kind is a
//! tagged union on the task itself rather than a runtime downcast, so the
//! pool can construct the right specialization from data alone.

pub mod proxy;

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::products::CachedProduct;

/// Stable task identifier, unique across groups.
pub type TaskId = String;

/// Severity attached to a user-visible status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Short, severity-tagged status surfaced to the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub text: String,
    pub severity: Severity,
}

impl TaskStatus {
    pub fn new(text: impl Into<String>, severity: Severity) -> Self {
        Self {
            text: text.into(),
            severity,
        }
    }
}

/// Who started the task: a user action or the automation trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartedBy {
    Manual,
    Automation,
}

/// How a monitor task polls its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorMode {
    /// Direct SKU/stock endpoint lookup.
    Sku,
    /// Scan a catalog/search feed for matches.
    Catalog,
    /// Scrape a product page and extract embedded variant JSON.
    Page,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSpec {
    pub mode: MonitorMode,
    /// Endpoint the monitor polls; interpretation depends on `mode`.
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerSpec {
    /// Sizes the buyer accepts; empty means any size.
    pub sizes: Vec<String>,
    /// Checkout endpoint of the target store.
    pub checkout_url: String,
    /// Product snapshot resolved from the cache once fulfilled.
    pub product: Option<CachedProduct>,
}

impl BuyerSpec {
    /// Size-acceptance predicate used by the cache listener.
    pub fn accepts_size(&self, size: &str) -> bool {
        self.sizes.is_empty() || self.sizes.iter().any(|s| s.eq_ignore_ascii_case(size))
    }
}

/// Worker kind, carried on the task as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskSpec {
    Monitor(MonitorSpec),
    Buyer(BuyerSpec),
}

impl TaskSpec {
    pub fn is_monitor(&self) -> bool {
        matches!(self, TaskSpec::Monitor(_))
    }

    pub fn is_buyer(&self) -> bool {
        matches!(self, TaskSpec::Buyer(_))
    }
}

/// A unit of monitoring or purchasing work bound to a store and a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub group_id: String,
    /// Store tag, e.g. `"shopify:kith"` or `"footsite:footlocker"`.
    pub store: String,
    /// Free-text monitor target: URL, identifier, or keyword expression.
    pub monitor: String,
    /// Proxy group this task draws from, if any.
    pub proxy_group: Option<String>,
    pub running: bool,
    pub status: Option<TaskStatus>,
    pub started_by: StartedBy,
    /// Automation session this task belongs to while automation-started.
    pub automation_id: Option<String>,
    pub spec: TaskSpec,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        group_id: impl Into<String>,
        store: impl Into<String>,
        monitor: impl Into<String>,
        spec: TaskSpec,
    ) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            store: store.into(),
            monitor: monitor.into(),
            proxy_group: None,
            running: false,
            status: None,
            started_by: StartedBy::Manual,
            automation_id: None,
            spec,
        }
    }

    pub fn with_proxy_group(mut self, group: impl Into<String>) -> Self {
        self.proxy_group = Some(group.into());
        self
    }

    /// Record a status update, suppressing exact repeats of the previous
    /// status + severity. Returns `true` when the status actually changed.
    pub fn set_status(&mut self, status: TaskStatus) -> bool {
        if self.status.as_ref() == Some(&status) {
            return false;
        }
        self.status = Some(status);
        true
    }

    /// Clear automation bookkeeping when a session ends or the task is
    /// restarted manually.
    pub fn clear_automation(&mut self) {
        self.automation_id = None;
        self.started_by = StartedBy::Manual;
    }
}

/// Shared, mutable handle to a task. All mutation happens behind the lock;
/// nothing holds it across an await point.
pub type SharedTask = Arc<Mutex<Task>>;

pub fn shared(task: Task) -> SharedTask {
    Arc::new(Mutex::new(task))
}

/// A named collection of tasks targeting one store.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    pub id: String,
    pub name: String,
    pub store: String,
    pub tasks: Vec<SharedTask>,
}

impl TaskGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            store: store.into(),
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, task: Task) -> SharedTask {
        let task = shared(task);
        self.tasks.push(task.clone());
        task
    }

    pub fn find(&self, id: &str) -> Option<SharedTask> {
        self.tasks
            .iter()
            .find(|t| t.lock().map(|t| t.id == id).unwrap_or(false))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_task() -> Task {
        Task::new(
            "t1",
            "g1",
            "shopify:kith",
            "nike dunk",
            TaskSpec::Monitor(MonitorSpec {
                mode: MonitorMode::Catalog,
                endpoint: "https://kith.example/products.json".into(),
            }),
        )
    }

    #[test]
    fn status_repeats_are_suppressed() {
        let mut task = monitor_task();
        assert!(task.set_status(TaskStatus::new("Monitoring", Severity::Info)));
        assert!(!task.set_status(TaskStatus::new("Monitoring", Severity::Info)));
        // Same text, different severity still counts as a change.
        assert!(task.set_status(TaskStatus::new("Monitoring", Severity::Warning)));
    }

    #[test]
    fn buyer_size_predicate() {
        let spec = BuyerSpec {
            sizes: vec!["10".into(), "10.5".into()],
            checkout_url: "https://kith.example/checkout".into(),
            product: None,
        };
        assert!(spec.accepts_size("10"));
        assert!(!spec.accepts_size("9"));

        let any = BuyerSpec {
            sizes: Vec::new(),
            checkout_url: String::new(),
            product: None,
        };
        assert!(any.accepts_size("13"));
    }

    #[test]
    fn group_lookup_by_id() {
        let mut group = TaskGroup::new("g1", "Kith", "shopify:kith");
        group.push(monitor_task());
        assert!(group.find("t1").is_some());
        assert!(group.find("missing").is_none());
    }
}
