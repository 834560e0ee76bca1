//! Automation trigger.
//!
//! Watches cache updates and external "automate" requests against keyword
//! rules. A rule activates a task group only when the group yields at least
//! one matching idle monitor and one matching idle buyer; everything it
//! starts shares a session id, and the session's runtime timer force-stops
//! whatever still carries that id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::events::{AutomationEvent, EngineEvent, EventDispatcher};
use crate::products::CachedProduct;
use crate::products::matching::MonitorTarget;
use crate::store::TaskGroupStore;
use crate::tasks::{SharedTask, StartedBy, TaskId};
use crate::workers::pool::WorkerPool;

#[derive(Debug, Clone)]
pub struct AutomationRule {
    pub id: String,
    pub enabled: bool,
    /// How long a session the rule starts may run.
    pub runtime: Duration,
    /// Keyword expression matched against product titles and automate
    /// requests.
    pub terms: String,
}

impl AutomationRule {
    pub fn new(id: impl Into<String>, terms: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            runtime: Duration::from_secs(10 * 60),
            terms: terms.into(),
        }
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_runtime_minutes(self, minutes: u64) -> Self {
        self.with_runtime(Duration::from_secs(minutes * 60))
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Scans groups and starts time-boxed sessions.
pub struct Automation {
    rules: Mutex<Vec<AutomationRule>>,
    store: Arc<dyn TaskGroupStore>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<EventDispatcher>,
    sessions: Mutex<HashSet<String>>,
}

impl Automation {
    pub fn new(
        store: Arc<dyn TaskGroupStore>,
        pool: Arc<WorkerPool>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            store,
            pool,
            dispatcher,
            sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_rule(&self, rule: AutomationRule) {
        self.rules.lock().expect("rule list poisoned").push(rule);
    }

    pub fn rules(&self) -> Vec<AutomationRule> {
        self.rules.lock().expect("rule list poisoned").clone()
    }

    /// Qualifying cache update: the product title is the trigger text.
    pub fn on_product(self: &Arc<Self>, product: &CachedProduct) {
        self.fire(&product.store, &product.title);
    }

    /// External automate request for a store.
    pub fn automate(self: &Arc<Self>, store: &str, text: &str) {
        self.fire(store, text);
    }

    fn fire(self: &Arc<Self>, store: &str, text: &str) {
        let rules: Vec<AutomationRule> = self
            .rules()
            .into_iter()
            .filter(|r| r.enabled && MonitorTarget::parse(&r.terms).matches_text(text))
            .collect();
        if rules.is_empty() {
            return;
        }

        for rule in rules {
            for group in self.store.all() {
                if group.store != store {
                    continue;
                }
                self.activate_group(&rule, &group.id, &group.tasks, text);
            }
        }
    }

    /// Start a session over the group's matching idle tasks, if the group
    /// yields at least one monitor and one buyer.
    fn activate_group(
        self: &Arc<Self>,
        rule: &AutomationRule,
        group_id: &str,
        tasks: &[SharedTask],
        text: &str,
    ) {
        let mut monitors = Vec::new();
        let mut buyers = Vec::new();
        for task in tasks {
            let Ok(guard) = task.lock() else {
                continue;
            };
            if guard.running || self.pool.is_active(&guard.id) {
                continue;
            }
            if !MonitorTarget::parse(&guard.monitor).matches_text(text) {
                continue;
            }
            if guard.spec.is_monitor() {
                monitors.push(task.clone());
            } else {
                buyers.push(task.clone());
            }
        }
        if monitors.is_empty() || buyers.is_empty() {
            return;
        }

        let session_id = format!("auto-{:08x}", rand::random::<u32>());
        let selected: Vec<SharedTask> = monitors.into_iter().chain(buyers).collect();
        let mut task_ids = Vec::new();
        for task in &selected {
            if let Ok(mut guard) = task.lock() {
                guard.started_by = StartedBy::Automation;
                guard.automation_id = Some(session_id.clone());
                task_ids.push(guard.id.clone());
            }
        }

        match self.pool.submit(selected) {
            Ok(started) => {
                log::info!(
                    "automation rule {} started {started} tasks (session {session_id})",
                    rule.id
                );
            }
            Err(err) => {
                log::warn!("automation rule {} could not submit: {err}", rule.id);
                return;
            }
        }

        self.sessions
            .lock()
            .expect("session set poisoned")
            .insert(session_id.clone());
        self.dispatcher
            .dispatch(EngineEvent::AutomationStarted(AutomationEvent {
                session_id: session_id.clone(),
                group_ids: vec![group_id.to_string()],
                task_ids,
                timestamp: Utc::now(),
            }));

        let automation = Arc::clone(self);
        let runtime = rule.runtime;
        tokio::spawn(async move {
            tokio::time::sleep(runtime).await;
            automation.end_session(&session_id);
        });
    }

    /// Force-stop whatever still carries the session id. Guarded so a
    /// session ends at most once.
    pub fn end_session(&self, session_id: &str) {
        if !self
            .sessions
            .lock()
            .expect("session set poisoned")
            .remove(session_id)
        {
            return;
        }

        let mut stale: Vec<TaskId> = Vec::new();
        let mut group_ids: Vec<String> = Vec::new();
        for group in self.store.all() {
            for task in &group.tasks {
                if let Ok(guard) = task.lock()
                    && guard.automation_id.as_deref() == Some(session_id)
                {
                    stale.push(guard.id.clone());
                    if !group_ids.contains(&group.id) {
                        group_ids.push(group.id.clone());
                    }
                }
            }
        }

        let stopped = self.pool.stop(&stale);
        // Tasks whose worker already ended still need their bookkeeping
        // cleared.
        for group in self.store.all() {
            for task in &group.tasks {
                if let Ok(mut guard) = task.lock()
                    && guard.automation_id.as_deref() == Some(session_id)
                {
                    guard.running = false;
                    guard.clear_automation();
                }
            }
        }

        self.dispatcher
            .dispatch(EngineEvent::AutomationEnded(AutomationEvent {
                session_id: session_id.to_string(),
                group_ids,
                task_ids: stopped,
                timestamp: Utc::now(),
            }));
    }
}
