//! Worker pool.
//!
//! Owns the active worker set for both kinds. Submission picks a proxy
//! (preferring one not already in use), builds the specialized worker, and
//! starts its executor; a run that ends unexpectedly is resubmitted once
//! unless the task was removed in the meantime. A boolean lock gates all
//! submissions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::challenges::router::ChallengeRouter;
use crate::events::{EngineEvent, EventDispatcher, WorkersRemovedEvent};
use crate::products::ProductCache;
use crate::products::matching::MonitorTarget;
use crate::store::ProxyStore;
use crate::tasks::proxy::ProxyLease;
use crate::tasks::{SharedTask, TaskId, TaskSpec};
use crate::workers::buyer::{BuyerWorker, buyer_graph};
use crate::workers::http::HttpSession;
use crate::workers::monitors::{MonitorWorker, monitor_graph};
use crate::workers::step::{RunEnd, ShutdownFlag, StepExecutor, StepGraphError};
use crate::workers::{Worker, WorkerEvent};

const DEFAULT_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is locked")]
    Locked,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_AGENT.to_string(),
        }
    }
}

struct ActiveEntry {
    task: SharedTask,
    session: Arc<HttpSession>,
    shutdown: ShutdownFlag,
    lease: Mutex<Option<ProxyLease>>,
    removed: AtomicBool,
    /// Set on the entry created by a self-heal resubmission; a second
    /// fault is terminal.
    resubmitted: bool,
}

/// The active worker set.
pub struct WorkerPool {
    config: PoolConfig,
    cache: Arc<ProductCache>,
    router: Arc<ChallengeRouter>,
    proxies: Arc<dyn ProxyStore>,
    dispatcher: Arc<EventDispatcher>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    locked: AtomicBool,
    active: Mutex<HashMap<TaskId, Arc<ActiveEntry>>>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        cache: Arc<ProductCache>,
        router: Arc<ChallengeRouter>,
        proxies: Arc<dyn ProxyStore>,
        dispatcher: Arc<EventDispatcher>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            config,
            cache,
            router,
            proxies,
            dispatcher,
            events,
            locked: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Gate or ungate submissions.
    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.active.lock().expect("active set poisoned").len()
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active
            .lock()
            .expect("active set poisoned")
            .contains_key(task_id)
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        self.active
            .lock()
            .expect("active set poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Start workers for the given tasks. Tasks already active are left
    /// alone. Returns how many actually started.
    pub fn submit(self: &Arc<Self>, tasks: Vec<SharedTask>) -> Result<usize, PoolError> {
        if self.is_locked() {
            return Err(PoolError::Locked);
        }
        let mut started = 0;
        for task in tasks {
            if self.spawn_worker(task, false) {
                started += 1;
            }
        }
        Ok(started)
    }

    fn spawn_worker(self: &Arc<Self>, task: SharedTask, resubmitted: bool) -> bool {
        let (task_id, monitor, proxy_group, spec) = {
            let Ok(guard) = task.lock() else {
                return false;
            };
            (
                guard.id.clone(),
                guard.monitor.clone(),
                guard.proxy_group.clone(),
                guard.spec.clone(),
            )
        };

        let session = Arc::new(HttpSession::new(&self.config.user_agent));
        let lease = proxy_group
            .as_deref()
            .and_then(|g| self.proxies.group(g))
            .and_then(|g| g.pick())
            .map(ProxyLease::new);
        session.set_proxy(lease.as_ref().map(|l| l.endpoint().to_string()));

        let shutdown = ShutdownFlag::new();
        let entry = Arc::new(ActiveEntry {
            task: task.clone(),
            session: session.clone(),
            shutdown: shutdown.clone(),
            lease: Mutex::new(lease),
            removed: AtomicBool::new(false),
            resubmitted,
        });

        {
            let mut active = self.active.lock().expect("active set poisoned");
            if active.contains_key(&task_id) {
                return false;
            }
            active.insert(task_id.clone(), entry);
        }
        if let Ok(mut guard) = task.lock() {
            guard.running = true;
        }

        let worker = Worker::new(task, session, self.events.clone(), shutdown.clone());
        let target = MonitorTarget::parse(&monitor);
        let pool = Arc::clone(self);

        match spec {
            TaskSpec::Monitor(spec) => {
                let graph = monitor_graph(spec.mode);
                let mut state =
                    MonitorWorker::new(worker, target, spec.endpoint, self.cache.clone());
                tokio::spawn(async move {
                    let executor = StepExecutor::new(graph, shutdown);
                    let end = executor.run(&mut state).await;
                    pool.worker_finished(task_id, end);
                });
            }
            TaskSpec::Buyer(spec) => {
                let graph = buyer_graph();
                let mut state = BuyerWorker::new(
                    worker,
                    target,
                    spec,
                    self.cache.clone(),
                    self.router.clone(),
                );
                tokio::spawn(async move {
                    let executor = StepExecutor::new(graph, shutdown);
                    let end = executor.run(&mut state).await;
                    pool.worker_finished(task_id, end);
                });
            }
        }
        true
    }

    fn worker_finished(self: &Arc<Self>, task_id: TaskId, end: Result<RunEnd, StepGraphError>) {
        let entry = self
            .active
            .lock()
            .expect("active set poisoned")
            .remove(&task_id);
        let Some(entry) = entry else {
            // Removed while the run unwound; bookkeeping already done.
            return;
        };
        if let Ok(mut task) = entry.task.lock() {
            task.running = false;
        }

        match end {
            Ok(RunEnd::Completed) => self.finished(task_id, None),
            Ok(RunEnd::Failed(message)) => self.finished(task_id, Some(message)),
            Ok(RunEnd::Shutdown) => {
                let _ = self.events.send(WorkerEvent::Shutdown { task_id });
            }
            Ok(RunEnd::Faulted(fault)) => {
                if !entry.removed.load(Ordering::SeqCst) && !entry.resubmitted {
                    log::warn!("worker {task_id} ended unexpectedly; resubmitting once");
                    self.spawn_worker(entry.task.clone(), true);
                } else {
                    self.finished(task_id, Some(fault.to_string()));
                }
            }
            Err(err) => {
                log::error!("worker {task_id} aborted: {err}");
                self.finished(task_id, Some(err.to_string()));
            }
        }
    }

    fn finished(&self, task_id: TaskId, error: Option<String>) {
        let _ = self.events.send(WorkerEvent::Finished { task_id, error });
    }

    /// Shut the workers down, evict them, and raise one batched removal
    /// event.
    pub fn remove(&self, ids: &[TaskId]) {
        let (batch, group_ids) = self.evict(ids, false);
        if !batch.is_empty() {
            self.dispatcher
                .dispatch(EngineEvent::WorkersRemoved(WorkersRemovedEvent {
                    task_ids: batch,
                    group_ids,
                    timestamp: Utc::now(),
                }));
        }
    }

    /// Force-stop for automation teardown: like removal, but also clears
    /// automation bookkeeping and raises no removal event.
    pub fn stop(&self, ids: &[TaskId]) -> Vec<TaskId> {
        self.evict(ids, true).0
    }

    fn evict(&self, ids: &[TaskId], clear_automation: bool) -> (Vec<TaskId>, Vec<String>) {
        let mut evicted = Vec::new();
        let mut groups: Vec<String> = Vec::new();
        let mut active = self.active.lock().expect("active set poisoned");
        for id in ids {
            let Some(entry) = active.remove(id) else {
                continue;
            };
            entry.removed.store(true, Ordering::SeqCst);
            entry.shutdown.trigger();
            if let Ok(mut task) = entry.task.lock() {
                task.running = false;
                if !groups.contains(&task.group_id) {
                    groups.push(task.group_id.clone());
                }
                if clear_automation {
                    task.clear_automation();
                }
            }
            evicted.push(id.clone());
        }
        (evicted, groups)
    }

    /// Swap the worker's proxy for a fresh pick from its group. The old
    /// lease's usage slot is released by the swap.
    pub fn rotate(&self, task_id: &TaskId) {
        let entry = self
            .active
            .lock()
            .expect("active set poisoned")
            .get(task_id)
            .cloned();
        let Some(entry) = entry else {
            return;
        };
        let group = entry.task.lock().ok().and_then(|t| t.proxy_group.clone());
        let lease = group
            .as_deref()
            .and_then(|g| self.proxies.group(g))
            .and_then(|g| g.pick())
            .map(ProxyLease::new);
        entry
            .session
            .set_proxy(lease.as_ref().map(|l| l.endpoint().to_string()));
        *entry.lease.lock().expect("lease slot poisoned") = lease;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::challenges::ChallengeRequest;
    use crate::challenges::manual::{ManualSolverPool, SolverHost, SolverProfile, SolverScope};
    use crate::events::EventHandler;
    use crate::store::MemoryStore;
    use crate::tasks::proxy::{Proxy, ProxyGroup};
    use crate::tasks::{MonitorMode, MonitorSpec, Task, shared};
    use crate::workers::step::StepFault;
    use async_trait::async_trait;

    struct NullHost;

    #[async_trait]
    impl SolverHost for NullHost {
        async fn open(&self, _profile: &SolverProfile) -> bool {
            true
        }
        async fn present(&self, _solver_id: &str, _request: &ChallengeRequest) {}
        async fn clear(&self, _solver_id: &str) {}
        async fn close(&self, _solver_id: &str) {}
    }

    struct Recording(Mutex<Vec<EngineEvent>>);

    impl EventHandler for Recording {
        fn handle(&self, event: &EngineEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn pool_with_store(
        store: Arc<MemoryStore>,
    ) -> (
        Arc<WorkerPool>,
        mpsc::UnboundedReceiver<WorkerEvent>,
        Arc<Recording>,
    ) {
        let manual = ManualSolverPool::new(Arc::new(NullHost));
        manual.register(SolverProfile::new("s1", SolverScope::Any));
        let router = Arc::new(ChallengeRouter::new(Arc::new(manual)));
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(recording.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool::new(
            PoolConfig::default(),
            Arc::new(ProductCache::new()),
            router,
            store,
            Arc::new(dispatcher),
            tx,
        ));
        (pool, rx, recording)
    }

    fn monitor_task(id: &str) -> SharedTask {
        shared(
            Task::new(
                id,
                "g1",
                "shopify:kith",
                "nike dunk",
                TaskSpec::Monitor(MonitorSpec {
                    mode: MonitorMode::Sku,
                    // Unroutable; the monitor will sit in connection-error
                    // retries for the duration of the test.
                    endpoint: "http://127.0.0.1:9/stock".into(),
                }),
            )
            .with_proxy_group("p1"),
        )
    }

    fn store_with_proxies(count: usize) -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        let mut group = ProxyGroup::new("p1", "resi");
        for i in 0..count {
            group.add(Proxy::new(
                format!("px{i}"),
                format!("http://10.0.0.{i}:8080"),
            ));
        }
        store.add_proxy_group(group);
        store
    }

    #[tokio::test]
    async fn duplicate_submission_is_idempotent() {
        let (pool, _rx, _events) = pool_with_store(store_with_proxies(2));
        let task = monitor_task("t1");

        assert_eq!(pool.submit(vec![task.clone()]).unwrap(), 1);
        assert_eq!(pool.submit(vec![task.clone()]).unwrap(), 0);
        assert_eq!(pool.count(), 1);
        assert!(task.lock().unwrap().running);

        pool.remove(&["t1".to_string()]);
    }

    #[tokio::test]
    async fn locked_pool_refuses_submissions() {
        let (pool, _rx, _events) = pool_with_store(store_with_proxies(1));
        pool.set_locked(true);
        assert!(matches!(
            pool.submit(vec![monitor_task("t1")]),
            Err(PoolError::Locked)
        ));
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn proxies_spread_across_workers_and_release_on_removal() {
        let store = store_with_proxies(2);
        let (pool, _rx, _events) = pool_with_store(store.clone());

        pool.submit(vec![monitor_task("t1"), monitor_task("t2")])
            .unwrap();
        let group = store.group("p1").unwrap();
        let usages: Vec<u32> = group.all().iter().map(|p| p.usage()).collect();
        assert_eq!(usages, vec![1, 1]);

        pool.remove(&["t1".to_string(), "t2".to_string()]);
        let usages: Vec<u32> = group.all().iter().map(|p| p.usage()).collect();
        assert_eq!(usages, vec![0, 0]);
    }

    #[tokio::test]
    async fn batched_removal_raises_one_event() {
        let (pool, _rx, events) = pool_with_store(store_with_proxies(2));
        pool.submit(vec![monitor_task("t1"), monitor_task("t2")])
            .unwrap();
        pool.remove(&["t1".to_string(), "t2".to_string(), "ghost".to_string()]);

        let removed: Vec<_> = events
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::WorkersRemoved(removed) => {
                    Some((removed.task_ids.clone(), removed.group_ids.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, vec!["t1".to_string(), "t2".to_string()]);
        // Both tasks share a group; the invalidation list is deduplicated.
        assert_eq!(removed[0].1, vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn faulted_run_is_resubmitted_exactly_once() {
        let (pool, mut rx, _events) = pool_with_store(store_with_proxies(1));
        let task = monitor_task("t1");
        pool.submit(vec![task.clone()]).unwrap();

        let fault = |step| {
            Ok(RunEnd::Faulted(StepFault {
                step,
                message: "boom".into(),
            }))
        };

        // First fault: self-heal respawns the worker under the same id.
        pool.worker_finished("t1".to_string(), fault("poll-sku"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.is_active("t1"));

        // Second fault: terminal.
        pool.worker_finished("t1".to_string(), fault("poll-sku"));
        assert!(!pool.is_active("t1"));

        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkerEvent::Finished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn rotation_swaps_the_lease() {
        let store = store_with_proxies(2);
        let (pool, _rx, _events) = pool_with_store(store.clone());
        pool.submit(vec![monitor_task("t1")]).unwrap();

        let group = store.group("p1").unwrap();
        let before: u32 = group.all().iter().map(|p| p.usage()).sum();
        assert_eq!(before, 1);

        pool.rotate(&"t1".to_string());
        // Still exactly one slot in use after the swap.
        let after: u32 = group.all().iter().map(|p| p.usage()).sum();
        assert_eq!(after, 1);

        pool.remove(&["t1".to_string()]);
    }
}
