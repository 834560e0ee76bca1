//! Engine assembly.
//!
//! One explicitly constructed service object owning the worker pool, the
//! product cache, the challenge router, the manual solver pool, and the
//! automation state. Nothing here is ambient: embedders build an engine,
//! hold it, and inject it where needed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::automation::{Automation, AutomationRule};
use crate::challenges::autosolve::AutosolveClient;
use crate::challenges::manual::{ManualSolverPool, SolverHost, SolverProfile};
use crate::challenges::providers::SolverProvider;
use crate::challenges::router::{ChallengeRouter, RouterConfig};
use crate::challenges::{ChallengeAnswer, ChallengeRequest};
use crate::events::{
    ChallengeRaisedEvent, EngineEvent, EventDispatcher, EventHandler, ProductFoundEvent,
    QueueEvent, StatusEvent, UiBatcher, UiSink,
};
use crate::products::ProductCache;
use crate::store::{ProxyStore, TaskGroupStore};
use crate::tasks::{SharedTask, TaskId};
use crate::workers::pool::{PoolConfig, PoolError, WorkerPool};
use crate::workers::step::ShutdownFlag;
use crate::workers::WorkerEvent;

/// Manual front end that never opens a context; challenges routed manually
/// queue until a real host is wired in.
struct NoopHost;

#[async_trait]
impl SolverHost for NoopHost {
    async fn open(&self, _profile: &SolverProfile) -> bool {
        false
    }
    async fn present(&self, _solver_id: &str, _request: &ChallengeRequest) {}
    async fn clear(&self, _solver_id: &str) {}
    async fn close(&self, _solver_id: &str) {}
}

/// Feeds group-scoped events into the UI batcher as view invalidations.
struct UiInvalidator {
    ui: Arc<UiBatcher>,
}

impl EventHandler for UiInvalidator {
    fn handle(&self, event: &EngineEvent) {
        let group_ids = match event {
            EngineEvent::WorkersRemoved(removed) => &removed.group_ids,
            EngineEvent::AutomationStarted(session) | EngineEvent::AutomationEnded(session) => {
                &session.group_ids
            }
            _ => return,
        };
        for group_id in group_ids {
            self.ui.invalidate(group_id.clone());
        }
    }
}

/// Engine configuration used by the builder.
#[derive(Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub router: RouterConfig,
}

/// Fluent builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    task_store: Option<Arc<dyn TaskGroupStore>>,
    proxy_store: Option<Arc<dyn ProxyStore>>,
    solver_host: Option<Arc<dyn SolverHost>>,
    solver_profiles: Vec<SolverProfile>,
    providers: Vec<Arc<dyn SolverProvider>>,
    autosolve: Option<Arc<AutosolveClient>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    ui_sink: Option<Arc<dyn UiSink>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            task_store: None,
            proxy_store: None,
            solver_host: None,
            solver_profiles: Vec::new(),
            providers: Vec::new(),
            autosolve: None,
            handlers: Vec::new(),
            ui_sink: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskGroupStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn with_proxy_store(mut self, store: Arc<dyn ProxyStore>) -> Self {
        self.proxy_store = Some(store);
        self
    }

    pub fn with_solver_host(mut self, host: Arc<dyn SolverHost>) -> Self {
        self.solver_host = Some(host);
        self
    }

    pub fn with_solver_profile(mut self, profile: SolverProfile) -> Self {
        self.solver_profiles.push(profile);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn SolverProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_autosolve(mut self, client: Arc<AutosolveClient>) -> Self {
        self.autosolve = Some(client);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_ui_sink(mut self, sink: Arc<dyn UiSink>) -> Self {
        self.ui_sink = Some(sink);
        self
    }

    pub fn build(self) -> Engine {
        let task_store: Arc<dyn TaskGroupStore> = match self.task_store {
            Some(store) => store,
            None => crate::store::MemoryStore::new(),
        };
        let proxy_store: Arc<dyn ProxyStore> = match self.proxy_store {
            Some(store) => store,
            None => crate::store::MemoryStore::new(),
        };
        let host = self.solver_host.unwrap_or_else(|| Arc::new(NoopHost));

        let ui = UiBatcher::new();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(UiInvalidator { ui: ui.clone() }));
        for handler in self.handlers {
            dispatcher.register_handler(handler);
        }
        let dispatcher = Arc::new(dispatcher);

        let manual = Arc::new(ManualSolverPool::new(host));
        for profile in self.solver_profiles {
            manual.register(profile);
        }

        let mut router = ChallengeRouter::new(manual.clone()).with_config(self.config.router);
        if let Some(ref client) = self.autosolve {
            router = router.with_autosolve(client.clone());
        }
        for provider in self.providers {
            router = router.with_provider(provider);
        }
        let router = Arc::new(router);

        let cache = Arc::new(ProductCache::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool::new(
            self.config.pool,
            cache.clone(),
            router.clone(),
            proxy_store,
            dispatcher.clone(),
            events_tx,
        ));
        let automation = Arc::new(Automation::new(
            task_store.clone(),
            pool.clone(),
            dispatcher.clone(),
        ));

        let shutdown = ShutdownFlag::new();
        if let Some(sink) = self.ui_sink {
            ui.spawn(sink, shutdown.clone());
        }

        let engine = Engine {
            task_store,
            cache,
            router,
            manual,
            pool,
            automation,
            dispatcher,
            ui,
            autosolve: self.autosolve,
            shutdown,
        };
        engine.spawn_event_loop(events_rx);
        engine
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled task engine.
pub struct Engine {
    task_store: Arc<dyn TaskGroupStore>,
    cache: Arc<ProductCache>,
    router: Arc<ChallengeRouter>,
    manual: Arc<ManualSolverPool>,
    pool: Arc<WorkerPool>,
    automation: Arc<Automation>,
    dispatcher: Arc<EventDispatcher>,
    ui: Arc<UiBatcher>,
    autosolve: Option<Arc<AutosolveClient>>,
    shutdown: ShutdownFlag,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn cache(&self) -> &Arc<ProductCache> {
        &self.cache
    }

    pub fn router(&self) -> &Arc<ChallengeRouter> {
        &self.router
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn solvers(&self) -> &Arc<ManualSolverPool> {
        &self.manual
    }

    /// Start every task of a stored group.
    pub fn start_group(&self, group_id: &str) -> Result<usize, PoolError> {
        let Some(group) = self.task_store.find_by_id(group_id) else {
            return Ok(0);
        };
        self.pool.submit(group.tasks)
    }

    pub fn start_tasks(&self, tasks: Vec<SharedTask>) -> Result<usize, PoolError> {
        self.pool.submit(tasks)
    }

    pub fn remove_tasks(&self, ids: &[TaskId]) {
        self.pool.remove(ids);
    }

    pub fn add_automation_rule(&self, rule: AutomationRule) {
        self.automation.add_rule(rule);
    }

    /// External automate request, e.g. from a control channel.
    pub fn automate(&self, store: &str, text: &str) {
        self.automation.automate(store, text);
    }

    pub fn register_solver(&self, profile: SolverProfile) {
        self.manual.register(profile);
    }

    /// A solver front end's answer callback.
    pub async fn solver_answered(&self, solver_id: &str, answer: ChallengeAnswer) {
        self.manual.complete(solver_id, answer).await;
    }

    pub async fn solver_closed(&self, solver_id: &str) {
        self.manual.solver_closed(solver_id).await;
    }

    /// Control-channel auth fault: lock the pool, tear everything down.
    pub async fn sign_out(&self) {
        self.pool.set_locked(true);
        if let Some(ref client) = self.autosolve {
            client.set_connected(false);
        }
        let active = self.pool.active_ids();
        self.pool.remove(&active);
        self.manual.close_all().await;
        self.dispatcher.dispatch(EngineEvent::SignedOut {
            timestamp: Utc::now(),
        });
    }

    /// Tear the engine down for good.
    pub async fn shutdown(&self) {
        self.sign_out().await;
        self.shutdown.trigger();
    }

    fn spawn_event_loop(&self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        let dispatcher = self.dispatcher.clone();
        let automation = self.automation.clone();
        let pool = self.pool.clone();
        let ui = self.ui.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    WorkerEvent::Status { task_id, status } => {
                        ui.status(task_id.clone(), status.clone());
                        dispatcher.dispatch(EngineEvent::Status(StatusEvent {
                            task_id,
                            status,
                            timestamp: Utc::now(),
                        }));
                    }
                    WorkerEvent::ProductFound { task_id, product } => {
                        automation.on_product(&product);
                        dispatcher.dispatch(EngineEvent::ProductFound(ProductFoundEvent {
                            task_id,
                            product,
                            timestamp: Utc::now(),
                        }));
                    }
                    WorkerEvent::QueueEntered { task_id } => {
                        dispatcher.dispatch(EngineEvent::Queue(QueueEvent {
                            task_id,
                            passed: false,
                            timestamp: Utc::now(),
                        }));
                    }
                    WorkerEvent::QueuePassed { task_id } => {
                        dispatcher.dispatch(EngineEvent::Queue(QueueEvent {
                            task_id,
                            passed: true,
                            timestamp: Utc::now(),
                        }));
                    }
                    WorkerEvent::ChallengeNeeded { task_id, request } => {
                        dispatcher.dispatch(EngineEvent::ChallengeRaised(ChallengeRaisedEvent {
                            task_id,
                            kind: request.kind,
                            timestamp: Utc::now(),
                        }));
                    }
                    WorkerEvent::RotateProxy { task_id } => {
                        pool.rotate(&task_id);
                    }
                    WorkerEvent::Shutdown { task_id } => {
                        log::debug!("worker {task_id} wound down");
                    }
                    WorkerEvent::Finished { task_id, error } => match error {
                        Some(error) => log::info!("worker {task_id} finished with error: {error}"),
                        None => log::info!("worker {task_id} finished"),
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::store::MemoryStore;
    use crate::tasks::{MonitorMode, MonitorSpec, Task, TaskGroup, TaskSpec};

    struct Recording(Mutex<Vec<EngineEvent>>);

    impl EventHandler for Recording {
        fn handle(&self, event: &EngineEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn group() -> TaskGroup {
        let mut group = TaskGroup::new("g1", "drop", "shopify:kith");
        group.push(Task::new(
            "m1",
            "g1",
            "shopify:kith",
            "nike dunk",
            TaskSpec::Monitor(MonitorSpec {
                mode: MonitorMode::Sku,
                endpoint: "http://127.0.0.1:9/stock".into(),
            }),
        ));
        group
    }

    #[tokio::test]
    async fn start_group_submits_stored_tasks() {
        let store = MemoryStore::new();
        store.save(group());
        let engine = Engine::builder()
            .with_task_store(store.clone())
            .with_proxy_store(store)
            .build();

        assert_eq!(engine.start_group("g1").unwrap(), 1);
        assert_eq!(engine.pool().count(), 1);
        assert_eq!(engine.start_group("missing").unwrap(), 0);

        engine.shutdown().await;
    }

    struct CollectingSink(Mutex<Vec<crate::events::UiBatch>>);

    impl UiSink for CollectingSink {
        fn deliver(&self, batch: crate::events::UiBatch) {
            self.0.lock().unwrap().push(batch);
        }
    }

    #[tokio::test]
    async fn removing_workers_invalidates_the_group_view() {
        let store = MemoryStore::new();
        store.save(group());
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let engine = Engine::builder()
            .with_task_store(store.clone())
            .with_proxy_store(store)
            .with_ui_sink(sink.clone())
            .build();

        engine.start_group("g1").unwrap();
        engine.remove_tasks(&["m1".to_string()]);

        tokio::time::sleep(UiBatcher::TICK * 4).await;
        let invalidated: Vec<String> = sink
            .0
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.invalidated.clone())
            .collect();
        assert!(invalidated.contains(&"g1".to_string()));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn sign_out_locks_and_tears_down() {
        let store = MemoryStore::new();
        store.save(group());
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let engine = Engine::builder()
            .with_task_store(store.clone())
            .with_proxy_store(store)
            .with_event_handler(recording.clone())
            .build();

        engine.start_group("g1").unwrap();
        engine.sign_out().await;

        assert_eq!(engine.pool().count(), 0);
        assert!(matches!(
            engine.start_group("g1"),
            Err(PoolError::Locked)
        ));
        assert!(
            recording
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, EngineEvent::SignedOut { .. }))
        );
    }
}
