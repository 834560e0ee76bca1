//! # restock-rs
//!
//! A task-workflow engine for store monitoring and automated purchasing,
//! paired with a layered challenge-resolution subsystem (automated token
//! service, paid solver providers, human-assisted solver pool).
//!
//! ## Features
//!
//! - Generic retrying step state machine driving each worker
//! - SKU, catalog, and page-scrape monitor backends feeding a product cache
//! - Buyers fulfilled from the cache via one-shot listeners
//! - Challenge routing across automated, paid, and manual solvers
//! - Queue-gateway waits with explicit abandonment on shutdown
//! - Proxy rotation with structurally paired usage counters
//! - Keyword-driven, time-boxed automation sessions
//!
//! ## Example
//!
//! ```no_run
//! use restock_rs::{Engine, MemoryStore, TaskGroupStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     let engine = Engine::builder()
//!         .with_task_store(store.clone())
//!         .with_proxy_store(store)
//!         .build();
//!     engine.start_group("launch-day").ok();
//! }
//! ```

mod engine;

pub mod automation;
pub mod challenges;
pub mod events;
pub mod gateway;
pub mod products;
pub mod store;
pub mod tasks;
pub mod workers;

pub use crate::engine::{Engine, EngineBuilder, EngineConfig};

pub use crate::automation::{Automation, AutomationRule};

pub use crate::challenges::autosolve::{AutosolveAnswer, AutosolveClient, AutosolveRequest};
pub use crate::challenges::manual::{ManualSolverPool, SolverHost, SolverProfile, SolverScope};
pub use crate::challenges::providers::{
    AckPollProvider,
    JobPollProvider,
    ProviderConfig,
    SolverError,
    SolverJob,
    SolverProvider,
};
pub use crate::challenges::router::{ChallengeRouter, RouterConfig, SolverStrategy};
pub use crate::challenges::{
    ChallengeAnswer,
    ChallengeKind,
    ChallengeOutcome,
    ChallengeRequest,
};

pub use crate::events::{
    EngineEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    UiBatch,
    UiBatcher,
    UiSink,
};

pub use crate::gateway::{GatewayError, GatewayOutcome, QueueGatewayClient};

pub use crate::products::matching::{KeywordGroup, MonitorTarget};
pub use crate::products::{
    CachedProduct,
    ListenerDecision,
    ProductCache,
    ProductKey,
    Variant,
};

pub use crate::store::{MemoryStore, ProxyStore, TaskGroupStore};

pub use crate::tasks::proxy::{Proxy, ProxyGroup, ProxyLease};
pub use crate::tasks::{
    BuyerSpec,
    MonitorMode,
    MonitorSpec,
    Severity,
    SharedTask,
    StartedBy,
    Task,
    TaskGroup,
    TaskId,
    TaskSpec,
    TaskStatus,
};

pub use crate::workers::buyer::{BuyerWorker, buyer_graph};
pub use crate::workers::http::{HttpSession, RetryPolicy, SessionError};
pub use crate::workers::monitors::{MonitorWorker, monitor_graph};
pub use crate::workers::pool::{PoolConfig, PoolError, WorkerPool};
pub use crate::workers::step::{
    DelayModifier,
    RunEnd,
    ShutdownFlag,
    Step,
    StepExecutor,
    StepFault,
    StepGraph,
    StepOutcome,
};
pub use crate::workers::{Worker, WorkerEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
