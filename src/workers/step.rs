//! Generic retrying step state machine.
//!
//! Steps form a directed graph identified by opaque tags. A handler returns
//! one of: advance to a named step, retry the current step after a delay,
//! or terminate. One execution is in flight per executor instance; workers
//! run independent executors concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Opaque step identifier.
pub type StepTag = &'static str;

/// One-way cancellation flag. Once triggered it never resets; waits issued
/// before the trigger are woken rather than awaited to completion.
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is triggered.
    pub async fn triggered(&self) {
        if self.is_triggered() {
            return;
        }
        let waiter = self.inner.notify.notified();
        if self.is_triggered() {
            return;
        }
        waiter.await;
    }
}

/// What a handler wants next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Advance to the named step now.
    Goto(StepTag),
    /// Re-run the current step after the delay.
    Retry(Duration),
    /// Workflow completed successfully.
    Done,
    /// Workflow terminated with an error; emits "finished with error".
    Fail(String),
}

/// Fault raised by a handler. Treated as non-fatal by the executor: the run
/// ends as `Faulted`, which pools interpret as an unexpected termination.
#[derive(Debug, Error)]
#[error("step '{step}' threw: {message}")]
pub struct StepFault {
    pub step: StepTag,
    pub message: String,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunEnd {
    Completed,
    /// Explicit `Fail` terminal, distinct from normal completion.
    Failed(String),
    /// A handler fault ended the run without an explicit terminal.
    Faulted(StepFault),
    /// The shutdown flag was raised before a retry could be scheduled.
    Shutdown,
}

/// Executor notifications, for observability only.
#[derive(Debug, Clone)]
pub enum ExecutorNotice {
    StepThrew { step: StepTag, message: String },
    Retrying { step: StepTag, after: Duration },
    FinishedWithError { message: String },
}

/// Shrinks or clamps a requested retry delay, e.g. to align retries to
/// wall-clock boundaries.
pub trait DelayModifier: Send + Sync {
    fn adjust(&self, step: StepTag, requested: Duration) -> Duration;
}

/// A single step handler over workflow state `S`.
#[async_trait]
pub trait Step<S: Send>: Send + Sync {
    async fn run(&self, state: &mut S) -> Result<StepOutcome, StepFault>;
}

#[derive(Debug, Error)]
pub enum StepGraphError {
    #[error("unknown step tag '{0}'")]
    UnknownStep(StepTag),
}

/// Directed graph of steps plus the entry tag.
pub struct StepGraph<S: Send> {
    start: StepTag,
    steps: HashMap<StepTag, Box<dyn Step<S>>>,
}

impl<S: Send> StepGraph<S> {
    pub fn new(start: StepTag) -> Self {
        Self {
            start,
            steps: HashMap::new(),
        }
    }

    pub fn insert(mut self, tag: StepTag, step: impl Step<S> + 'static) -> Self {
        self.steps.insert(tag, Box::new(step));
        self
    }
}

/// Drives one workflow over a step graph.
pub struct StepExecutor<S: Send> {
    graph: StepGraph<S>,
    shutdown: ShutdownFlag,
    delay_modifier: Option<Box<dyn DelayModifier>>,
    notices: Option<Arc<dyn Fn(ExecutorNotice) + Send + Sync>>,
}

impl<S: Send> StepExecutor<S> {
    pub fn new(graph: StepGraph<S>, shutdown: ShutdownFlag) -> Self {
        Self {
            graph,
            shutdown,
            delay_modifier: None,
            notices: None,
        }
    }

    pub fn with_delay_modifier(mut self, modifier: impl DelayModifier + 'static) -> Self {
        self.delay_modifier = Some(Box::new(modifier));
        self
    }

    pub fn with_notices(
        mut self,
        notices: Arc<dyn Fn(ExecutorNotice) + Send + Sync>,
    ) -> Self {
        self.notices = Some(notices);
        self
    }

    fn notify(&self, notice: ExecutorNotice) {
        if let Some(ref notices) = self.notices {
            notices(notice);
        }
    }

    /// Run the workflow to a terminal state.
    pub async fn run(&self, state: &mut S) -> Result<RunEnd, StepGraphError> {
        let mut current = self.graph.start;

        loop {
            if self.shutdown.is_triggered() {
                return Ok(RunEnd::Shutdown);
            }

            let step = self
                .graph
                .steps
                .get(current)
                .ok_or(StepGraphError::UnknownStep(current))?;

            match step.run(state).await {
                Ok(StepOutcome::Goto(next)) => {
                    if !self.graph.steps.contains_key(next) {
                        return Err(StepGraphError::UnknownStep(next));
                    }
                    current = next;
                }
                Ok(StepOutcome::Retry(requested)) => {
                    // The flag is checked before any retry is scheduled;
                    // an in-flight wait is abandoned via select below.
                    if self.shutdown.is_triggered() {
                        return Ok(RunEnd::Shutdown);
                    }
                    let delay = match self.delay_modifier {
                        Some(ref modifier) => modifier.adjust(current, requested),
                        None => requested,
                    };
                    self.notify(ExecutorNotice::Retrying {
                        step: current,
                        after: delay,
                    });
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.triggered() => return Ok(RunEnd::Shutdown),
                    }
                }
                Ok(StepOutcome::Done) => return Ok(RunEnd::Completed),
                Ok(StepOutcome::Fail(message)) => {
                    self.notify(ExecutorNotice::FinishedWithError {
                        message: message.clone(),
                    });
                    return Ok(RunEnd::Failed(message));
                }
                Err(fault) => {
                    log::warn!("{fault}");
                    self.notify(ExecutorNotice::StepThrew {
                        step: fault.step,
                        message: fault.message.clone(),
                    });
                    return Ok(RunEnd::Faulted(fault));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CountingStep {
        hits: Arc<Mutex<u32>>,
        until: u32,
        then: StepOutcome,
    }

    #[async_trait]
    impl Step<()> for CountingStep {
        async fn run(&self, _state: &mut ()) -> Result<StepOutcome, StepFault> {
            let mut hits = self.hits.lock().unwrap();
            *hits += 1;
            if *hits < self.until {
                Ok(StepOutcome::Retry(Duration::from_millis(1)))
            } else {
                Ok(self.then.clone())
            }
        }
    }

    struct ThrowingStep;

    #[async_trait]
    impl Step<()> for ThrowingStep {
        async fn run(&self, _state: &mut ()) -> Result<StepOutcome, StepFault> {
            Err(StepFault {
                step: "boom",
                message: "unexpected".into(),
            })
        }
    }

    struct HalvingDelay;

    impl DelayModifier for HalvingDelay {
        fn adjust(&self, _step: StepTag, requested: Duration) -> Duration {
            requested / 2
        }
    }

    #[test]
    fn shutdown_wait_is_pending_until_triggered() {
        use tokio_test::{assert_pending, assert_ready};

        let flag = ShutdownFlag::new();
        let mut wait = tokio_test::task::spawn(flag.triggered());
        assert_pending!(wait.poll());
        flag.trigger();
        assert_ready!(wait.poll());
        // A wait issued after the trigger resolves immediately.
        let mut late = tokio_test::task::spawn(flag.triggered());
        assert_ready!(late.poll());
    }

    #[tokio::test]
    async fn retries_then_completes() {
        let hits = Arc::new(Mutex::new(0));
        let graph = StepGraph::new("poll").insert(
            "poll",
            CountingStep {
                hits: hits.clone(),
                until: 3,
                then: StepOutcome::Done,
            },
        );
        let executor = StepExecutor::new(graph, ShutdownFlag::new());
        let end = executor.run(&mut ()).await.unwrap();
        assert!(matches!(end, RunEnd::Completed));
        assert_eq!(*hits.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn explicit_fail_is_distinct_from_fault() {
        let graph = StepGraph::new("poll").insert(
            "poll",
            CountingStep {
                hits: Arc::new(Mutex::new(0)),
                until: 1,
                then: StepOutcome::Fail("card declined".into()),
            },
        );
        let notices: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = notices.clone();
        let executor = StepExecutor::new(graph, ShutdownFlag::new()).with_notices(Arc::new(
            move |notice| {
                sink.lock().unwrap().push(format!("{notice:?}"));
            },
        ));
        let end = executor.run(&mut ()).await.unwrap();
        assert!(matches!(end, RunEnd::Failed(_)));
        assert!(notices.lock().unwrap()[0].contains("FinishedWithError"));
    }

    #[tokio::test]
    async fn fault_ends_the_run_without_error_terminal() {
        let graph = StepGraph::new("boom").insert("boom", ThrowingStep);
        let executor = StepExecutor::new(graph, ShutdownFlag::new());
        let end = executor.run(&mut ()).await.unwrap();
        assert!(matches!(end, RunEnd::Faulted(_)));
    }

    #[tokio::test]
    async fn shutdown_blocks_further_retries() {
        let shutdown = ShutdownFlag::new();
        shutdown.trigger();
        let graph = StepGraph::new("poll").insert(
            "poll",
            CountingStep {
                hits: Arc::new(Mutex::new(0)),
                until: 100,
                then: StepOutcome::Done,
            },
        );
        let executor = StepExecutor::new(graph, shutdown);
        let end = executor.run(&mut ()).await.unwrap();
        assert!(matches!(end, RunEnd::Shutdown));
    }

    #[tokio::test]
    async fn delay_modifier_shrinks_requested_delays() {
        struct SlowRetry {
            hits: Arc<Mutex<u32>>,
        }

        #[async_trait]
        impl Step<()> for SlowRetry {
            async fn run(&self, _state: &mut ()) -> Result<StepOutcome, StepFault> {
                let mut hits = self.hits.lock().unwrap();
                *hits += 1;
                if *hits < 2 {
                    Ok(StepOutcome::Retry(Duration::from_millis(40)))
                } else {
                    Ok(StepOutcome::Done)
                }
            }
        }

        let hits = Arc::new(Mutex::new(0));
        let graph = StepGraph::new("poll").insert("poll", SlowRetry { hits });
        let executor =
            StepExecutor::new(graph, ShutdownFlag::new()).with_delay_modifier(HalvingDelay);

        let started = std::time::Instant::now();
        executor.run(&mut ()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn unknown_goto_is_a_graph_error() {
        let graph = StepGraph::new("poll").insert(
            "poll",
            CountingStep {
                hits: Arc::new(Mutex::new(0)),
                until: 1,
                then: StepOutcome::Goto("missing"),
            },
        );
        let executor = StepExecutor::new(graph, ShutdownFlag::new());
        assert!(executor.run(&mut ()).await.is_err());
    }
}
