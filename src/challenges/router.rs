//! Challenge routing.
//!
//! One decision per raised challenge, keyed by (automated-service
//! availability, challenge kind, platform eligibility), yielding a single
//! strategy: the automated token service, a paid provider adapter, or the
//! manual pool. Provider failures re-raise the challenge after a fixed
//! delay, bounded only by the worker not being shut down; a failure that
//! retrying cannot cure bars the paid tier and drops to the next one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::challenges::autosolve::{AutosolveAnswer, AutosolveClient, AutosolveRequest};
use crate::challenges::manual::ManualSolverPool;
use crate::challenges::providers::{SolverError, SolverJob, SolverProvider};
use crate::challenges::{ChallengeAnswer, ChallengeKind, ChallengeOutcome, ChallengeRequest};
use crate::tasks::TaskId;
use crate::workers::step::ShutdownFlag;

/// Strategy chosen for one challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStrategy {
    Automated,
    Paid,
    Manual,
}

/// The decision table. Evaluated once per challenge; manual questions never
/// reach a machine solver, platform-excluded kinds skip the automated tier.
pub fn route_challenge(
    kind: ChallengeKind,
    automated_connected: bool,
    automated_excluded: &[ChallengeKind],
    paid_supported: bool,
) -> SolverStrategy {
    if kind.requires_human() {
        return SolverStrategy::Manual;
    }
    if automated_connected && !automated_excluded.contains(&kind) {
        return SolverStrategy::Automated;
    }
    if paid_supported {
        return SolverStrategy::Paid;
    }
    SolverStrategy::Manual
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Kinds the connected automated service must not receive on this
    /// platform.
    pub automated_excluded: Vec<ChallengeKind>,
    /// Fixed delay before a failed challenge is re-raised.
    pub retry_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            automated_excluded: Vec::new(),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Routes raised challenges to the first eligible solving tier.
pub struct ChallengeRouter {
    config: RouterConfig,
    autosolve: Option<Arc<AutosolveClient>>,
    providers: Vec<Arc<dyn SolverProvider>>,
    manual: Arc<ManualSolverPool>,
    /// Task ids with an automated/paid attempt in flight. At most one
    /// outstanding attempt exists per task id.
    outstanding: Mutex<HashSet<TaskId>>,
    /// Waiters for out-of-band automated answers, keyed by task id.
    waiting: Mutex<HashMap<TaskId, oneshot::Sender<ChallengeAnswer>>>,
}

impl ChallengeRouter {
    pub fn new(manual: Arc<ManualSolverPool>) -> Self {
        Self {
            config: RouterConfig::default(),
            autosolve: None,
            providers: Vec::new(),
            manual,
            outstanding: Mutex::new(HashSet::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_autosolve(mut self, client: Arc<AutosolveClient>) -> Self {
        self.autosolve = Some(client);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn SolverProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Spawn the loop draining out-of-band automated answers into waiters.
    pub fn spawn_autosolve_inbound(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<AutosolveAnswer>,
    ) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(answer) = inbound.recv().await {
                router.resolve_automated(answer);
            }
        });
    }

    /// Match an automated answer to its waiter by task id. Late or
    /// unmatched answers are dropped silently.
    pub fn resolve_automated(&self, answer: AutosolveAnswer) {
        let waiter = self
            .waiting
            .lock()
            .expect("waiting map poisoned")
            .remove(&answer.task_id);
        match waiter {
            Some(sender) => {
                let _ = sender.send(answer.answer);
            }
            None => {
                log::debug!("dropping unmatched answer for task {}", answer.task_id);
            }
        }
    }

    fn provider_for(&self, kind: ChallengeKind) -> Option<Arc<dyn SolverProvider>> {
        self.providers.iter().find(|p| p.supports(kind)).cloned()
    }

    /// Route one challenge and wait for its answer. A shut-down worker gets
    /// `Abandoned`, never an error.
    pub async fn solve(
        &self,
        request: &ChallengeRequest,
        proxy: Option<String>,
        shutdown: &ShutdownFlag,
    ) -> ChallengeOutcome {
        let mut paid_barred = false;
        loop {
            if shutdown.is_triggered() {
                return ChallengeOutcome::Abandoned;
            }

            let provider = if paid_barred {
                None
            } else {
                self.provider_for(request.kind)
            };
            let strategy = route_challenge(
                request.kind,
                self.autosolve.as_ref().is_some_and(|c| c.is_connected()),
                &self.config.automated_excluded,
                provider.is_some(),
            );

            let failure = match (strategy, self.autosolve.clone(), provider) {
                (SolverStrategy::Automated, Some(client), _) => {
                    match self
                        .solve_automated(&client, request, proxy.clone(), shutdown)
                        .await
                    {
                        Ok(outcome) => return outcome,
                        Err(message) => message,
                    }
                }
                (SolverStrategy::Paid, _, Some(provider)) => {
                    let name = provider.name();
                    match self
                        .solve_paid(provider, request, proxy.clone(), shutdown)
                        .await
                    {
                        Ok(outcome) => return outcome,
                        Err(err) if !err.is_retryable() => {
                            // A hopeless provider is barred for this
                            // challenge; the table re-evaluates without it
                            // and routes the next tier down.
                            log::error!("provider {name} barred for this challenge: {err}");
                            paid_barred = true;
                            continue;
                        }
                        Err(err) => err.to_string(),
                    }
                }
                _ => return self.solve_manual(request, shutdown).await,
            };

            log::warn!(
                "challenge {} for task {} failed ({failure}), re-raising",
                request.id,
                request.task_id
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_delay) => {}
                _ = shutdown.triggered() => return ChallengeOutcome::Abandoned,
            }
        }
    }

    async fn solve_automated(
        &self,
        client: &AutosolveClient,
        request: &ChallengeRequest,
        proxy: Option<String>,
        shutdown: &ShutdownFlag,
    ) -> Result<ChallengeOutcome, String> {
        let Some(_guard) = OutstandingGuard::try_acquire(&self.outstanding, &request.task_id)
        else {
            log::debug!(
                "task {} already has a solver attempt in flight; dropping duplicate",
                request.task_id
            );
            return Ok(ChallengeOutcome::Abandoned);
        };

        let (sender, receiver) = oneshot::channel();
        self.waiting
            .lock()
            .expect("waiting map poisoned")
            .insert(request.task_id.clone(), sender);

        if !client.request(AutosolveRequest::from_challenge(request, proxy)) {
            self.waiting
                .lock()
                .expect("waiting map poisoned")
                .remove(&request.task_id);
            return Err("automated service unavailable".into());
        }

        tokio::select! {
            answer = receiver => match answer {
                Ok(answer) => Ok(ChallengeOutcome::Answered(answer)),
                Err(_) => Err("automated wait dropped".into()),
            },
            _ = shutdown.triggered() => {
                self.waiting
                    .lock()
                    .expect("waiting map poisoned")
                    .remove(&request.task_id);
                Ok(ChallengeOutcome::Abandoned)
            }
        }
    }

    async fn solve_paid(
        &self,
        provider: Arc<dyn SolverProvider>,
        request: &ChallengeRequest,
        proxy: Option<String>,
        shutdown: &ShutdownFlag,
    ) -> Result<ChallengeOutcome, SolverError> {
        let Some(_guard) = OutstandingGuard::try_acquire(&self.outstanding, &request.task_id)
        else {
            log::debug!(
                "task {} already has a solver attempt in flight; dropping duplicate",
                request.task_id
            );
            return Ok(ChallengeOutcome::Abandoned);
        };

        let mut job = SolverJob::from_request(request);
        if let Some(proxy) = proxy {
            job = job.with_proxy(proxy);
        }

        tokio::select! {
            result = provider.solve(&job) => result.map(ChallengeOutcome::Answered),
            _ = shutdown.triggered() => Ok(ChallengeOutcome::Abandoned),
        }
    }

    async fn solve_manual(
        &self,
        request: &ChallengeRequest,
        shutdown: &ShutdownFlag,
    ) -> ChallengeOutcome {
        let receiver = self.manual.submit(request.clone()).await;
        tokio::select! {
            outcome = receiver => outcome.unwrap_or(ChallengeOutcome::Abandoned),
            _ = shutdown.triggered() => {
                self.manual.cancel(&request.id).await;
                ChallengeOutcome::Abandoned
            }
        }
    }

    #[cfg(test)]
    fn outstanding_len(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}

/// Removes the task id from the outstanding set on every exit path.
struct OutstandingGuard<'a> {
    set: &'a Mutex<HashSet<TaskId>>,
    task_id: TaskId,
}

impl<'a> OutstandingGuard<'a> {
    fn try_acquire(set: &'a Mutex<HashSet<TaskId>>, task_id: &TaskId) -> Option<Self> {
        let mut guard = set.lock().expect("outstanding set poisoned");
        if !guard.insert(task_id.clone()) {
            return None;
        }
        Some(Self {
            set,
            task_id: task_id.clone(),
        })
    }
}

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("outstanding set poisoned")
            .remove(&self.task_id);
    }
}
