//! Human-assisted solver pool.
//!
//! Each solver is a hosted browser context with a scope tag and at most one
//! active challenge. Queued challenges go to the first idle solver whose
//! scope equals the challenge's context tag or is the wildcard scope.
//! First match wins, with no priority between exact and wildcard scopes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::challenges::{ChallengeAnswer, ChallengeOutcome, ChallengeRequest};

/// Which challenge contexts a solver takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverScope {
    /// Wildcard: any context tag.
    Any,
    Tag(String),
}

impl SolverScope {
    pub fn accepts(&self, where_tag: &str) -> bool {
        match self {
            SolverScope::Any => true,
            SolverScope::Tag(tag) => tag == where_tag,
        }
    }
}

/// A configured solver context, open or not.
#[derive(Debug, Clone)]
pub struct SolverProfile {
    pub id: String,
    pub scope: SolverScope,
}

impl SolverProfile {
    pub fn new(id: impl Into<String>, scope: SolverScope) -> Self {
        Self {
            id: id.into(),
            scope,
        }
    }
}

/// Front-end collaborator hosting the solver browser contexts. The pool
/// injects challenge context and receives one answer callback per
/// challenge via [`ManualSolverPool::complete`].
#[async_trait]
pub trait SolverHost: Send + Sync {
    /// Open the context for a profile; `false` means it could not open.
    async fn open(&self, profile: &SolverProfile) -> bool;
    /// Show a challenge in an open context.
    async fn present(&self, solver_id: &str, request: &ChallengeRequest);
    /// Return an open context to its neutral state.
    async fn clear(&self, solver_id: &str);
    /// Tear the context down.
    async fn close(&self, solver_id: &str);
}

struct PendingManual {
    request: ChallengeRequest,
    respond: oneshot::Sender<ChallengeOutcome>,
}

struct SolverState {
    profile: SolverProfile,
    open: bool,
    current: Option<PendingManual>,
}

impl SolverState {
    fn is_idle(&self) -> bool {
        self.open && self.current.is_none()
    }
}

#[derive(Default)]
struct PoolInner {
    solvers: Vec<SolverState>,
    queue: VecDeque<PendingManual>,
}

// Host actions are executed after the pool lock is released; the lock only
// guards the assignment decision itself.
enum HostAction {
    Open(SolverProfile),
    Present(String, ChallengeRequest),
    Clear(String),
    Close(String),
}

/// Pool of human-assisted solver contexts.
pub struct ManualSolverPool {
    host: Arc<dyn SolverHost>,
    inner: Mutex<PoolInner>,
}

impl ManualSolverPool {
    pub fn new(host: Arc<dyn SolverHost>) -> Self {
        Self {
            host,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Register a solver profile without opening it.
    pub fn register(&self, profile: SolverProfile) {
        let mut inner = self.inner.lock().expect("solver pool poisoned");
        inner.solvers.push(SolverState {
            profile,
            open: false,
            current: None,
        });
    }

    /// Submit a challenge for human solving. Resolves to the answer, or to
    /// `Abandoned` when the pool is torn down or the challenge canceled.
    pub async fn submit(&self, request: ChallengeRequest) -> oneshot::Receiver<ChallengeOutcome> {
        let (respond, receiver) = oneshot::channel();
        let pending = PendingManual { request, respond };

        let actions = {
            let mut inner = self.inner.lock().expect("solver pool poisoned");
            Self::place(&mut inner, pending)
        };
        self.run_actions(actions).await;
        receiver
    }

    /// Route a solver's answer back and immediately hand the freed solver
    /// the next queued, scope-compatible challenge.
    pub async fn complete(&self, solver_id: &str, answer: ChallengeAnswer) {
        let (finished, actions) = {
            let mut inner = self.inner.lock().expect("solver pool poisoned");
            let Some(solver) = inner.solvers.iter_mut().find(|s| s.profile.id == solver_id)
            else {
                return;
            };
            // Dequeue the completed challenge before reassigning, or a
            // second completion could double-assign the freed solver.
            let Some(finished) = solver.current.take() else {
                return;
            };

            let scope = solver.profile.scope.clone();
            let next = Self::pop_compatible(&mut inner.queue, &scope);
            let actions = match next {
                Some(pending) => {
                    let request = pending.request.clone();
                    inner
                        .solvers
                        .iter_mut()
                        .find(|s| s.profile.id == solver_id)
                        .expect("solver disappeared mid-completion")
                        .current = Some(pending);
                    vec![HostAction::Present(solver_id.to_string(), request)]
                }
                None => vec![HostAction::Clear(solver_id.to_string())],
            };
            (finished, actions)
        };

        let _ = finished
            .respond
            .send(ChallengeOutcome::Answered(answer));
        self.run_actions(actions).await;
    }

    /// Handle a solver context closing, possibly mid-challenge: hand the
    /// active challenge to another idle compatible solver, or park it and
    /// try to reopen a replacement.
    pub async fn solver_closed(&self, solver_id: &str) {
        let actions = {
            let mut inner = self.inner.lock().expect("solver pool poisoned");
            let Some(pos) = inner
                .solvers
                .iter()
                .position(|s| s.profile.id == solver_id)
            else {
                return;
            };
            inner.solvers[pos].open = false;
            let Some(orphan) = inner.solvers[pos].current.take() else {
                return;
            };
            // The replacement candidate must be a different profile; the
            // context that just closed is not reopened behind the user.
            Self::place_excluding(&mut inner, orphan, Some(solver_id))
        };
        self.run_actions(actions).await;
    }

    /// Cancel a queued or active challenge, resolving its wait to
    /// `Abandoned`.
    pub async fn cancel(&self, challenge_id: &str) {
        let (canceled, actions) = {
            let mut inner = self.inner.lock().expect("solver pool poisoned");
            if let Some(pos) = inner
                .queue
                .iter()
                .position(|p| p.request.id == challenge_id)
            {
                (inner.queue.remove(pos), Vec::new())
            } else if let Some(solver) = inner
                .solvers
                .iter_mut()
                .find(|s| {
                    s.current
                        .as_ref()
                        .is_some_and(|p| p.request.id == challenge_id)
                })
            {
                let canceled = solver.current.take();
                (canceled, vec![HostAction::Clear(solver.profile.id.clone())])
            } else {
                (None, Vec::new())
            }
        };

        if let Some(pending) = canceled {
            let _ = pending.respond.send(ChallengeOutcome::Abandoned);
        }
        self.run_actions(actions).await;
    }

    /// Tear down every context and abandon everything pending.
    pub async fn close_all(&self) {
        let (abandoned, actions) = {
            let mut inner = self.inner.lock().expect("solver pool poisoned");
            let mut abandoned: Vec<PendingManual> = inner.queue.drain(..).collect();
            let mut actions = Vec::new();
            for solver in &mut inner.solvers {
                if let Some(pending) = solver.current.take() {
                    abandoned.push(pending);
                }
                if solver.open {
                    solver.open = false;
                    actions.push(HostAction::Close(solver.profile.id.clone()));
                }
            }
            (abandoned, actions)
        };

        for pending in abandoned {
            let _ = pending.respond.send(ChallengeOutcome::Abandoned);
        }
        self.run_actions(actions).await;
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().expect("solver pool poisoned").queue.len()
    }

    pub fn idle_compatible(&self, where_tag: &str) -> bool {
        self.inner
            .lock()
            .expect("solver pool poisoned")
            .solvers
            .iter()
            .any(|s| s.is_idle() && s.profile.scope.accepts(where_tag))
    }

    /// Place a pending challenge: first idle compatible solver wins, then
    /// an unopened compatible profile is opened on demand, then the queue.
    fn place(inner: &mut PoolInner, pending: PendingManual) -> Vec<HostAction> {
        Self::place_excluding(inner, pending, None)
    }

    fn place_excluding(
        inner: &mut PoolInner,
        pending: PendingManual,
        exclude: Option<&str>,
    ) -> Vec<HostAction> {
        let tag = pending.request.where_tag.clone();

        if let Some(solver) = inner
            .solvers
            .iter_mut()
            .find(|s| s.is_idle() && s.profile.scope.accepts(&tag))
        {
            let id = solver.profile.id.clone();
            let request = pending.request.clone();
            solver.current = Some(pending);
            return vec![HostAction::Present(id, request)];
        }

        if let Some(solver) = inner.solvers.iter_mut().find(|s| {
            !s.open
                && s.current.is_none()
                && s.profile.scope.accepts(&tag)
                && exclude != Some(s.profile.id.as_str())
        }) {
            // Marked open optimistically; `run_actions` reverts on failure.
            solver.open = true;
            let profile = solver.profile.clone();
            let request = pending.request.clone();
            solver.current = Some(pending);
            return vec![
                HostAction::Open(profile.clone()),
                HostAction::Present(profile.id, request),
            ];
        }

        inner.queue.push_back(pending);
        Vec::new()
    }

    fn pop_compatible(
        queue: &mut VecDeque<PendingManual>,
        scope: &SolverScope,
    ) -> Option<PendingManual> {
        let pos = queue
            .iter()
            .position(|p| scope.accepts(&p.request.where_tag))?;
        queue.remove(pos)
    }

    async fn run_actions(&self, actions: Vec<HostAction>) {
        let mut opened_ok = true;
        for action in actions {
            match action {
                HostAction::Open(profile) => {
                    opened_ok = self.host.open(&profile).await;
                    if !opened_ok {
                        log::warn!("solver {} failed to open", profile.id);
                        self.revert_open(&profile.id).await;
                    }
                }
                HostAction::Present(id, request) => {
                    if opened_ok {
                        self.host.present(&id, &request).await;
                    }
                }
                HostAction::Clear(id) => self.host.clear(&id).await,
                HostAction::Close(id) => self.host.close(&id).await,
            }
        }
    }

    async fn revert_open(&self, solver_id: &str) {
        let requeued = {
            let mut inner = self.inner.lock().expect("solver pool poisoned");
            let solver = inner
                .solvers
                .iter_mut()
                .find(|s| s.profile.id == solver_id);
            if let Some(solver) = solver {
                solver.open = false;
                solver.current.take()
            } else {
                None
            }
        };
        if let Some(pending) = requeued {
            let mut inner = self.inner.lock().expect("solver pool poisoned");
            inner.queue.push_front(pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::challenges::ChallengeKind;

    #[derive(Default)]
    struct RecordingHost {
        log: StdMutex<Vec<String>>,
        refuse_open: bool,
    }

    #[async_trait]
    impl SolverHost for RecordingHost {
        async fn open(&self, profile: &SolverProfile) -> bool {
            self.log.lock().unwrap().push(format!("open:{}", profile.id));
            !self.refuse_open
        }
        async fn present(&self, solver_id: &str, request: &ChallengeRequest) {
            self.log
                .lock()
                .unwrap()
                .push(format!("present:{solver_id}:{}", request.id));
        }
        async fn clear(&self, solver_id: &str) {
            self.log.lock().unwrap().push(format!("clear:{solver_id}"));
        }
        async fn close(&self, solver_id: &str) {
            self.log.lock().unwrap().push(format!("close:{solver_id}"));
        }
    }

    fn challenge(id: &str, tag: &str) -> ChallengeRequest {
        ChallengeRequest::new(
            id,
            format!("task-{id}"),
            tag,
            ChallengeKind::RecaptchaV2,
            "https://store.example/checkout",
        )
    }

    fn pool_with(host: Arc<RecordingHost>, profiles: &[(&str, SolverScope)]) -> ManualSolverPool {
        let pool = ManualSolverPool::new(host);
        for (id, scope) in profiles {
            pool.register(SolverProfile::new(*id, scope.clone()));
        }
        pool
    }

    #[tokio::test]
    async fn two_solvers_three_challenges_queues_the_third() {
        let host = Arc::new(RecordingHost::default());
        let pool = pool_with(
            host.clone(),
            &[
                ("s1", SolverScope::Tag("A".into())),
                ("s2", SolverScope::Tag("A".into())),
            ],
        );

        let _rx1 = pool.submit(challenge("c1", "A")).await;
        let _rx2 = pool.submit(challenge("c2", "A")).await;
        let rx3 = pool.submit(challenge("c3", "A")).await;
        assert_eq!(pool.queued(), 1);

        // Completing the first challenge immediately hands c3 to s1.
        pool.complete("s1", ChallengeAnswer::Token("tok".into())).await;
        assert_eq!(pool.queued(), 0);
        assert!(
            host.log
                .lock()
                .unwrap()
                .contains(&"present:s1:c3".to_string())
        );
        drop(rx3);
    }

    #[tokio::test]
    async fn wildcard_and_exact_scopes_compete_equally() {
        let host = Arc::new(RecordingHost::default());
        let pool = pool_with(
            host.clone(),
            &[
                ("wild", SolverScope::Any),
                ("exact", SolverScope::Tag("A".into())),
            ],
        );

        let _rx = pool.submit(challenge("c1", "A")).await;
        // First registered match wins; no exact-over-wildcard preference.
        assert!(
            host.log
                .lock()
                .unwrap()
                .contains(&"present:wild:c1".to_string())
        );
    }

    #[tokio::test]
    async fn unopened_profile_opens_on_demand() {
        let host = Arc::new(RecordingHost::default());
        let pool = pool_with(host.clone(), &[("s1", SolverScope::Any)]);

        let _rx = pool.submit(challenge("c1", "A")).await;
        let log = host.log.lock().unwrap().clone();
        assert_eq!(log, vec!["open:s1".to_string(), "present:s1:c1".to_string()]);
    }

    #[tokio::test]
    async fn closing_a_busy_solver_hands_the_challenge_over() {
        let host = Arc::new(RecordingHost::default());
        let pool = pool_with(
            host.clone(),
            &[
                ("s1", SolverScope::Tag("A".into())),
                ("s2", SolverScope::Tag("A".into())),
            ],
        );

        let _rx1 = pool.submit(challenge("c1", "A")).await;
        let _rx2 = pool.submit(challenge("c2", "A")).await;

        // s2 closes holding c2; s1 is busy, so c2 reopens... no idle solver
        // exists, so the pool queues it and no double assignment happens.
        pool.solver_closed("s2").await;
        assert_eq!(pool.queued(), 1);

        pool.complete("s1", ChallengeAnswer::Token("tok".into())).await;
        assert!(
            host.log
                .lock()
                .unwrap()
                .contains(&"present:s1:c2".to_string())
        );
    }

    #[tokio::test]
    async fn completion_resolves_the_waiter() {
        let host = Arc::new(RecordingHost::default());
        let pool = pool_with(host, &[("s1", SolverScope::Any)]);

        let rx = pool.submit(challenge("c1", "A")).await;
        pool.complete("s1", ChallengeAnswer::Text("blue".into())).await;
        assert_eq!(
            rx.await.unwrap(),
            ChallengeOutcome::Answered(ChallengeAnswer::Text("blue".into()))
        );
    }

    #[tokio::test]
    async fn close_all_abandons_pending_waits() {
        let host = Arc::new(RecordingHost::default());
        let pool = pool_with(host, &[("s1", SolverScope::Any)]);

        let rx1 = pool.submit(challenge("c1", "A")).await;
        let rx2 = pool.submit(challenge("c2", "A")).await;
        pool.close_all().await;

        assert_eq!(rx1.await.unwrap(), ChallengeOutcome::Abandoned);
        assert_eq!(rx2.await.unwrap(), ChallengeOutcome::Abandoned);
    }

    #[tokio::test]
    async fn queue_never_coexists_with_idle_compatible_solver() {
        let host = Arc::new(RecordingHost::default());
        let pool = pool_with(
            host,
            &[
                ("s1", SolverScope::Tag("A".into())),
                ("s2", SolverScope::Tag("B".into())),
            ],
        );

        let _rx = pool.submit(challenge("c1", "A")).await;
        let _rx2 = pool.submit(challenge("c2", "A")).await;
        // c2 queued even though s2 is idle: s2 is not scope-compatible.
        assert_eq!(pool.queued(), 1);
        assert!(!pool.idle_compatible("A"));
        assert!(pool.idle_compatible("B"));
    }
}
