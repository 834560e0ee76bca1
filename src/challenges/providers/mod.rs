//! Paid solver provider adapters.
//!
//! These adapters give the router one interface over third-party solving
//! services regardless of their polling protocol. The router stays agnostic
//! of vendor wire formats while still retrieving challenge tokens.

mod ackpoll;
mod jobpoll;

pub use ackpoll::AckPollProvider;
pub use jobpoll::JobPollProvider;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::challenges::{ChallengeAnswer, ChallengeKind, ChallengeRequest};
use crate::tasks::TaskId;

/// Polling behaviour shared by the provider adapters. The poll count is
/// explicitly bounded; exhausting it surfaces as [`SolverError::Timeout`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }
}

/// Challenge details handed to a provider.
#[derive(Debug, Clone)]
pub struct SolverJob {
    pub task_id: TaskId,
    pub kind: ChallengeKind,
    pub url: String,
    pub site_key: Option<String>,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub action: Option<String>,
    pub min_score: Option<f64>,
    pub render_params: HashMap<String, String>,
}

impl SolverJob {
    pub fn from_request(request: &ChallengeRequest) -> Self {
        Self {
            task_id: request.task_id.clone(),
            kind: request.kind,
            url: request.url.clone(),
            site_key: request.site_key.clone(),
            user_agent: request.user_agent.clone(),
            proxy: None,
            action: None,
            min_score: None,
            render_params: HashMap::new(),
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

pub type SolverResult = Result<ChallengeAnswer, SolverError>;

/// Shared interface implemented by paid solving vendors.
#[async_trait]
pub trait SolverProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Challenge kinds this provider can take.
    fn supports(&self, kind: ChallengeKind) -> bool;

    async fn solve(&self, job: &SolverJob) -> SolverResult;
}

/// Errors surfaced by provider adapters.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("provider misconfigured: {0}")]
    Configuration(String),
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider rejected the job: {0}")]
    Rejected(String),
    /// Terminal "unsolvable" verdict; retrying the same job is pointless.
    #[error("provider reported the challenge unsolvable")]
    Unsolvable,
    #[error("provider polling exhausted after {0} attempts")]
    Timeout(u32),
    #[error("malformed provider payload: {0}")]
    Payload(String),
}

impl SolverError {
    /// Whether the router should re-raise the challenge after its fixed
    /// delay. Unsolvable is final for this job, but the challenge itself is
    /// still re-raised; only configuration errors are hopeless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SolverError::Configuration(_))
    }
}
