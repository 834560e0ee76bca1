//! Adapter for acceptance-code solving services (protocol "ack poll").
//!
//! Flow: POST the job, receive a job id plus an acceptance code, then poll
//! with both until the reply stops saying `processing` and carries the
//! terminal payload.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use url::Url;

use super::{ProviderConfig, SolverError, SolverJob, SolverProvider, SolverResult};
use crate::challenges::{ChallengeAnswer, ChallengeKind};

/// Submit/poll provider speaking the acceptance-code protocol.
pub struct AckPollProvider {
    api_key: String,
    base_url: Url,
    config: ProviderConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    id: String,
    acceptance_code: String,
}

#[derive(Debug, Deserialize)]
struct PollReply {
    state: String,
    #[serde(default)]
    solution: Option<serde_json::Value>,
}

impl AckPollProvider {
    pub fn new(api_key: impl Into<String>, base_url: Url) -> Self {
        Self::with_config(api_key, base_url, ProviderConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, base_url: Url, config: ProviderConfig) -> Self {
        Self {
            api_key: api_key.into(),
            base_url,
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, SolverError> {
        self.base_url
            .join(path)
            .map_err(|err| SolverError::Configuration(format!("bad endpoint '{path}': {err}")))
    }

    async fn submit(&self, job: &SolverJob) -> Result<SubmitReply, SolverError> {
        let body = json!({
            "key": self.api_key,
            "kind": match job.kind {
                ChallengeKind::Datadome => "datadome",
                ChallengeKind::Geetest => "geetest",
                _ => "generic",
            },
            "url": job.url,
            "site_key": job.site_key,
            "user_agent": job.user_agent,
            "proxy": job.proxy,
            "render_params": job.render_params,
        });

        let reply = self
            .client
            .post(self.endpoint("jobs")?)
            .json(&body)
            .send()
            .await?;

        if !reply.status().is_success() {
            return Err(SolverError::Rejected(format!(
                "submit returned {}",
                reply.status()
            )));
        }

        reply
            .json()
            .await
            .map_err(|err| SolverError::Payload(err.to_string()))
    }

    async fn poll(&self, accepted: &SubmitReply) -> Result<PollReply, SolverError> {
        let reply = self
            .client
            .post(self.endpoint("poll")?)
            .json(&json!({
                "key": self.api_key,
                "id": accepted.id,
                "acceptance_code": accepted.acceptance_code,
            }))
            .send()
            .await?;

        reply
            .json()
            .await
            .map_err(|err| SolverError::Payload(err.to_string()))
    }
}

#[async_trait]
impl SolverProvider for AckPollProvider {
    fn name(&self) -> &'static str {
        "ackpoll"
    }

    fn supports(&self, kind: ChallengeKind) -> bool {
        matches!(kind, ChallengeKind::Datadome | ChallengeKind::Geetest)
    }

    async fn solve(&self, job: &SolverJob) -> SolverResult {
        let accepted = self.submit(job).await?;
        log::debug!(
            "{} accepted job {} (code {}) for task {}",
            self.name(),
            accepted.id,
            accepted.acceptance_code,
            job.task_id
        );

        for _ in 0..self.config.max_polls {
            sleep(self.config.poll_interval).await;

            let reply = self.poll(&accepted).await?;
            if reply.state == "processing" {
                continue;
            }
            let payload = reply
                .solution
                .ok_or_else(|| SolverError::Payload("terminal state without solution".into()))?;
            return Ok(ChallengeAnswer::Payload(payload));
        }

        Err(SolverError::Timeout(self.config.max_polls))
    }
}
