//! Adapter for submit-then-poll solving services (protocol "job poll").
//!
//! Flow: POST the job, receive a job id, then poll at a fixed interval
//! until the service reports `solved` or `unsolvable`. `unsolvable` is a
//! terminal verdict for the job.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use url::Url;

use super::{ProviderConfig, SolverError, SolverJob, SolverProvider, SolverResult};
use crate::challenges::{ChallengeAnswer, ChallengeKind};

/// Submit/poll provider speaking the job-id protocol.
pub struct JobPollProvider {
    api_key: String,
    base_url: Url,
    config: ProviderConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PollReply {
    status: String,
    token: Option<String>,
}

impl JobPollProvider {
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

    async fn submit(&self, job: &SolverJob) -> Result<String, SolverError> {
        let body = json!({
            "key": self.api_key,
            "kind": kind_tag(job.kind),
            "url": job.url,
            "site_key": job.site_key,
            "user_agent": job.user_agent,
            "proxy": job.proxy,
            "action": job.action,
            "min_score": job.min_score,
        });

        let reply = self
            .client
            .post(self.endpoint("submit")?)
            .json(&body)
            .send()
            .await?;

        if !reply.status().is_success() {
            return Err(SolverError::Rejected(format!(
                "submit returned {}",
                reply.status()
            )));
        }

        let parsed: SubmitReply = reply
            .json()
            .await
            .map_err(|err| SolverError::Payload(err.to_string()))?;
        Ok(parsed.id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollReply, SolverError> {
        let url = self.endpoint(&format!("result/{job_id}"))?;
        let reply = self
            .client
            .get(url)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        reply
            .json()
            .await
            .map_err(|err| SolverError::Payload(err.to_string()))
    }
}

#[async_trait]
impl SolverProvider for JobPollProvider {
    fn name(&self) -> &'static str {
        "jobpoll"
    }

    fn supports(&self, kind: ChallengeKind) -> bool {
        matches!(
            kind,
            ChallengeKind::RecaptchaV2
                | ChallengeKind::RecaptchaV3
                | ChallengeKind::HCaptcha
                | ChallengeKind::Geetest
        )
    }

    async fn solve(&self, job: &SolverJob) -> SolverResult {
        let job_id = self.submit(job).await?;
        log::debug!("{} accepted job {} for task {}", self.name(), job_id, job.task_id);

        for _ in 0..self.config.max_polls {
            sleep(self.config.poll_interval).await;

            let reply = self.poll(&job_id).await?;
            match reply.status.as_str() {
                "queued" | "processing" => continue,
                "solved" => {
                    let token = reply
                        .token
                        .ok_or_else(|| SolverError::Payload("solved without token".into()))?;
                    return Ok(ChallengeAnswer::Token(token));
                }
                "unsolvable" => return Err(SolverError::Unsolvable),
                other => {
                    return Err(SolverError::Payload(format!("unknown status '{other}'")));
                }
            }
        }

        Err(SolverError::Timeout(self.config.max_polls))
    }
}

fn kind_tag(kind: ChallengeKind) -> &'static str {
    match kind {
        ChallengeKind::RecaptchaV2 => "recaptcha_v2",
        ChallengeKind::RecaptchaV3 => "recaptcha_v3",
        ChallengeKind::HCaptcha => "hcaptcha",
        ChallengeKind::Geetest => "geetest",
        ChallengeKind::Datadome => "datadome",
        ChallengeKind::Queue => "queue",
        ChallengeKind::Question => "question",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

    fn provider(server: &MockServer) -> JobPollProvider {
        JobPollProvider::with_config(
            "test-key",
            Url::parse(&server.uri()).unwrap().join("/").unwrap(),
            ProviderConfig {
                poll_interval: Duration::from_millis(5),
                max_polls: 5,
            },
        )
    }

    fn job() -> SolverJob {
        SolverJob {
            task_id: "t1".into(),
            kind: ChallengeKind::RecaptchaV2,
            url: "https://store.example/checkout".into(),
            site_key: Some("sk".into()),
            user_agent: None,
            proxy: None,
            action: None,
            min_score: None,
            render_params: Default::default(),
        }
    }

    /// First poll answers "processing", second "solved".
    struct SolveOnSecondPoll {
        polls: std::sync::atomic::AtomicUsize,
    }

    impl Respond for SolveOnSecondPoll {
        fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
            let n = self.polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "processing"
                }))
            } else {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "solved",
                    "token": "tok-123"
                }))
            }
        }
    }

    #[tokio::test]
    async fn polls_until_solved() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "job-1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/result/job-1"))
            .respond_with(SolveOnSecondPoll {
                polls: Default::default(),
            })
            .mount(&server)
            .await;

        let answer = provider(&server).solve(&job()).await.unwrap();
        assert_eq!(answer, ChallengeAnswer::Token("tok-123".into()));
    }

    #[tokio::test]
    async fn unsolvable_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "job-2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/result/job-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "unsolvable"
            })))
            .mount(&server)
            .await;

        let err = provider(&server).solve(&job()).await.unwrap_err();
        assert!(matches!(err, SolverError::Unsolvable));
    }

    #[tokio::test]
    async fn polling_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "job-3"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/result/job-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "queued"
            })))
            .mount(&server)
            .await;

        let err = provider(&server).solve(&job()).await.unwrap_err();
        assert!(matches!(err, SolverError::Timeout(5)));
    }
}
