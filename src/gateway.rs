//! Queue-gateway client.
//!
//! Some stores front their checkout with a third-party waiting room. A
//! worker that lands in one polls the gateway until it is waved through and
//! receives clearance cookies. A shut-down worker gets `Abandoned`, never
//! an error.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::workers::http::{HttpSession, SessionError};
use crate::workers::step::ShutdownFlag;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("gateway payload malformed: {0}")]
    Payload(reqwest::Error),
}

/// How a queue wait ended.
#[derive(Debug, PartialEq)]
pub enum GatewayOutcome {
    /// Waved through; carries the clearance cookies to replay at checkout.
    Passed(Vec<(String, String)>),
    /// The wait was canceled by shutdown.
    Abandoned,
}

#[derive(Debug, Deserialize)]
struct CookiePayload {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PollReply {
    status: String,
    #[serde(default)]
    cookies: Vec<CookiePayload>,
}

/// Polls a queue gateway on a fixed interval.
pub struct QueueGatewayClient {
    session: Arc<HttpSession>,
    poll_interval: Duration,
}

impl QueueGatewayClient {
    pub fn new(session: Arc<HttpSession>) -> Self {
        Self {
            session,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait out the queue at `queue_url`. Resolves to `Passed` with the
    /// clearance cookies, or `Abandoned` once the shutdown flag is raised.
    pub async fn pass(
        &self,
        queue_url: &str,
        shutdown: &ShutdownFlag,
    ) -> Result<GatewayOutcome, GatewayError> {
        loop {
            if shutdown.is_triggered() {
                return Ok(GatewayOutcome::Abandoned);
            }

            let response = self.session.get(queue_url).await?;
            let reply = response
                .json::<PollReply>()
                .await
                .map_err(GatewayError::Payload)?;

            if reply.status == "passed" {
                let cookies = reply
                    .cookies
                    .into_iter()
                    .map(|c| (c.name, c.value))
                    .collect();
                return Ok(GatewayOutcome::Passed(cookies));
            }

            log::debug!("still queued at {queue_url} ({})", reply.status);
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.triggered() => return Ok(GatewayOutcome::Abandoned),
            }
        }
    }
}
