//! Per-worker HTTP session.
//!
//! Wraps a pool of reqwest clients keyed by proxy endpoint so a worker can
//! swap proxies mid-run without losing cookies for the endpoints it already
//! used. Transient failures get exactly one immediate retry; everything
//! after that is the step handler's recoverable-error problem.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid proxy endpoint {0}")]
    Proxy(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// When a non-error response still warrants the single automatic retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Statuses the store uses as soft blocks rather than real answers.
    pub soft_block_statuses: Vec<StatusCode>,
    /// Whether 5xx responses get the retry too.
    pub retry_server_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            soft_block_statuses: vec![StatusCode::TOO_MANY_REQUESTS],
            retry_server_errors: true,
        }
    }
}

impl RetryPolicy {
    fn wants_retry(&self, status: StatusCode) -> bool {
        self.soft_block_statuses.contains(&status)
            || (self.retry_server_errors && status.is_server_error())
    }
}

/// Reqwest client pool keyed by proxy endpoint.
struct ClientPool {
    base_headers: HeaderMap,
    timeout: Duration,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ClientPool {
    fn new(base_headers: HeaderMap, timeout: Duration) -> Self {
        Self {
            base_headers,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: Option<&str>) -> SessionResult<Client> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .default_headers(self.base_headers.clone());

        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|_| SessionError::Proxy(endpoint.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build()?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

/// One worker's HTTP identity: cookies, user agent, current proxy.
pub struct HttpSession {
    pool: ClientPool,
    proxy: RwLock<Option<String>>,
    policy: RetryPolicy,
}

impl HttpSession {
    pub fn new(user_agent: &str) -> Self {
        Self::with_policy(user_agent, RetryPolicy::default())
    }

    pub fn with_policy(user_agent: &str, policy: RetryPolicy) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }
        Self {
            pool: ClientPool::new(headers, Duration::from_secs(15)),
            proxy: RwLock::new(None),
            policy,
        }
    }

    /// Swap the proxy for subsequent requests. Cookies for the previous
    /// proxy's client stay in the pool.
    pub fn set_proxy(&self, proxy: Option<String>) {
        *self.proxy.write().expect("proxy slot poisoned") = proxy;
    }

    pub fn proxy(&self) -> Option<String> {
        self.proxy.read().expect("proxy slot poisoned").clone()
    }

    pub async fn get(&self, url: &str) -> SessionResult<Response> {
        self.execute(|client| client.get(url)).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> SessionResult<Response> {
        self.execute(|client| client.post(url).json(body)).await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &HashMap<String, String>,
    ) -> SessionResult<Response> {
        self.execute(|client| client.post(url).form(form)).await
    }

    pub async fn delete(&self, url: &str) -> SessionResult<Response> {
        self.execute(|client| client.delete(url)).await
    }

    /// Send with at most one immediate retry: once on a connect, timeout,
    /// or socket-reset failure, once on a status the policy flags.
    async fn execute<F>(&self, build: F) -> SessionResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let proxy = self.proxy();
        let client = self.pool.client(proxy.as_deref()).await?;

        match build(&client).send().await {
            Ok(response) if self.policy.wants_retry(response.status()) => {
                log::debug!(
                    "retrying {} after soft status {}",
                    response.url(),
                    response.status()
                );
                Ok(build(&client).send().await?)
            }
            Ok(response) => Ok(response),
            Err(err) if err.is_connect() || err.is_timeout() || chains_to_reset(&err) => {
                log::debug!("retrying after transport error: {err}");
                Ok(build(&client).send().await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// A reset after the connection is established surfaces as a body error
/// wrapping an io error; walk the source chain to find it.
fn chains_to_reset(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            )
        {
            return true;
        }
        source = cause.source();
    }
    false
}
