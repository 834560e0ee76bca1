//! Buyer workflow.
//!
//! A buyer parks on the product cache until a monitor publishes a matching
//! stocked product, then walks add-to-cart and checkout. Queue gateways and
//! challenges interrupt the flow; both resolve back into it without ending
//! the run.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use crate::challenges::router::ChallengeRouter;
use crate::challenges::{ChallengeAnswer, ChallengeKind, ChallengeOutcome, ChallengeRequest};
use crate::gateway::{GatewayOutcome, QueueGatewayClient};
use crate::products::matching::MonitorTarget;
use crate::products::{CachedProduct, ProductCache, Variant};
use crate::tasks::{BuyerSpec, Severity, TaskSpec};
use crate::workers::Worker;
use crate::workers::step::{Step, StepFault, StepGraph, StepOutcome};

/// Workflow state for one buyer.
pub struct BuyerWorker {
    pub worker: Worker,
    pub target: MonitorTarget,
    pub spec: BuyerSpec,
    pub cache: Arc<ProductCache>,
    pub gateway: QueueGatewayClient,
    pub router: Arc<ChallengeRouter>,
    pub retry_delay: Duration,
    product: Option<CachedProduct>,
    variant: Option<Variant>,
    token: Option<String>,
    clearance: Vec<(String, String)>,
}

impl BuyerWorker {
    pub fn new(
        worker: Worker,
        target: MonitorTarget,
        spec: BuyerSpec,
        cache: Arc<ProductCache>,
        router: Arc<ChallengeRouter>,
    ) -> Self {
        let gateway = QueueGatewayClient::new(worker.session.clone());
        Self {
            worker,
            target,
            spec,
            cache,
            gateway,
            router,
            retry_delay: Duration::from_secs(2),
            product: None,
            variant: None,
            token: None,
            clearance: Vec::new(),
        }
    }

    fn checkout_payload(&self) -> serde_json::Value {
        json!({
            "identifier": self.product.as_ref().map(|p| p.identifier.clone()),
            "variant": self.variant.as_ref().map(|v| v.id.clone()),
            "token": self.token,
            "clearance": self.clearance,
        })
    }

    fn absorb_answer(&mut self, answer: ChallengeAnswer) {
        match answer {
            ChallengeAnswer::Token(token) | ChallengeAnswer::Text(token) => {
                self.token = Some(token);
            }
            ChallengeAnswer::Cookies(cookies) => self.clearance.extend(cookies),
            ChallengeAnswer::Payload(value) => self.token = Some(value.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChallengePayload {
    kind: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    site_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoreReply {
    status: String,
    #[serde(default)]
    queue_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    challenge: Option<ChallengePayload>,
}

fn parse_kind(tag: &str) -> Option<ChallengeKind> {
    match tag {
        "recaptcha_v2" => Some(ChallengeKind::RecaptchaV2),
        "recaptcha_v3" => Some(ChallengeKind::RecaptchaV3),
        "hcaptcha" => Some(ChallengeKind::HCaptcha),
        "geetest" => Some(ChallengeKind::Geetest),
        "datadome" => Some(ChallengeKind::Datadome),
        "queue" => Some(ChallengeKind::Queue),
        "question" => Some(ChallengeKind::Question),
        _ => None,
    }
}

/// Park on the cache until a matching, stocked, size-accepted product
/// appears.
pub struct AwaitProduct;

#[async_trait]
impl Step<BuyerWorker> for AwaitProduct {
    async fn run(&self, state: &mut BuyerWorker) -> Result<StepOutcome, StepFault> {
        state.worker.set_status("waiting for product", Severity::Info);

        let (tx, rx) = oneshot::channel::<CachedProduct>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let store = state.worker.store().to_string();
        let target = state.target.clone();
        let spec = state.spec.clone();

        let listener = state.cache.subscribe(move |product| {
            if product.store != store || !target.matches(product) {
                return crate::products::ListenerDecision::Keep;
            }
            if !product.stocked().any(|v| spec.accepts_size(&v.size)) {
                return crate::products::ListenerDecision::Keep;
            }
            // A second invocation before removal completes finds the slot
            // already empty and does nothing.
            if let Some(sender) = slot.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = sender.send(product.clone());
            }
            crate::products::ListenerDecision::Remove
        });

        let product = tokio::select! {
            product = rx => match product {
                Ok(product) => product,
                Err(_) => {
                    state.cache.unsubscribe(listener);
                    return Ok(StepOutcome::Retry(state.retry_delay));
                }
            },
            _ = state.worker.shutdown.triggered() => {
                state.cache.unsubscribe(listener);
                return Ok(StepOutcome::Retry(Duration::ZERO));
            }
        };

        let variant = product
            .stocked()
            .find(|v| state.spec.accepts_size(&v.size))
            .cloned();
        state
            .worker
            .set_status(format!("matched {}", product.title), Severity::Success);

        if let Ok(mut task) = state.worker.task().lock()
            && let TaskSpec::Buyer(ref mut spec) = task.spec
        {
            spec.product = Some(product.clone());
        }
        state.product = Some(product);
        state.variant = variant;
        Ok(StepOutcome::Goto("add-to-cart"))
    }
}

/// Add the chosen variant to the cart, passing any queue gateway the store
/// raises.
pub struct AddToCart;

#[async_trait]
impl Step<BuyerWorker> for AddToCart {
    async fn run(&self, state: &mut BuyerWorker) -> Result<StepOutcome, StepFault> {
        let url = format!("{}/cart", state.spec.checkout_url);
        let payload = state.checkout_payload();

        let response = match state.worker.session.post_json(&url, &payload).await {
            Ok(response) => response,
            Err(err) => {
                log::debug!("add-to-cart transport error: {err}");
                state.worker.set_status("connection error", Severity::Warning);
                return Ok(StepOutcome::Retry(state.retry_delay));
            }
        };
        if !response.status().is_success() {
            state.worker.set_status(
                format!("cart rejected ({})", response.status()),
                Severity::Warning,
            );
            if response.status().as_u16() == 403 || response.status().as_u16() == 429 {
                state.worker.request_rotation();
            }
            return Ok(StepOutcome::Retry(state.retry_delay));
        }

        let reply = match response.json::<StoreReply>().await {
            Ok(reply) => reply,
            Err(err) => {
                log::debug!("add-to-cart bad payload: {err}");
                state.worker.set_status("invalid cart reply", Severity::Warning);
                return Ok(StepOutcome::Retry(state.retry_delay));
            }
        };

        match reply.status.as_str() {
            "ok" => {
                state.worker.set_status("added to cart", Severity::Info);
                Ok(StepOutcome::Goto("checkout"))
            }
            "queued" => {
                let Some(queue_url) = reply.queue_url else {
                    state
                        .worker
                        .set_status("queue reply missing url", Severity::Warning);
                    return Ok(StepOutcome::Retry(state.retry_delay));
                };
                state.worker.queue_entered();
                state.worker.set_status("waiting in queue", Severity::Info);
                match state.gateway.pass(&queue_url, &state.worker.shutdown).await {
                    Ok(GatewayOutcome::Passed(cookies)) => {
                        state.clearance.extend(cookies);
                        state.worker.queue_passed();
                        state.worker.set_status("queue passed", Severity::Info);
                        Ok(StepOutcome::Retry(Duration::ZERO))
                    }
                    Ok(GatewayOutcome::Abandoned) => Ok(StepOutcome::Retry(Duration::ZERO)),
                    Err(err) => {
                        log::debug!("queue gateway error: {err}");
                        state.worker.set_status("queue error", Severity::Warning);
                        Ok(StepOutcome::Retry(state.retry_delay))
                    }
                }
            }
            other => {
                state
                    .worker
                    .set_status(format!("cart status '{other}'"), Severity::Warning);
                Ok(StepOutcome::Retry(state.retry_delay))
            }
        }
    }
}

/// Submit checkout, resolving challenges through the router until the
/// store accepts or declines.
pub struct Checkout;

#[async_trait]
impl Step<BuyerWorker> for Checkout {
    async fn run(&self, state: &mut BuyerWorker) -> Result<StepOutcome, StepFault> {
        let url = format!("{}/checkout", state.spec.checkout_url);
        let payload = state.checkout_payload();

        let response = match state.worker.session.post_json(&url, &payload).await {
            Ok(response) => response,
            Err(err) => {
                log::debug!("checkout transport error: {err}");
                state.worker.set_status("connection error", Severity::Warning);
                return Ok(StepOutcome::Retry(state.retry_delay));
            }
        };
        if !response.status().is_success() {
            state.worker.set_status(
                format!("checkout rejected ({})", response.status()),
                Severity::Warning,
            );
            return Ok(StepOutcome::Retry(state.retry_delay));
        }

        let reply = match response.json::<StoreReply>().await {
            Ok(reply) => reply,
            Err(err) => {
                log::debug!("checkout bad payload: {err}");
                state
                    .worker
                    .set_status("invalid checkout reply", Severity::Warning);
                return Ok(StepOutcome::Retry(state.retry_delay));
            }
        };

        match reply.status.as_str() {
            "ok" => {
                state.worker.set_status("checked out", Severity::Success);
                Ok(StepOutcome::Done)
            }
            "challenge" => {
                let Some(challenge) = reply.challenge else {
                    state
                        .worker
                        .set_status("challenge reply missing body", Severity::Warning);
                    return Ok(StepOutcome::Retry(state.retry_delay));
                };
                let Some(kind) = parse_kind(&challenge.kind) else {
                    state.worker.set_status(
                        format!("unknown challenge '{}'", challenge.kind),
                        Severity::Warning,
                    );
                    return Ok(StepOutcome::Retry(state.retry_delay));
                };

                let mut request = ChallengeRequest::new(
                    format!("{}-{:08x}", state.worker.task_id(), rand::random::<u32>()),
                    state.worker.task_id().clone(),
                    "checkout",
                    kind,
                    challenge.url.unwrap_or_else(|| url.clone()),
                );
                if let Some(site_key) = challenge.site_key {
                    request = request.with_site_key(site_key);
                }
                state.worker.challenge_needed(request.clone());
                state.worker.set_status("solving challenge", Severity::Info);

                let proxy = state.worker.session.proxy();
                match state
                    .router
                    .solve(&request, proxy, &state.worker.shutdown)
                    .await
                {
                    ChallengeOutcome::Answered(answer) => {
                        state.absorb_answer(answer);
                        Ok(StepOutcome::Retry(Duration::ZERO))
                    }
                    ChallengeOutcome::Abandoned => Ok(StepOutcome::Retry(Duration::ZERO)),
                }
            }
            "declined" => {
                let message = reply.message.unwrap_or_else(|| "order declined".into());
                state.worker.set_status(message.clone(), Severity::Error);
                Ok(StepOutcome::Fail(message))
            }
            other => {
                state
                    .worker
                    .set_status(format!("checkout status '{other}'"), Severity::Warning);
                Ok(StepOutcome::Retry(state.retry_delay))
            }
        }
    }
}

/// The buyer step graph: await, cart, checkout.
pub fn buyer_graph() -> StepGraph<BuyerWorker> {
    StepGraph::new("await-product")
        .insert("await-product", AwaitProduct)
        .insert("add-to-cart", AddToCart)
        .insert("checkout", Checkout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use crate::challenges::manual::{ManualSolverPool, SolverHost, SolverProfile, SolverScope};
    use crate::tasks::{Task, TaskSpec, shared};
    use crate::workers::WorkerEvent;
    use crate::workers::http::HttpSession;
    use crate::workers::step::ShutdownFlag;

    struct NullHost;

    #[async_trait]
    impl SolverHost for NullHost {
        async fn open(&self, _profile: &SolverProfile) -> bool {
            true
        }
        async fn present(&self, _solver_id: &str, _request: &ChallengeRequest) {}
        async fn clear(&self, _solver_id: &str) {}
        async fn close(&self, _solver_id: &str) {}
    }

    fn router() -> (Arc<ChallengeRouter>, Arc<ManualSolverPool>) {
        let pool = ManualSolverPool::new(Arc::new(NullHost));
        pool.register(SolverProfile::new("s1", SolverScope::Any));
        let pool = Arc::new(pool);
        (Arc::new(ChallengeRouter::new(pool.clone())), pool)
    }

    fn buyer(
        checkout_url: &str,
        cache: Arc<ProductCache>,
    ) -> (BuyerWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
        let spec = BuyerSpec {
            sizes: vec!["10".into()],
            checkout_url: checkout_url.into(),
            product: None,
        };
        let task = shared(Task::new(
            "t1",
            "g1",
            "shopify:kith",
            "nike dunk",
            TaskSpec::Buyer(spec.clone()),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(
            task,
            Arc::new(HttpSession::new("test-agent")),
            tx,
            ShutdownFlag::new(),
        );
        let (router, _) = router();
        let mut state = BuyerWorker::new(
            worker,
            MonitorTarget::parse("nike dunk"),
            spec,
            cache,
            router,
        );
        state.retry_delay = Duration::from_millis(5);
        (state, rx)
    }

    fn dunk(size: &str, in_stock: bool) -> CachedProduct {
        CachedProduct {
            store: "shopify:kith".into(),
            identifier: "DD1391-100".into(),
            title: "Nike Dunk Low Panda".into(),
            url: "https://kith.example/products/dunk-low".into(),
            variants: vec![Variant {
                id: format!("v{size}"),
                size: size.into(),
                in_stock,
            }],
        }
    }

    #[tokio::test]
    async fn cache_update_fulfills_the_waiting_buyer() {
        let cache = Arc::new(ProductCache::new());
        let (mut state, _rx) = buyer("https://kith.example", cache.clone());

        let publish = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cache.update(dunk("10", true));
            })
        };

        let outcome = AwaitProduct.run(&mut state).await.unwrap();
        publish.await.unwrap();

        assert_eq!(outcome, StepOutcome::Goto("add-to-cart"));
        assert_eq!(state.variant.as_ref().map(|v| v.size.as_str()), Some("10"));
        assert_eq!(cache.listener_count(), 0);
        // The resolved snapshot lands on the task.
        let task = state.worker.task().lock().unwrap();
        let TaskSpec::Buyer(ref spec) = task.spec else {
            panic!("buyer task lost its spec");
        };
        assert!(spec.product.is_some());
    }

    #[tokio::test]
    async fn wrong_size_updates_keep_the_buyer_waiting() {
        let cache = Arc::new(ProductCache::new());
        let (mut state, _rx) = buyer("https://kith.example", cache.clone());
        state.worker.shutdown.trigger();

        // Publish before the listener exists so only the select's shutdown
        // arm can resolve.
        cache.update(dunk("8", true));
        let outcome = AwaitProduct.run(&mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Retry(Duration::ZERO));
    }

    struct QueueThenOk {
        hits: AtomicU32,
        queue_url: String,
    }

    impl Respond for QueueThenOk {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.hits.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "queued",
                    "queue_url": self.queue_url,
                }))
            } else {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ok" }))
            }
        }
    }

    #[tokio::test]
    async fn queue_gateway_interrupts_and_resumes_the_cart() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "passed",
                "cookies": [{ "name": "queue-it", "value": "cleared" }],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cart"))
            .respond_with(QueueThenOk {
                hits: AtomicU32::new(0),
                queue_url: format!("{}/queue", server.uri()),
            })
            .mount(&server)
            .await;

        let cache = Arc::new(ProductCache::new());
        let (mut state, mut rx) = buyer(&server.uri(), cache);

        // First pass enters and clears the queue.
        let outcome = AddToCart.run(&mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Retry(Duration::ZERO));
        assert!(state.clearance.iter().any(|(name, _)| name == "queue-it"));

        // Second pass lands in the cart.
        let outcome = AddToCart.run(&mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Goto("checkout"));

        let mut saw_entered = false;
        let mut saw_passed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WorkerEvent::QueueEntered { .. } => saw_entered = true,
                WorkerEvent::QueuePassed { .. } => saw_passed = true,
                _ => {}
            }
        }
        assert!(saw_entered && saw_passed);
    }

    struct ChallengeUntilToken;

    impl Respond for ChallengeUntilToken {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body = String::from_utf8_lossy(&request.body);
            if body.contains("solved-token") {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ok" }))
            } else {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "challenge",
                    "challenge": { "kind": "question" },
                }))
            }
        }
    }

    #[tokio::test]
    async fn checkout_challenge_resolves_through_the_manual_pool() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout"))
            .respond_with(ChallengeUntilToken)
            .mount(&server)
            .await;

        let cache = Arc::new(ProductCache::new());
        let (mut state, _rx) = buyer(&server.uri(), cache);
        let (router, pool) = router();
        state.router = router;

        let completer = {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                pool.complete("s1", ChallengeAnswer::Text("solved-token".into()))
                    .await;
            })
        };

        let outcome = Checkout.run(&mut state).await.unwrap();
        completer.await.unwrap();
        assert_eq!(outcome, StepOutcome::Retry(Duration::ZERO));
        assert_eq!(state.token.as_deref(), Some("solved-token"));

        let outcome = Checkout.run(&mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Done);
    }

    #[tokio::test]
    async fn declined_checkout_fails_the_workflow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "declined",
                "message": "card declined",
            })))
            .mount(&server)
            .await;

        let cache = Arc::new(ProductCache::new());
        let (mut state, _rx) = buyer(&server.uri(), cache);
        let outcome = Checkout.run(&mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Fail("card declined".into()));
    }
}
