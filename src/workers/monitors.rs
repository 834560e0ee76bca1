//! Monitor worker backends.
//!
//! Three polling modes against a store: a direct SKU/stock endpoint, a
//! catalog feed scan, and a product-page scrape with embedded-JSON variant
//! extraction. Not-found, rate-limited, and forbidden responses are status
//! changes, never terminals; a monitor only stops when its shutdown flag
//! is raised.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::products::matching::MonitorTarget;
use crate::products::{CachedProduct, ProductCache, Variant};
use crate::tasks::{MonitorMode, Severity};
use crate::workers::Worker;
use crate::workers::step::{Step, StepFault, StepGraph, StepOutcome};

/// Workflow state for one monitor.
pub struct MonitorWorker {
    pub worker: Worker,
    pub target: MonitorTarget,
    pub endpoint: String,
    pub cache: Arc<ProductCache>,
    pub poll_delay: Duration,
}

impl MonitorWorker {
    pub fn new(
        worker: Worker,
        target: MonitorTarget,
        endpoint: String,
        cache: Arc<ProductCache>,
    ) -> Self {
        Self {
            worker,
            target,
            endpoint,
            cache,
            poll_delay: Duration::from_secs(3),
        }
    }

    fn publish(&self, product: CachedProduct) {
        self.worker
            .set_status(format!("found {}", product.title), Severity::Success);
        self.cache.update(product.clone());
        self.worker.product_found(product);
    }

    /// Blocking statuses are recoverable; 429 and 403 additionally ask the
    /// pool for a fresh proxy.
    fn handle_status(&self, status: StatusCode) -> StepOutcome {
        match status {
            StatusCode::NOT_FOUND => {
                self.worker.set_status("product not loaded", Severity::Info);
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.worker.set_status("rate limited", Severity::Warning);
                self.worker.request_rotation();
            }
            StatusCode::FORBIDDEN => {
                self.worker.set_status("request blocked", Severity::Warning);
                self.worker.request_rotation();
            }
            other => {
                self.worker
                    .set_status(format!("unexpected status {other}"), Severity::Warning);
            }
        }
        StepOutcome::Retry(self.poll_delay)
    }

    fn handle_payload(&self, product: CachedProduct) -> StepOutcome {
        if self.target.matches(&product) && product.stocked().next().is_some() {
            self.publish(product);
        } else {
            self.worker.set_status("waiting for stock", Severity::Info);
        }
        StepOutcome::Retry(self.poll_delay)
    }
}

#[derive(Debug, Deserialize)]
struct VariantPayload {
    id: String,
    size: String,
    #[serde(alias = "available")]
    in_stock: bool,
}

#[derive(Debug, Deserialize)]
struct ProductPayload {
    identifier: String,
    title: String,
    url: Option<String>,
    variants: Vec<VariantPayload>,
}

impl ProductPayload {
    fn into_product(self, store: &str, fallback_url: &str) -> CachedProduct {
        CachedProduct {
            store: store.to_string(),
            identifier: self.identifier,
            title: self.title,
            url: self.url.unwrap_or_else(|| fallback_url.to_string()),
            variants: self
                .variants
                .into_iter()
                .map(|v| Variant {
                    id: v.id,
                    size: v.size,
                    in_stock: v.in_stock,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogPayload {
    products: Vec<ProductPayload>,
}

/// Poll a direct SKU/stock endpoint returning one product document.
pub struct SkuPoll;

#[async_trait]
impl Step<MonitorWorker> for SkuPoll {
    async fn run(&self, state: &mut MonitorWorker) -> Result<StepOutcome, StepFault> {
        let response = match state.worker.session.get(&state.endpoint).await {
            Ok(response) => response,
            Err(err) => {
                log::debug!("sku poll transport error: {err}");
                state.worker.set_status("connection error", Severity::Warning);
                return Ok(StepOutcome::Retry(state.poll_delay));
            }
        };
        if !response.status().is_success() {
            return Ok(state.handle_status(response.status()));
        }

        match response.json::<ProductPayload>().await {
            Ok(payload) => {
                let product = payload.into_product(state.worker.store(), &state.endpoint);
                Ok(state.handle_payload(product))
            }
            Err(err) => {
                log::debug!("sku poll bad payload: {err}");
                state.worker.set_status("invalid stock payload", Severity::Warning);
                Ok(StepOutcome::Retry(state.poll_delay))
            }
        }
    }
}

/// Scan a catalog/search feed and publish the first matching stocked
/// product.
pub struct CatalogPoll;

#[async_trait]
impl Step<MonitorWorker> for CatalogPoll {
    async fn run(&self, state: &mut MonitorWorker) -> Result<StepOutcome, StepFault> {
        let response = match state.worker.session.get(&state.endpoint).await {
            Ok(response) => response,
            Err(err) => {
                log::debug!("catalog poll transport error: {err}");
                state.worker.set_status("connection error", Severity::Warning);
                return Ok(StepOutcome::Retry(state.poll_delay));
            }
        };
        if !response.status().is_success() {
            return Ok(state.handle_status(response.status()));
        }

        match response.json::<CatalogPayload>().await {
            Ok(payload) => {
                let store = state.worker.store().to_string();
                let hit = payload
                    .products
                    .into_iter()
                    .map(|p| p.into_product(&store, &state.endpoint))
                    .find(|p| state.target.matches(p) && p.stocked().next().is_some());
                match hit {
                    Some(product) => state.publish(product),
                    None => state.worker.set_status("no catalog match", Severity::Info),
                }
                Ok(StepOutcome::Retry(state.poll_delay))
            }
            Err(err) => {
                log::debug!("catalog poll bad payload: {err}");
                state
                    .worker
                    .set_status("invalid catalog payload", Severity::Warning);
                Ok(StepOutcome::Retry(state.poll_delay))
            }
        }
    }
}

static SCRIPT_PRODUCT_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)var\s+productData\s*=\s*(\{.*?\})\s*;").expect("product data regex")
});

static PRODUCT_JSON_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/json"]"#).expect("product json selector")
});

/// Pull the embedded product document out of a product page: first any
/// JSON script tag that parses, then a `var productData = {...};`
/// assignment. Entities are decoded before parsing.
fn extract_embedded(html: &str) -> Option<ProductPayload> {
    let document = Html::parse_document(html);
    for node in document.select(&PRODUCT_JSON_SELECTOR) {
        let text = node.text().collect::<String>();
        let decoded = html_escape::decode_html_entities(&text);
        if let Ok(payload) = serde_json::from_str::<ProductPayload>(decoded.as_ref()) {
            return Some(payload);
        }
    }

    let captures = SCRIPT_PRODUCT_DATA.captures(html)?;
    let decoded = html_escape::decode_html_entities(&captures[1]);
    serde_json::from_str(decoded.as_ref()).ok()
}

/// Scrape a product page and extract its embedded variant JSON.
pub struct PagePoll;

#[async_trait]
impl Step<MonitorWorker> for PagePoll {
    async fn run(&self, state: &mut MonitorWorker) -> Result<StepOutcome, StepFault> {
        let response = match state.worker.session.get(&state.endpoint).await {
            Ok(response) => response,
            Err(err) => {
                log::debug!("page poll transport error: {err}");
                state.worker.set_status("connection error", Severity::Warning);
                return Ok(StepOutcome::Retry(state.poll_delay));
            }
        };
        if !response.status().is_success() {
            return Ok(state.handle_status(response.status()));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                log::debug!("page poll body error: {err}");
                state.worker.set_status("connection error", Severity::Warning);
                return Ok(StepOutcome::Retry(state.poll_delay));
            }
        };

        match extract_embedded(&body) {
            Some(payload) => {
                let product = payload.into_product(state.worker.store(), &state.endpoint);
                Ok(state.handle_payload(product))
            }
            None => {
                state
                    .worker
                    .set_status("no product data on page", Severity::Info);
                Ok(StepOutcome::Retry(state.poll_delay))
            }
        }
    }
}

/// The single-step polling graph for a monitor mode.
pub fn monitor_graph(mode: MonitorMode) -> StepGraph<MonitorWorker> {
    match mode {
        MonitorMode::Sku => StepGraph::new("poll-sku").insert("poll-sku", SkuPoll),
        MonitorMode::Catalog => StepGraph::new("poll-catalog").insert("poll-catalog", CatalogPoll),
        MonitorMode::Page => StepGraph::new("poll-page").insert("poll-page", PagePoll),
    }
}
