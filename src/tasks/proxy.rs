//! Proxy bookkeeping for task assignment.
//!
//! Usage counters pair one increase with one decrease per assignment; the
//! `ProxyLease` guard makes the pairing structural so a panicking or
//! resubmitted worker can never leak a count.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// A single proxy endpoint with an in-use counter.
#[derive(Debug)]
pub struct Proxy {
    pub id: String,
    pub endpoint: String,
    usage: AtomicU32,
}

impl Proxy {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            usage: AtomicU32::new(0),
        }
    }

    pub fn increase_usage(&self) {
        self.usage.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the counter, saturating at zero.
    pub fn decrease_usage(&self) {
        let _ = self
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn usage(&self) -> u32 {
        self.usage.load(Ordering::SeqCst)
    }
}

/// A named pool of proxies tasks can draw from.
#[derive(Debug, Clone, Default)]
pub struct ProxyGroup {
    pub id: String,
    pub name: String,
    proxies: Vec<Arc<Proxy>>,
}

impl ProxyGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            proxies: Vec::new(),
        }
    }

    pub fn add(&mut self, proxy: Proxy) {
        self.proxies.push(Arc::new(proxy));
    }

    pub fn all(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }

    /// First proxy with no active assignment, in insertion order.
    pub fn not_in_use(&self) -> Option<Arc<Proxy>> {
        self.proxies.iter().find(|p| p.usage() == 0).cloned()
    }

    /// Fallback when every proxy is taken: the least-loaded one.
    pub fn least_used(&self) -> Option<Arc<Proxy>> {
        self.proxies.iter().min_by_key(|p| p.usage()).cloned()
    }

    /// Assignment preference used by the pool: an unused proxy first, the
    /// least-loaded one otherwise.
    pub fn pick(&self) -> Option<Arc<Proxy>> {
        self.not_in_use().or_else(|| self.least_used())
    }
}

/// RAII guard tying one usage increment to exactly one decrement.
#[derive(Debug)]
pub struct ProxyLease {
    proxy: Arc<Proxy>,
}

impl ProxyLease {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        proxy.increase_usage();
        Self { proxy }
    }

    pub fn endpoint(&self) -> &str {
        &self.proxy.endpoint
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        self.proxy.decrease_usage();
    }
}
