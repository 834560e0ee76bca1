//! Product availability cache with listener-based fulfillment.
//!
//! Snapshots are keyed by (store, identifier) with last-write-wins
//! semantics. Every `update` call notifies every listener synchronously
//! before returning, with no dedup against the previous snapshot; relevance
//! filtering is the listener's job.

pub mod matching;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

/// One purchasable variant of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub size: String,
    pub in_stock: bool,
}

/// Availability snapshot published by a monitor worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProduct {
    pub store: String,
    pub identifier: String,
    pub title: String,
    pub url: String,
    pub variants: Vec<Variant>,
}

impl CachedProduct {
    pub fn key(&self) -> ProductKey {
        ProductKey {
            store: self.store.clone(),
            identifier: self.identifier.clone(),
        }
    }

    /// Variants currently marked in stock.
    pub fn stocked(&self) -> impl Iterator<Item = &Variant> {
        self.variants.iter().filter(|v| v.in_stock)
    }
}

/// Cache key: store tag plus store-scoped product identifier.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ProductKey {
    pub store: String,
    pub identifier: String,
}

/// What a listener wants done with itself after a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerDecision {
    Keep,
    /// One-shot listeners return this once satisfied. A listener may still
    /// be invoked again from a re-entrant update before removal completes,
    /// so its logic must be idempotent.
    Remove,
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&CachedProduct) -> ListenerDecision + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    callback: Listener,
}

/// Availability snapshots plus the listeners waiting on them.
#[derive(Default)]
pub struct ProductCache {
    entries: RwLock<HashMap<ProductKey, CachedProduct>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
}

impl ProductCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for the snapshot's key and run one notification
    /// pass. Listeners have already run by the time this returns.
    pub fn update(&self, snapshot: CachedProduct) {
        {
            let mut entries = self.entries.write().expect("product cache poisoned");
            entries.insert(snapshot.key(), snapshot.clone());
        }

        // Snapshot the listener list so callbacks can subscribe/unsubscribe
        // without deadlocking, then drop the satisfied ones.
        let pass: Vec<(ListenerId, Listener)> = {
            let listeners = self.listeners.lock().expect("listener list poisoned");
            listeners
                .iter()
                .map(|entry| (entry.id, entry.callback.clone()))
                .collect()
        };

        let mut done = Vec::new();
        for (id, callback) in pass {
            if callback(&snapshot) == ListenerDecision::Remove {
                done.push(id);
            }
        }

        if !done.is_empty() {
            let mut listeners = self.listeners.lock().expect("listener list poisoned");
            listeners.retain(|entry| !done.contains(&entry.id));
        }
    }

    pub fn get(&self, key: &ProductKey) -> Option<CachedProduct> {
        self.entries
            .read()
            .expect("product cache poisoned")
            .get(key)
            .cloned()
    }

    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&CachedProduct) -> ListenerDecision + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(ListenerEntry {
                id,
                callback: Arc::new(callback),
            });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .retain(|entry| entry.id != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("listener list poisoned").len()
    }
}
