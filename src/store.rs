//! Persistence collaborator.
//!
//! The engine reads task groups and proxy groups through these traits and
//! never assumes a storage format. The in-memory implementation backs the
//! tests and embedders without a store of their own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::tasks::TaskGroup;
use crate::tasks::proxy::ProxyGroup;

/// Called with the saved group's id after every mutation.
pub type SaveListener = Arc<dyn Fn(&str) + Send + Sync>;

pub trait TaskGroupStore: Send + Sync {
    fn all(&self) -> Vec<TaskGroup>;
    fn find_by_id(&self, id: &str) -> Option<TaskGroup>;
    /// Insert or replace by group id, then notify save listeners.
    fn save(&self, group: TaskGroup);
    fn on_save(&self, listener: SaveListener);
}

pub trait ProxyStore: Send + Sync {
    fn groups(&self) -> Vec<Arc<ProxyGroup>>;
    fn group(&self, id: &str) -> Option<Arc<ProxyGroup>>;
}

/// In-memory store for tests and simple embeddings.
#[derive(Default)]
pub struct MemoryStore {
    groups: RwLock<Vec<TaskGroup>>,
    proxies: RwLock<HashMap<String, Arc<ProxyGroup>>>,
    listeners: Mutex<Vec<SaveListener>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn add_proxy_group(&self, group: ProxyGroup) {
        self.proxies
            .write()
            .expect("proxy map poisoned")
            .insert(group.id.clone(), Arc::new(group));
    }
}

impl TaskGroupStore for MemoryStore {
    fn all(&self) -> Vec<TaskGroup> {
        self.groups.read().expect("group list poisoned").clone()
    }

    fn find_by_id(&self, id: &str) -> Option<TaskGroup> {
        self.groups
            .read()
            .expect("group list poisoned")
            .iter()
            .find(|g| g.id == id)
            .cloned()
    }

    fn save(&self, group: TaskGroup) {
        let id = group.id.clone();
        {
            let mut groups = self.groups.write().expect("group list poisoned");
            match groups.iter_mut().find(|g| g.id == id) {
                Some(existing) => *existing = group,
                None => groups.push(group),
            }
        }
        let listeners = self.listeners.lock().expect("listener list poisoned").clone();
        for listener in listeners {
            listener(&id);
        }
    }

    fn on_save(&self, listener: SaveListener) {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(listener);
    }
}

impl ProxyStore for MemoryStore {
    fn groups(&self) -> Vec<Arc<ProxyGroup>> {
        self.proxies
            .read()
            .expect("proxy map poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn group(&self, id: &str) -> Option<Arc<ProxyGroup>> {
        self.proxies
            .read()
            .expect("proxy map poisoned")
            .get(id)
            .cloned()
    }
}
