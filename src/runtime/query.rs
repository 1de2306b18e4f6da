//! Per-worker cache of query handler tables from the last replay of each
//! running execution.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::context::QueryHandler;
use crate::ExecutionKey;

/// Query handlers as they stood after a replay that ended at `as_of_seq`.
#[derive(Clone)]
pub(crate) struct QuerySnapshot {
    pub generation: u64,
    pub as_of_seq: u64,
    pub handlers: HashMap<String, QueryHandler>,
}

impl QuerySnapshot {
    /// `Err` when no handler is registered under `name` or the handler fails.
    pub fn answer(&self, name: &str, args: &str) -> Result<String, String> {
        match self.handlers.get(name) {
            Some(handler) => handler(args.to_string()),
            None => Err(format!("no query handler registered for '{name}'")),
        }
    }
}

pub(crate) struct SnapshotCache {
    capacity: usize,
    inner: Mutex<HashMap<ExecutionKey, QuerySnapshot>>,
}

impl SnapshotCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot for `key` if it was taken at exactly this generation and seq.
    pub fn current(&self, key: &ExecutionKey, generation: u64, last_seq: u64) -> Option<QuerySnapshot> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(key)
            .filter(|s| s.generation == generation && s.as_of_seq == last_seq)
            .cloned()
    }

    /// Keeps the newer of the cached and offered snapshots.
    pub fn store(&self, key: ExecutionKey, snapshot: QuerySnapshot) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(&key) {
            if (existing.generation, existing.as_of_seq) > (snapshot.generation, snapshot.as_of_seq) {
                return;
            }
        }
        if !map.contains_key(&key) && map.len() >= self.capacity {
            let victim = map
                .iter()
                .min_by_key(|(_, s)| s.as_of_seq)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                map.remove(&victim);
            }
        }
        map.insert(key, snapshot);
    }

    pub fn remove(&self, key: &ExecutionKey) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
