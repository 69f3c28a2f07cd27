//! Request deduplication cache.
//!
//! Maps a normalized request fingerprint to a previously returned
//! completion. The router writes on every success and reads before any
//! network call; eviction policy lives here, not in the router.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

/// A completion retained for replay.
#[derive(Debug, Clone, Serialize)]
pub struct CachedCompletion {
    pub content: String,
    pub model: String,
}

pub trait DedupeCache: Send + Sync {
    fn check(&self, fingerprint: u64) -> Option<CachedCompletion>;
    fn store(&self, fingerprint: u64, completion: CachedCompletion);
    fn reset(&self);
}

/// Bounded in-memory cache. On overflow the whole map is dropped; dedupe
/// is an opportunistic optimization, not a durability promise.
#[derive(Debug)]
pub struct InMemoryDedupe {
    capacity: usize,
    entries: Mutex<HashMap<u64, CachedCompletion>>,
}

impl InMemoryDedupe {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDedupe {
    fn default() -> Self {
        Self::new(512)
    }
}

impl DedupeCache for InMemoryDedupe {
    fn check(&self, fingerprint: u64) -> Option<CachedCompletion> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.get(&fingerprint).cloned())
    }

    fn store(&self, fingerprint: u64, completion: CachedCompletion) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity && !entries.contains_key(&fingerprint) {
                entries.clear();
            }
            entries.insert(fingerprint, completion);
        }
    }

    fn reset(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
