//! Session identity and deterministic API key selection.
//!
//! A session is a `(browser_id, task_id)` pairing. It is pinned to one API
//! key by a stable hash of the session id modulo the key count, so a given
//! browser/task keeps hitting the same key and per-key rate-limit state
//! stays meaningful. Rebinding recomputes the pin only when the pair
//! actually changed.

use std::sync::Arc;

use serde::Serialize;

use crate::hash::HashCache;

/// Identity of the browser/task pair this router instance serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionIdentity {
    pub browser_id: String,
    pub task_id: String,
}

impl SessionIdentity {
    pub fn new(browser_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            browser_id: browser_id.into(),
            task_id: task_id.into(),
        }
    }

    pub fn session_id(&self) -> String {
        format!("{}:{}", self.browser_id, self.task_id)
    }
}

/// Session state plus the memoized key pin.
#[derive(Debug)]
pub struct SessionKeySelector {
    identity: SessionIdentity,
    key_index: Option<usize>,
    hashes: Arc<HashCache>,
}

impl SessionKeySelector {
    pub fn new(identity: SessionIdentity, key_count: usize, hashes: Arc<HashCache>) -> Self {
        let key_index = select_key_index(&identity.session_id(), key_count, &hashes);
        Self {
            identity,
            key_index,
            hashes,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Pinned key index, `None` when no keys are configured.
    pub fn key_index(&self) -> Option<usize> {
        self.key_index
    }

    /// Rebind to a new browser/task pair.
    ///
    /// A no-op rebind (same pair) returns `false` and leaves the pin and
    /// the hash memo untouched.
    pub fn rebind(&mut self, browser_id: &str, task_id: &str, key_count: usize) -> bool {
        if self.identity.browser_id == browser_id && self.identity.task_id == task_id {
            return false;
        }
        self.identity = SessionIdentity::new(browser_id, task_id);
        self.key_index = select_key_index(&self.identity.session_id(), key_count, &self.hashes);
        true
    }
}

fn select_key_index(session_id: &str, key_count: usize, hashes: &HashCache) -> Option<usize> {
    if key_count == 0 {
        return None;
    }
    Some((hashes.hash(session_id) % key_count as u64) as usize)
}
