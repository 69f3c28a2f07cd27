//! Deterministic string hashing with memoization.
//!
//! Session key selection and dedupe fingerprints both need a hash that is
//! stable across calls and across processes (no per-process seed like
//! `DefaultHasher`). The classic `h*31 + byte` accumulator is enough.

use std::collections::HashMap;
use std::sync::Mutex;

/// Stable, seed-free string hash. Same input always yields the same output.
pub fn stable_hash(s: &str) -> u64 {
    let mut h: u64 = 0;
    for b in s.bytes() {
        h = h.wrapping_mul(31).wrapping_add(b as u64);
    }
    h
}

/// Memoizing wrapper around [`stable_hash`].
///
/// Bounded: when the memo reaches capacity it is cleared wholesale rather
/// than evicted entry-by-entry. Callers hash a small, recurring set of
/// session ids, so a full clear is a rare non-event.
#[derive(Debug)]
pub struct HashCache {
    memo: Mutex<HashMap<String, u64>>,
    capacity: usize,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            memo: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn hash(&self, s: &str) -> u64 {
        if let Ok(memo) = self.memo.lock()
            && let Some(h) = memo.get(s)
        {
            return *h;
        }
        let h = stable_hash(s);
        if let Ok(mut memo) = self.memo.lock() {
            if memo.len() >= self.capacity {
                memo.clear();
            }
            memo.insert(s.to_string(), h);
        }
        h
    }

    #[cfg(test)]
    fn memo_len(&self) -> usize {
        self.memo.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new(1024)
    }
}
