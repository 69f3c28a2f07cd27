//! Adaptive per-key timeout recommendation.
//!
//! Keys that have been answering fast and cleanly get the short "quick"
//! budget, so a stuck upstream is abandoned early; anything slow, failing,
//! or unknown gets the default budget.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Which of the two configured timeout budgets to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Quick,
    Default,
}

pub trait KeyTimeoutTracker: Send + Sync {
    fn recommend(&self, key: &str) -> TimeoutClass;
    fn track_request(&self, key: &str, latency: Duration, success: bool);
    fn reset(&self);
}

#[derive(Debug)]
struct KeyLatency {
    ewma_ms: f64,
    failure_streak: u32,
}

/// Default tracker: exponentially-weighted latency average per key.
#[derive(Debug)]
pub struct AdaptiveTimeoutTracker {
    /// Keys averaging under this get the quick budget.
    fast_threshold: Duration,
    states: Mutex<HashMap<String, KeyLatency>>,
}

impl AdaptiveTimeoutTracker {
    pub fn new(fast_threshold: Duration) -> Self {
        Self {
            fast_threshold,
            states: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for AdaptiveTimeoutTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(2_000))
    }
}

impl KeyTimeoutTracker for AdaptiveTimeoutTracker {
    fn recommend(&self, key: &str) -> TimeoutClass {
        let Ok(states) = self.states.lock() else {
            return TimeoutClass::Default;
        };
        match states.get(key) {
            Some(s) if s.failure_streak == 0 && s.ewma_ms < self.fast_threshold.as_millis() as f64 => {
                TimeoutClass::Quick
            }
            _ => TimeoutClass::Default,
        }
    }

    fn track_request(&self, key: &str, latency: Duration, success: bool) {
        let ms = latency.as_millis() as f64;
        if let Ok(mut states) = self.states.lock() {
            let state = states.entry(key.to_string()).or_insert(KeyLatency {
                ewma_ms: ms,
                failure_streak: 0,
            });
            state.ewma_ms = 0.7 * state.ewma_ms + 0.3 * ms;
            if success {
                state.failure_streak = 0;
            } else {
                state.failure_streak += 1;
            }
        }
    }

    fn reset(&self) {
        if let Ok(mut states) = self.states.lock() {
            states.clear();
        }
    }
}
