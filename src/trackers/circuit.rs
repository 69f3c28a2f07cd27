//! Per-model circuit breaker.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Per-model open/closed gate based on recent failures.
pub trait CircuitBreaker: Send + Sync {
    /// Whether an attempt against this model is currently allowed.
    fn check(&self, model: &str) -> bool;
    fn record_success(&self, model: &str);
    fn record_failure(&self, model: &str);
    fn reset(&self);
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Default breaker: N consecutive failures open the gate for a cooldown
/// window; any success closes it and clears the streak.
#[derive(Debug)]
pub struct FailureWindowBreaker {
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl FailureWindowBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for FailureWindowBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

impl CircuitBreaker for FailureWindowBreaker {
    fn check(&self, model: &str) -> bool {
        let Ok(states) = self.states.lock() else {
            return true;
        };
        match states.get(model).and_then(|s| s.open_until) {
            Some(until) => until <= Instant::now(),
            None => true,
        }
    }

    fn record_success(&self, model: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(model);
        }
    }

    fn record_failure(&self, model: &str) {
        if let Ok(mut states) = self.states.lock() {
            let state = states.entry(model.to_string()).or_default();
            state.consecutive_failures += 1;
            if state.consecutive_failures >= self.threshold {
                state.open_until = Some(Instant::now() + self.cooldown);
                warn!(model, failures = state.consecutive_failures, "circuit opened");
            }
        }
    }

    fn reset(&self) {
        if let Ok(mut states) = self.states.lock() {
            states.clear();
        }
    }
}
