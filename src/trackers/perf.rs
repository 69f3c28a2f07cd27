//! Per-model success/latency bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

pub trait ModelPerfTracker: Send + Sync {
    fn track_success(&self, model: &str, latency: Duration);
    fn track_failure(&self, model: &str);
    /// Best-performing model observed so far, if any succeeded.
    fn best_model(&self) -> Option<String>;
    fn all_stats(&self) -> Vec<ModelPerfSnapshot>;
    fn reset(&self);
}

/// Point-in-time view of one model's record.
#[derive(Debug, Clone, Serialize)]
pub struct ModelPerfSnapshot {
    pub model: String,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: u64,
}

impl ModelPerfSnapshot {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct PerfState {
    successes: u64,
    failures: u64,
    total_latency_ms: u64,
}

/// Default tracker. Ranks by success rate, ties broken by lower average
/// latency.
#[derive(Debug, Default)]
pub struct InMemoryPerfTracker {
    states: Mutex<HashMap<String, PerfState>>,
}

impl InMemoryPerfTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelPerfTracker for InMemoryPerfTracker {
    fn track_success(&self, model: &str, latency: Duration) {
        if let Ok(mut states) = self.states.lock() {
            let state = states.entry(model.to_string()).or_default();
            state.successes += 1;
            state.total_latency_ms += latency.as_millis() as u64;
        }
    }

    fn track_failure(&self, model: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.entry(model.to_string()).or_default().failures += 1;
        }
    }

    fn best_model(&self) -> Option<String> {
        let snapshots = self.all_stats();
        snapshots
            .into_iter()
            .filter(|s| s.successes > 0)
            .max_by(|a, b| {
                a.success_rate()
                    .total_cmp(&b.success_rate())
                    .then(b.avg_latency_ms.cmp(&a.avg_latency_ms))
            })
            .map(|s| s.model)
    }

    fn all_stats(&self) -> Vec<ModelPerfSnapshot> {
        let Ok(states) = self.states.lock() else {
            return Vec::new();
        };
        let mut out: Vec<ModelPerfSnapshot> = states
            .iter()
            .map(|(model, s)| ModelPerfSnapshot {
                model: model.clone(),
                successes: s.successes,
                failures: s.failures,
                avg_latency_ms: if s.successes == 0 {
                    0
                } else {
                    s.total_latency_ms / s.successes
                },
            })
            .collect();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }

    fn reset(&self) {
        if let Ok(mut states) = self.states.lock() {
            states.clear();
        }
    }
}
