//! Per-key rate-limit accounting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Remaining-quota status for one API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningStatus {
    Ok,
    Warning,
    Critical,
    Exhausted,
    Unknown,
}

impl std::fmt::Display for WarningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Exhausted => "exhausted",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Per-key remaining-quota oracle.
pub trait RateLimitTracker: Send + Sync {
    fn warning_status(&self, key: &str) -> WarningStatus;
    fn track_request(&self, key: &str, model: &str, success: bool);
    /// Forget accumulated usage for a key (fresh window).
    fn refresh_key(&self, key: &str);
    fn reset(&self);
}

#[derive(Debug)]
struct KeyWindow {
    started: Instant,
    used: u32,
}

/// Default tracker: fixed window per key with fractional thresholds.
///
/// Under 50% used is ok, under 80% warning, under 100% critical, at quota
/// exhausted. A key that was never seen reports unknown.
#[derive(Debug)]
pub struct WindowRateLimiter {
    quota: u32,
    window: Duration,
    windows: Mutex<HashMap<String, KeyWindow>>,
}

impl WindowRateLimiter {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self {
            quota: quota.max(1),
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn rolled_usage(&self, entry: &mut KeyWindow) -> u32 {
        if entry.started.elapsed() >= self.window {
            entry.started = Instant::now();
            entry.used = 0;
        }
        entry.used
    }
}

impl Default for WindowRateLimiter {
    fn default() -> Self {
        // 60 requests per minute per key.
        Self::new(60, Duration::from_secs(60))
    }
}

impl RateLimitTracker for WindowRateLimiter {
    fn warning_status(&self, key: &str) -> WarningStatus {
        let Ok(mut windows) = self.windows.lock() else {
            return WarningStatus::Unknown;
        };
        let Some(entry) = windows.get_mut(key) else {
            return WarningStatus::Unknown;
        };
        let used = self.rolled_usage(entry);
        let fraction = used as f64 / self.quota as f64;
        if fraction >= 1.0 {
            WarningStatus::Exhausted
        } else if fraction >= 0.8 {
            WarningStatus::Critical
        } else if fraction >= 0.5 {
            WarningStatus::Warning
        } else {
            WarningStatus::Ok
        }
    }

    fn track_request(&self, key: &str, _model: &str, _success: bool) {
        if let Ok(mut windows) = self.windows.lock() {
            let entry = windows.entry(key.to_string()).or_insert_with(|| KeyWindow {
                started: Instant::now(),
                used: 0,
            });
            self.rolled_usage(entry);
            entry.used += 1;
        }
    }

    fn refresh_key(&self, key: &str) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(key);
        }
    }

    fn reset(&self) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.clear();
        }
    }
}
