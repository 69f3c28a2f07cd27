//! The cascade controller.
//!
//! Turns one chat-completion request into a reliable outcome despite
//! unreliable upstreams: ordered model candidates, a pinned per-session API
//! key, circuit-breaker and rate-limit gates, request deduplication, a
//! global retry budget, and proxy-then-direct transport fallback. Transport
//! failures never escape this module; callers only ever see the terminal
//! [`CascadeOutcome`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{self, ConfigReport, RouterConfig};
use crate::error::{CallError, ConfigError, FailureReason};
use crate::hash::{HashCache, stable_hash};
use crate::health::{ModelHealthOracle, ModelHealthReport, ModelsInfo};
use crate::proxy::{parse_proxy, select_request_proxy};
use crate::session::{SessionIdentity, SessionKeySelector};
use crate::trackers::{
    AdaptiveTimeoutTracker, CachedCompletion, CircuitBreaker, DedupeCache, FailureWindowBreaker,
    InMemoryDedupe, InMemoryPerfTracker, KeyTimeoutTracker, ModelPerfSnapshot, ModelPerfTracker,
    RateLimitTracker, TimeoutClass, WarningStatus, WindowRateLimiter,
};
use crate::transport::{ChatMessage, ChatTransport, HttpTransport, NormalizedRequest};

/// Global attempt budget across all candidate models combined.
///
/// Deliberately global rather than per-model: it bounds worst-case latency
/// at `timeout x MAX_RETRIES`, at the cost of under-exploring long fallback
/// lists. Tunable if that trade ever flips.
pub const MAX_RETRIES: u32 = 3;

const DEFAULT_MAX_TOKENS: u32 = 100;
const DEFAULT_TEMPERATURE: f64 = 0.7;

// ---------------------------------------------------------------------------
// Request / outcome types
// ---------------------------------------------------------------------------

/// A caller's chat-completion request. Unset knobs take wire defaults.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    fn normalize(&self) -> NormalizedRequest {
        NormalizedRequest {
            messages: self.messages.clone(),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        }
    }
}

/// Successful terminal outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    /// Index of the session-pinned API key (the key material stays out of
    /// results and logs).
    pub key_used: Option<usize>,
    /// Models attempted before the one that succeeded.
    pub model_fallbacks: u32,
    /// Every model that hit 429/5xx during this request, in hit order.
    pub rate_limited_models: Vec<String>,
    pub warning_status: WarningStatus,
    /// Total transport calls made, including a direct-fallback leg.
    pub retry_count: u32,
    /// Proxy string the winning call went through, if any.
    pub proxy: Option<String>,
    pub direct_fallback_used: bool,
    pub from_cache: bool,
}

/// Failed terminal outcome. Diagnostic fields let an operator tell
/// "everything rate-limited" from "everything circuit-broken" from
/// "nothing configured" without parsing messages.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeFailure {
    #[serde(skip)]
    pub reason: FailureReason,
    pub error: String,
    pub models_tried: u32,
    pub rate_limited_models: Vec<String>,
}

impl CascadeFailure {
    fn new(reason: FailureReason, models_tried: u32, rate_limited_models: Vec<String>) -> Self {
        let error = reason.to_string();
        Self {
            reason,
            error,
            models_tried,
            rate_limited_models,
        }
    }
}

/// Terminal outcome of one `process_request` call.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CascadeOutcome {
    Completed(Completion),
    Failed(CascadeFailure),
}

impl CascadeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn completion(&self) -> Option<&Completion> {
        match self {
            Self::Completed(c) => Some(c),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&CascadeFailure> {
        match self {
            Self::Failed(f) => Some(f),
            Self::Completed(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Stats {
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    dedupe_hits: AtomicU64,
    rate_limit_hits: AtomicU64,
    circuit_breaks: AtomicU64,
    quick_timeouts: AtomicU64,
}

/// Point-in-time copy of the process-lifetime counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub dedupe_hits: u64,
    pub rate_limit_hits: u64,
    pub circuit_breaks: u64,
    pub quick_timeouts: u64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            dedupe_hits: self.dedupe_hits.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            circuit_breaks: self.circuit_breaks.load(Ordering::Relaxed),
            quick_timeouts: self.quick_timeouts.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.dedupe_hits.store(0, Ordering::Relaxed);
        self.rate_limit_hits.store(0, Ordering::Relaxed);
        self.circuit_breaks.store(0, Ordering::Relaxed);
        self.quick_timeouts.store(0, Ordering::Relaxed);
    }
}

/// Session introspection snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub browser_id: String,
    pub task_id: String,
    pub session_id: String,
    pub key_index: Option<usize>,
    pub key_count: usize,
}

/// Stats plus per-model records, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedStats {
    pub stats: StatsSnapshot,
    pub session: SessionInfo,
    pub models: Vec<ModelPerfSnapshot>,
    pub best_model: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Multi-provider cascading request router.
///
/// Shareable across tasks (`Send + Sync`): counters are atomics, config and
/// session state sit behind short-lived locks that are never held across an
/// await. Rebinds are expected between requests, not concurrently with one.
pub struct CascadeRouter {
    config: Mutex<RouterConfig>,
    session: Mutex<SessionKeySelector>,
    transport: Arc<dyn ChatTransport>,
    breaker: Arc<dyn CircuitBreaker>,
    rate_limits: Arc<dyn RateLimitTracker>,
    dedupe: Arc<dyn DedupeCache>,
    perf: Arc<dyn ModelPerfTracker>,
    key_timeouts: Arc<dyn KeyTimeoutTracker>,
    oracle: Mutex<Option<Arc<dyn ModelHealthOracle>>>,
    stats: Stats,
}

impl CascadeRouter {
    /// Build a router bound to a browser/task session.
    ///
    /// Malformed configuration is the one failure mode that surfaces as
    /// `Err`; everything past construction is reported through
    /// [`CascadeOutcome`] values.
    pub fn new(
        config: RouterConfig,
        browser_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let report = config::validate(&config);
        if !report.valid {
            return Err(ConfigError {
                errors: report.errors,
            });
        }

        let hashes = Arc::new(HashCache::default());
        let session = SessionKeySelector::new(
            SessionIdentity::new(browser_id, task_id),
            config.api_keys.len(),
            hashes,
        );
        let transport = Arc::new(HttpTransport::new(&config.endpoint));

        Ok(Self {
            config: Mutex::new(config),
            session: Mutex::new(session),
            transport,
            breaker: Arc::new(FailureWindowBreaker::default()),
            rate_limits: Arc::new(WindowRateLimiter::default()),
            dedupe: Arc::new(InMemoryDedupe::default()),
            perf: Arc::new(InMemoryPerfTracker::new()),
            key_timeouts: Arc::new(AdaptiveTimeoutTracker::default()),
            oracle: Mutex::new(None),
            stats: Stats::default(),
        })
    }

    // --- collaborator injection -------------------------------------------

    pub fn with_transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_rate_limits(mut self, rate_limits: Arc<dyn RateLimitTracker>) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn with_dedupe(mut self, dedupe: Arc<dyn DedupeCache>) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn with_perf_tracker(mut self, perf: Arc<dyn ModelPerfTracker>) -> Self {
        self.perf = perf;
        self
    }

    pub fn with_key_timeouts(mut self, key_timeouts: Arc<dyn KeyTimeoutTracker>) -> Self {
        self.key_timeouts = key_timeouts;
        self
    }

    /// Register (or replace) the optional model-health oracle.
    pub fn set_health_oracle(&self, oracle: Arc<dyn ModelHealthOracle>) {
        *lock(&self.oracle) = Some(oracle);
    }

    // --- core algorithm ----------------------------------------------------

    /// Run the cascade for one request.
    pub async fn process_request(&self, request: CompletionRequest) -> CascadeOutcome {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        // Snapshot mutable state up front; locks are never held across await.
        let cfg = lock(&self.config).clone();
        let key_index = lock(&self.session).key_index();

        if !cfg.enabled {
            return CascadeOutcome::Failed(CascadeFailure::new(
                FailureReason::NotEnabled,
                0,
                Vec::new(),
            ));
        }

        let normalized = request.normalize();
        let fingerprint = fingerprint(&normalized);

        // Dedupe is a pure short-circuit: no network, no tracker calls.
        if let Some(cached) = self.dedupe.check(fingerprint) {
            self.stats.dedupe_hits.fetch_add(1, Ordering::Relaxed);
            self.stats.successes.fetch_add(1, Ordering::Relaxed);
            debug!(model = %cached.model, "dedupe hit, replaying cached completion");
            return CascadeOutcome::Completed(Completion {
                content: cached.content,
                model: cached.model,
                key_used: key_index,
                model_fallbacks: 0,
                rate_limited_models: Vec::new(),
                warning_status: WarningStatus::Unknown,
                retry_count: 0,
                proxy: None,
                direct_fallback_used: false,
                from_cache: true,
            });
        }

        let Some(key_index) = key_index else {
            return CascadeOutcome::Failed(CascadeFailure::new(
                FailureReason::NoKeys,
                0,
                Vec::new(),
            ));
        };
        let api_key = cfg.api_keys[key_index].clone();

        if self.rate_limits.warning_status(&api_key) == WarningStatus::Exhausted {
            self.stats.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            warn!(key_index, "session key exhausted, refusing cascade");
            return CascadeOutcome::Failed(CascadeFailure::new(
                FailureReason::KeyExhausted { key_index },
                0,
                Vec::new(),
            ));
        }

        let candidates = self.candidate_models(&cfg);
        if candidates.is_empty() {
            return CascadeOutcome::Failed(CascadeFailure::new(
                FailureReason::NoCandidates,
                0,
                Vec::new(),
            ));
        }

        self.run_cascade(&cfg, &normalized, fingerprint, key_index, &api_key, &candidates)
            .await
    }

    async fn run_cascade(
        &self,
        cfg: &RouterConfig,
        request: &NormalizedRequest,
        fingerprint: u64,
        key_index: usize,
        api_key: &str,
        candidates: &[String],
    ) -> CascadeOutcome {
        let mut rate_limited: Vec<String> = Vec::new();
        let mut attempted: Vec<String> = Vec::new();
        let mut attempts: u32 = 0;
        let mut total_calls: u32 = 0;

        // Candidates are revisited until the budget is spent: a transient
        // failure (timeout, network blip, plain 4xx) on a short list still
        // gets the remaining attempts, while 429/5xx models stay skipped
        // for the rest of the request.
        while attempts < MAX_RETRIES {
            let mut progressed = false;
            for model in candidates {
                if attempts >= MAX_RETRIES {
                    break;
                }
                if rate_limited.iter().any(|m| m == model) {
                    continue;
                }
                if !self.breaker.check(model) {
                    self.stats.circuit_breaks.fetch_add(1, Ordering::Relaxed);
                    debug!(model = %model, "circuit open, skipping model");
                    continue;
                }

                progressed = true;
                attempts += 1;
                if !attempted.iter().any(|m| m == model) {
                    attempted.push(model.clone());
                }

                let timeout = match self.key_timeouts.recommend(api_key) {
                    TimeoutClass::Quick => {
                        self.stats.quick_timeouts.fetch_add(1, Ordering::Relaxed);
                        Duration::from_millis(cfg.timeouts.quick_ms)
                    }
                    TimeoutClass::Default => Duration::from_millis(cfg.timeouts.default_ms),
                };

                let proxy = select_request_proxy(&cfg.proxy)
                    .and_then(|raw| parse_proxy(raw).map(|p| (raw.to_string(), p)));

                let mut started = Instant::now();
                let mut used_proxy: Option<String> = None;
                let mut direct_fallback = false;

                let result = match &proxy {
                    Some((raw, endpoint)) => {
                        used_proxy = Some(raw.clone());
                        total_calls += 1;
                        let via = self
                            .transport
                            .via_proxy(model, request, api_key, endpoint, timeout)
                            .await;
                        match via {
                            Ok(reply) => Ok(reply),
                            Err(err) if cfg.proxy.fallback_to_direct => {
                                // One direct retry of the same model before
                                // moving to the next candidate. The failed
                                // proxy leg is a real failure: trackers see
                                // it even when the direct leg recovers.
                                debug!(model = %model, proxy = %raw, error = %err, "proxy attempt failed, trying direct");
                                self.record_attempt_failure(
                                    &mut rate_limited,
                                    model,
                                    api_key,
                                    started.elapsed(),
                                    &err,
                                );
                                used_proxy = None;
                                direct_fallback = true;
                                total_calls += 1;
                                started = Instant::now();
                                self.transport.direct(model, request, api_key, timeout).await
                            }
                            Err(err) => Err(err),
                        }
                    }
                    None => {
                        total_calls += 1;
                        self.transport.direct(model, request, api_key, timeout).await
                    }
                };

                let latency = started.elapsed();
                match result {
                    Ok(reply) => {
                        self.breaker.record_success(model);
                        self.perf.track_success(model, latency);
                        self.rate_limits.track_request(api_key, model, true);
                        self.key_timeouts.track_request(api_key, latency, true);
                        self.dedupe.store(
                            fingerprint,
                            CachedCompletion {
                                content: reply.content.clone(),
                                model: model.clone(),
                            },
                        );
                        self.stats.successes.fetch_add(1, Ordering::Relaxed);
                        info!(
                            model = %model,
                            attempts,
                            direct_fallback,
                            latency_ms = latency.as_millis() as u64,
                            "cascade completed"
                        );
                        return CascadeOutcome::Completed(Completion {
                            content: reply.content,
                            model: model.clone(),
                            key_used: Some(key_index),
                            model_fallbacks: attempted.len() as u32 - 1,
                            rate_limited_models: rate_limited,
                            warning_status: self.rate_limits.warning_status(api_key),
                            retry_count: total_calls,
                            proxy: used_proxy,
                            direct_fallback_used: direct_fallback,
                            from_cache: false,
                        });
                    }
                    Err(err) => {
                        self.record_attempt_failure(
                            &mut rate_limited,
                            model,
                            api_key,
                            latency,
                            &err,
                        );
                        warn!(model = %model, error = %err, attempts, "attempt failed, continuing cascade");
                    }
                }
            }
            // Every remaining candidate is rate-limited or circuit-open;
            // spending the rest of the budget would just spin.
            if !progressed {
                break;
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        CascadeOutcome::Failed(CascadeFailure::new(
            FailureReason::Exhausted {
                retries: MAX_RETRIES,
            },
            attempted.len() as u32,
            rate_limited,
        ))
    }

    fn record_attempt_failure(
        &self,
        rate_limited: &mut Vec<String>,
        model: &str,
        api_key: &str,
        latency: Duration,
        err: &CallError,
    ) {
        note_rate_limited(rate_limited, model, err);
        self.breaker.record_failure(model);
        self.perf.track_failure(model);
        self.rate_limits.track_request(api_key, model, false);
        self.key_timeouts.track_request(api_key, latency, false);
    }

    /// Ordered candidate list for one request.
    ///
    /// Known-working models from the oracle come first. When fewer than 3
    /// are known the configured primary and fallbacks are appended; with 3+
    /// the empirical list stands on its own. Duplicates keep first-seen
    /// position.
    fn candidate_models(&self, cfg: &RouterConfig) -> Vec<String> {
        let working = self.oracle_report().working;

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |model: &str| {
            if !model.is_empty() && seen.insert(model.to_string()) {
                out.push(model.to_string());
            }
        };

        for model in &working {
            push(model);
        }
        if working.len() < 3 {
            push(&cfg.models.primary);
            for model in &cfg.models.fallbacks {
                push(model);
            }
        }
        out
    }

    fn oracle_report(&self) -> ModelHealthReport {
        lock(&self.oracle)
            .as_ref()
            .map(|o| o.results())
            .unwrap_or_default()
    }

    // --- management surface ------------------------------------------------

    /// Re-bind the session to a new browser/task pair. No-op when the pair
    /// is unchanged.
    pub fn set_task(&self, browser_id: &str, task_id: &str) {
        let key_count = lock(&self.config).api_keys.len();
        let rebound = lock(&self.session).rebind(browser_id, task_id, key_count);
        if rebound {
            debug!(browser_id, task_id, "session rebound");
        }
    }

    /// True iff the router is enabled and a session key resolved.
    pub fn is_ready(&self) -> bool {
        lock(&self.config).enabled && lock(&self.session).key_index().is_some()
    }

    pub fn session_info(&self) -> SessionInfo {
        let key_count = lock(&self.config).api_keys.len();
        let session = lock(&self.session);
        let identity = session.identity();
        SessionInfo {
            browser_id: identity.browser_id.clone(),
            task_id: identity.task_id.clone(),
            session_id: identity.session_id(),
            key_index: session.key_index(),
            key_count,
        }
    }

    /// Configured and empirically-tested model sets. An absent oracle
    /// yields empty tested lists, never an error.
    pub fn models_info(&self) -> ModelsInfo {
        let cfg = lock(&self.config).clone();
        let report = self.oracle_report();
        let mut all_configured = vec![cfg.models.primary.clone()];
        all_configured.extend(cfg.models.fallbacks.iter().cloned());
        all_configured.retain(|m| !m.is_empty());
        ModelsInfo {
            primary: cfg.models.primary,
            fallbacks: cfg.models.fallbacks,
            total_tested: report.working.len() + report.failed.len(),
            tested_working: report.working,
            tested_failed: report.failed,
            all_configured,
        }
    }

    /// Overwrite the configured model chain with the oracle's working set.
    ///
    /// Returns `false` without touching config when the oracle is absent or
    /// knows no working models. The model block is replaced wholesale so no
    /// observer ever sees a half-updated chain.
    pub fn sync_with_helper(&self) -> bool {
        let working = self.oracle_report().working;
        let Some((primary, fallbacks)) = working.split_first() else {
            return false;
        };
        let mut cfg = lock(&self.config);
        cfg.models.primary = primary.clone();
        cfg.models.fallbacks = fallbacks.to_vec();
        info!(primary = %cfg.models.primary, fallbacks = cfg.models.fallbacks.len(), "model chain synced from health oracle");
        true
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn detailed_stats(&self) -> DetailedStats {
        DetailedStats {
            stats: self.stats.snapshot(),
            session: self.session_info(),
            models: self.perf.all_stats(),
            best_model: self.perf.best_model(),
        }
    }

    /// Zero the counters and ask every collaborator to reset its own state.
    pub fn reset_stats(&self) {
        self.stats.reset();
        self.breaker.reset();
        self.rate_limits.reset();
        self.dedupe.reset();
        self.perf.reset();
        self.key_timeouts.reset();
    }

    /// Start a fresh rate-limit window for every configured key.
    pub fn refresh_rate_limits(&self) {
        let keys = lock(&self.config).api_keys.clone();
        for key in &keys {
            self.rate_limits.refresh_key(key);
        }
    }

    /// Shape-check a configuration without building a router.
    pub fn validate_config(cfg: &RouterConfig) -> ConfigReport {
        config::validate(cfg)
    }
}

impl std::fmt::Debug for CascadeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeRouter")
            .field("enabled", &lock(&self.config).enabled)
            .field("session", &lock(&self.session).identity().session_id())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Lock helper: a poisoned mutex yields its inner state rather than
/// panicking; all guarded state stays valid after a panic mid-update
/// because updates are single assignments.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn note_rate_limited(rate_limited: &mut Vec<String>, model: &str, err: &CallError) {
    if err.is_rate_limit_class() && !rate_limited.iter().any(|m| m == model) {
        rate_limited.push(model.to_string());
    }
}

/// Fingerprint of the normalized request; the dedupe cache key.
fn fingerprint(request: &NormalizedRequest) -> u64 {
    let canonical = serde_json::to_string(request).unwrap_or_default();
    stable_hash(&canonical)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{ModelsConfig, ProxyConfig};
    use crate::health::testing::StaticOracle;
    use crate::proxy::ProxyEndpoint;
    use crate::transport::ChatReply;

    // --- scripted transport -----------------------------------------------

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct CallRecord {
        model: String,
        proxied: bool,
    }

    /// Pops one scripted result per transport call and logs the call.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ChatReply, CallError>>>,
        calls: Mutex<Vec<CallRecord>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<ChatReply, CallError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<CallRecord> {
            self.calls.lock().unwrap().clone()
        }

        fn pop(&self, model: &str, proxied: bool) -> Result<ChatReply, CallError> {
            self.calls.lock().unwrap().push(CallRecord {
                model: model.to_string(),
                proxied,
            });
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("transport called more times than scripted")
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn direct(
            &self,
            model: &str,
            _request: &NormalizedRequest,
            _api_key: &str,
            _timeout: Duration,
        ) -> Result<ChatReply, CallError> {
            self.pop(model, false)
        }

        async fn via_proxy(
            &self,
            model: &str,
            _request: &NormalizedRequest,
            _api_key: &str,
            _proxy: &ProxyEndpoint,
            _timeout: Duration,
        ) -> Result<ChatReply, CallError> {
            self.pop(model, true)
        }
    }

    // --- canned collaborators ----------------------------------------------

    struct OpenBreaker;

    impl CircuitBreaker for OpenBreaker {
        fn check(&self, _model: &str) -> bool {
            false
        }
        fn record_success(&self, _model: &str) {}
        fn record_failure(&self, _model: &str) {}
        fn reset(&self) {}
    }

    struct ExhaustedLimiter;

    impl RateLimitTracker for ExhaustedLimiter {
        fn warning_status(&self, _key: &str) -> WarningStatus {
            WarningStatus::Exhausted
        }
        fn track_request(&self, _key: &str, _model: &str, _success: bool) {}
        fn refresh_key(&self, _key: &str) {}
        fn reset(&self) {}
    }

    // --- helpers ------------------------------------------------------------

    fn ok(content: &str) -> Result<ChatReply, CallError> {
        Ok(ChatReply {
            content: content.to_string(),
            usage: None,
        })
    }

    fn http(status: u16) -> Result<ChatReply, CallError> {
        Err(CallError::from_status(status, String::new()))
    }

    fn timed_out() -> Result<ChatReply, CallError> {
        Err(CallError::Timeout {
            after: Duration::from_millis(50),
        })
    }

    fn base_config() -> RouterConfig {
        RouterConfig {
            enabled: true,
            api_keys: vec!["sk-a".into(), "sk-b".into()],
            models: ModelsConfig {
                primary: "m1".into(),
                fallbacks: vec!["m2".into(), "m3".into()],
            },
            ..Default::default()
        }
    }

    fn router(cfg: RouterConfig, transport: Arc<ScriptedTransport>) -> CascadeRouter {
        CascadeRouter::new(cfg, "browser-1", "task-1")
            .unwrap()
            .with_transport(transport)
    }

    fn hello_request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    // --- tests ---------------------------------------------------------------

    #[tokio::test]
    async fn disabled_router_fails_without_touching_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let mut cfg = base_config();
        cfg.enabled = false;
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error, "Free API router not enabled");
        assert!(transport.calls().is_empty());
        assert_eq!(router.stats().total_requests, 1);
        assert_eq!(router.stats().failures, 0, "disabled refusal is not a cascade failure");
    }

    #[tokio::test]
    async fn dedupe_replays_cached_completion_without_network() {
        let transport = ScriptedTransport::new(vec![ok("cached answer")]);
        let router = router(base_config(), transport.clone());

        let first = router.process_request(hello_request()).await;
        assert!(first.is_success());
        assert!(!first.completion().unwrap().from_cache);

        let second = router.process_request(hello_request()).await;
        let completion = second.completion().unwrap();
        assert!(completion.from_cache);
        assert_eq!(completion.content, "cached answer");
        assert_eq!(completion.model, "m1");
        assert_eq!(transport.calls().len(), 1, "second request must not hit transport");
        assert_eq!(router.stats().dedupe_hits, 1);
        assert_eq!(router.stats().successes, 2);
    }

    #[tokio::test]
    async fn different_knobs_miss_the_dedupe_cache() {
        let transport = ScriptedTransport::new(vec![ok("a"), ok("b")]);
        let router = router(base_config(), transport.clone());

        router.process_request(hello_request()).await;
        let mut warmer = hello_request();
        warmer.temperature = Some(1.3);
        let outcome = router.process_request(warmer).await;
        assert!(!outcome.completion().unwrap().from_cache);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_session_key_refuses_before_any_model() {
        let transport = ScriptedTransport::new(vec![]);
        let router =
            router(base_config(), transport.clone()).with_rate_limits(Arc::new(ExhaustedLimiter));

        let outcome = router.process_request(hello_request()).await;
        let failure = outcome.failure().unwrap();
        assert!(failure.error.contains("exhausted"), "error: {}", failure.error);
        assert_eq!(failure.models_tried, 0);
        assert!(transport.calls().is_empty());
        assert_eq!(router.stats().rate_limit_hits, 1);
    }

    #[tokio::test]
    async fn enabled_with_no_keys_is_not_ready_and_fails_cleanly() {
        let transport = ScriptedTransport::new(vec![]);
        let mut cfg = base_config();
        cfg.api_keys.clear();
        let router = router(cfg, transport.clone());

        assert!(!router.is_ready());
        let outcome = router.process_request(hello_request()).await;
        assert!(!outcome.is_success());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_models_cascade_to_the_first_healthy_one() {
        let transport = ScriptedTransport::new(vec![http(429), http(429), ok("third time lucky")]);
        let router = router(base_config(), transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let completion = outcome.completion().unwrap();
        assert_eq!(completion.content, "third time lucky");
        assert_eq!(completion.model, "m3");
        assert_eq!(completion.model_fallbacks, 2);
        assert_eq!(completion.rate_limited_models, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(completion.retry_count, 3);
        assert!(completion.key_used.is_some());
    }

    #[tokio::test]
    async fn server_errors_accumulate_like_rate_limits() {
        let transport = ScriptedTransport::new(vec![http(500), http(503), ok("ok")]);
        let router = router(base_config(), transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let completion = outcome.completion().unwrap();
        assert_eq!(
            completion.rate_limited_models,
            vec!["m1".to_string(), "m2".to_string()]
        );
    }

    #[tokio::test]
    async fn hard_client_error_still_gets_one_fallback() {
        // A 400 may be model-specific (unsupported parameter); the next
        // candidate still gets its shot, but the budget slot is consumed.
        let transport = ScriptedTransport::new(vec![http(400), ok("fallback worked")]);
        let router = router(base_config(), transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let completion = outcome.completion().unwrap();
        assert_eq!(completion.model, "m2");
        assert_eq!(completion.model_fallbacks, 1);
        assert!(completion.rate_limited_models.is_empty(), "400 is not rate-limit class");
    }

    #[tokio::test]
    async fn retry_budget_bounds_the_cascade() {
        let mut cfg = base_config();
        cfg.models.fallbacks = vec!["m2".into(), "m3".into(), "m4".into(), "m5".into()];
        let transport = ScriptedTransport::new(vec![http(400), http(400), http(400)]);
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error, "All models and fallbacks exhausted after 3 retries");
        assert_eq!(failure.models_tried, 3);
        assert_eq!(transport.calls().len(), 3, "budget must stop the fourth attempt");
        assert_eq!(router.stats().failures, 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_the_same_model() {
        // A timeout is not rate-limit class, so the sole candidate gets a
        // second attempt instead of an instant "exhausted" report.
        let mut cfg = base_config();
        cfg.models.fallbacks.clear();
        let transport = ScriptedTransport::new(vec![timed_out(), ok("second wind")]);
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let completion = outcome.completion().unwrap();
        assert_eq!(completion.content, "second wind");
        assert_eq!(completion.model, "m1");
        assert_eq!(completion.model_fallbacks, 0, "same model is not a fallback");
        assert_eq!(completion.retry_count, 2);
        let tried: Vec<String> = transport.calls().into_iter().map(|c| c.model).collect();
        assert_eq!(tried, vec!["m1".to_string(), "m1".to_string()]);
    }

    #[tokio::test]
    async fn lone_flaky_model_gets_the_whole_budget() {
        let mut cfg = base_config();
        cfg.models.fallbacks.clear();
        let transport = ScriptedTransport::new(vec![timed_out(), timed_out(), timed_out()]);
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error, "All models and fallbacks exhausted after 3 retries");
        assert_eq!(failure.models_tried, 1, "one distinct model, tried three times");
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn rate_limited_models_stay_skipped_on_later_passes() {
        let mut cfg = base_config();
        cfg.models.fallbacks = vec!["m2".into()];
        let transport = ScriptedTransport::new(vec![http(429), timed_out(), ok("persistence")]);
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let completion = outcome.completion().unwrap();
        assert_eq!(completion.model, "m2");
        assert_eq!(completion.rate_limited_models, vec!["m1".to_string()]);
        let tried: Vec<String> = transport.calls().into_iter().map(|c| c.model).collect();
        // m1 is 429'd on the first pass and never revisited; m2's timeout is.
        assert_eq!(
            tried,
            vec!["m1".to_string(), "m2".to_string(), "m2".to_string()],
            "second pass skips the rate-limited model"
        );
    }

    #[tokio::test]
    async fn open_circuits_skip_models_without_transport_calls() {
        let transport = ScriptedTransport::new(vec![]);
        let router =
            router(base_config(), transport.clone()).with_circuit_breaker(Arc::new(OpenBreaker));

        let outcome = router.process_request(hello_request()).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.models_tried, 0);
        assert!(transport.calls().is_empty());
        assert_eq!(router.stats().circuit_breaks, 3, "one per skipped candidate");
    }

    #[tokio::test]
    async fn proxy_failure_falls_back_to_one_direct_attempt() {
        let mut cfg = base_config();
        cfg.proxy = ProxyConfig {
            enabled: true,
            list: vec!["10.0.0.1:8080".into()],
            fallback_to_direct: true,
        };
        let transport = ScriptedTransport::new(vec![http(500), ok("direct saved it")]);
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let completion = outcome.completion().unwrap();
        assert!(completion.direct_fallback_used);
        assert!(completion.proxy.is_none(), "winning leg was direct");
        assert_eq!(completion.retry_count, 2);
        assert_eq!(
            completion.rate_limited_models,
            vec!["m1".to_string()],
            "the 500 on the proxy leg still counts"
        );
        assert_eq!(
            transport.calls(),
            vec![
                CallRecord { model: "m1".into(), proxied: true },
                CallRecord { model: "m1".into(), proxied: false },
            ]
        );
    }

    #[tokio::test]
    async fn proxy_leg_failure_is_recorded_even_when_direct_recovers() {
        let mut cfg = base_config();
        cfg.proxy = ProxyConfig {
            enabled: true,
            list: vec!["10.0.0.1:8080".into()],
            fallback_to_direct: true,
        };
        let transport = ScriptedTransport::new(vec![http(500), ok("direct saved it")]);
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        assert!(outcome.is_success());
        let detailed = router.detailed_stats();
        let m1 = detailed.models.iter().find(|m| m.model == "m1").unwrap();
        assert_eq!(m1.failures, 1, "the failed proxy leg counts against the model");
        assert_eq!(m1.successes, 1);
    }

    #[tokio::test]
    async fn proxy_success_reports_which_proxy_served() {
        let mut cfg = base_config();
        cfg.proxy = ProxyConfig {
            enabled: true,
            list: vec!["10.0.0.1:8080".into()],
            fallback_to_direct: false,
        };
        let transport = ScriptedTransport::new(vec![ok("proxied")]);
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        let completion = outcome.completion().unwrap();
        assert_eq!(completion.proxy.as_deref(), Some("10.0.0.1:8080"));
        assert!(!completion.direct_fallback_used);
    }

    #[tokio::test]
    async fn without_direct_fallback_each_model_gets_one_proxy_attempt() {
        let mut cfg = base_config();
        cfg.proxy = ProxyConfig {
            enabled: true,
            list: vec!["10.0.0.1:8080".into()],
            fallback_to_direct: false,
        };
        let transport = ScriptedTransport::new(vec![http(500), http(500), http(500)]);
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        assert!(!outcome.is_success());
        assert!(transport.calls().iter().all(|c| c.proxied));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn oracle_working_models_lead_the_candidate_list() {
        // Fewer than 3 working models: configured chain is appended.
        let transport = ScriptedTransport::new(vec![http(400), http(400), http(400)]);
        let router = router(base_config(), transport.clone());
        router.set_health_oracle(Arc::new(StaticOracle(ModelHealthReport {
            working: vec!["w1".into(), "w2".into()],
            failed: vec![],
        })));

        router.process_request(hello_request()).await;
        let tried: Vec<String> = transport.calls().into_iter().map(|c| c.model).collect();
        assert_eq!(tried, vec!["w1".to_string(), "w2".to_string(), "m1".to_string()]);
    }

    #[tokio::test]
    async fn three_working_models_stand_alone() {
        let transport = ScriptedTransport::new(vec![http(400), http(400), http(400)]);
        let router = router(base_config(), transport.clone());
        router.set_health_oracle(Arc::new(StaticOracle(ModelHealthReport {
            working: vec!["w1".into(), "w2".into(), "w3".into()],
            failed: vec![],
        })));

        router.process_request(hello_request()).await;
        let tried: Vec<String> = transport.calls().into_iter().map(|c| c.model).collect();
        assert_eq!(tried, vec!["w1".to_string(), "w2".to_string(), "w3".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_candidates_keep_first_seen_order() {
        let mut cfg = base_config();
        cfg.models.fallbacks = vec!["m1".into(), "m2".into()];
        let transport = ScriptedTransport::new(vec![http(429), http(429)]);
        let router = router(cfg, transport.clone());
        router.set_health_oracle(Arc::new(StaticOracle(ModelHealthReport {
            working: vec!["m2".into()],
            failed: vec![],
        })));

        router.process_request(hello_request()).await;
        let tried: Vec<String> = transport.calls().into_iter().map(|c| c.model).collect();
        // m2 from the oracle, m1 configured; no second m1/m2.
        assert_eq!(tried, vec!["m2".to_string(), "m1".to_string()]);
    }

    #[tokio::test]
    async fn no_models_anywhere_means_no_candidates() {
        let transport = ScriptedTransport::new(vec![]);
        let mut cfg = base_config();
        cfg.models = ModelsConfig::default();
        let router = router(cfg, transport.clone());

        let outcome = router.process_request(hello_request()).await;
        assert_eq!(outcome.failure().unwrap().error, "No candidate models configured");
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn sync_with_helper_replaces_the_chain_wholesale() {
        let transport = ScriptedTransport::new(vec![]);
        let router = router(base_config(), transport);

        assert!(!router.sync_with_helper(), "no oracle registered");

        router.set_health_oracle(Arc::new(StaticOracle(ModelHealthReport::default())));
        assert!(!router.sync_with_helper(), "oracle with zero working models");
        assert_eq!(router.models_info().primary, "m1", "config untouched");

        router.set_health_oracle(Arc::new(StaticOracle(ModelHealthReport {
            working: vec!["w1".into(), "w2".into(), "w3".into()],
            failed: vec!["bad".into()],
        })));
        assert!(router.sync_with_helper());
        let info = router.models_info();
        assert_eq!(info.primary, "w1");
        assert_eq!(info.fallbacks, vec!["w2".to_string(), "w3".to_string()]);
        assert_eq!(info.total_tested, 4);
        assert_eq!(info.tested_failed, vec!["bad".to_string()]);
    }

    #[tokio::test]
    async fn set_task_rebinds_and_session_info_reflects_it() {
        let transport = ScriptedTransport::new(vec![]);
        let router = router(base_config(), transport);

        let before = router.session_info();
        assert_eq!(before.session_id, "browser-1:task-1");
        assert!(before.key_index.is_some());

        router.set_task("browser-1", "task-1"); // no-op
        assert_eq!(router.session_info().key_index, before.key_index);

        router.set_task("browser-2", "task-9");
        let after = router.session_info();
        assert_eq!(after.session_id, "browser-2:task-9");
        assert_eq!(after.key_count, 2);
    }

    #[tokio::test]
    async fn reset_stats_zeroes_counters_and_collaborators() {
        let transport = ScriptedTransport::new(vec![ok("x")]);
        let router = router(base_config(), transport);

        router.process_request(hello_request()).await;
        assert_eq!(router.stats().successes, 1);

        router.reset_stats();
        let stats = router.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.successes, 0);
        assert!(router.detailed_stats().models.is_empty(), "perf tracker was reset");
    }

    #[tokio::test]
    async fn detailed_stats_exposes_model_records() {
        let transport = ScriptedTransport::new(vec![http(429), ok("y")]);
        let router = router(base_config(), transport);

        router.process_request(hello_request()).await;
        let detailed = router.detailed_stats();
        assert_eq!(detailed.best_model.as_deref(), Some("m2"));
        let m1 = detailed.models.iter().find(|m| m.model == "m1").unwrap();
        assert_eq!(m1.failures, 1);
    }

    #[tokio::test]
    async fn refresh_rate_limits_touches_every_configured_key() {
        struct CountingLimiter {
            refreshed: Mutex<Vec<String>>,
        }

        impl RateLimitTracker for CountingLimiter {
            fn warning_status(&self, _key: &str) -> WarningStatus {
                WarningStatus::Ok
            }
            fn track_request(&self, _key: &str, _model: &str, _success: bool) {}
            fn refresh_key(&self, key: &str) {
                self.refreshed.lock().unwrap().push(key.to_string());
            }
            fn reset(&self) {}
        }

        let limiter = Arc::new(CountingLimiter {
            refreshed: Mutex::new(Vec::new()),
        });
        let transport = ScriptedTransport::new(vec![]);
        let router = router(base_config(), transport).with_rate_limits(limiter.clone());

        router.refresh_rate_limits();
        assert_eq!(
            *limiter.refreshed.lock().unwrap(),
            vec!["sk-a".to_string(), "sk-b".to_string()]
        );
    }

    #[test]
    fn construction_rejects_invalid_config() {
        let mut cfg = base_config();
        cfg.timeouts.quick_ms = 0;
        let err = CascadeRouter::new(cfg, "b", "t").unwrap_err();
        assert!(err.to_string().contains("quick_ms"));
    }

    #[test]
    fn validate_config_is_exposed_on_the_router() {
        let report = CascadeRouter::validate_config(&base_config());
        assert!(report.valid);
    }
}
