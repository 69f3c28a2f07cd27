//! freecast — cascading multi-provider LLM request router.
//!
//! Turns a chat-completion request into a reliable response despite
//! unreliable upstreams: multiple API keys (one pinned per browser/task
//! session), an ordered model fallback chain enriched by an optional
//! health oracle, per-model circuit breaking, per-key rate-limit and
//! timeout tracking, request deduplication, and proxy transport with
//! direct fallback.
//!
//! The embedding automation layer owns browser discovery, action planning,
//! and logging setup; this crate only owns the routing/fallback engine and
//! talks to everything else through narrow traits.
//!
//! ```no_run
//! use freecast::{CascadeRouter, ChatMessage, CompletionRequest, RouterConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config: RouterConfig = serde_json::from_str(r#"{
//!     "enabled": true,
//!     "api_keys": ["sk-or-..."],
//!     "models": {"primary": "meta-llama/llama-3.3-70b", "fallbacks": ["qwen/qwen-2.5-72b"]}
//! }"#)?;
//!
//! let router = CascadeRouter::new(config, "browser-1", "task-42")?;
//! let outcome = router
//!     .process_request(CompletionRequest::new(vec![ChatMessage::user("hi")]))
//!     .await;
//! if let Some(completion) = outcome.completion() {
//!     println!("{} via {}", completion.content, completion.model);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hash;
pub mod health;
pub mod proxy;
pub mod router;
pub mod session;
pub mod trackers;
pub mod transport;

pub use config::{ConfigReport, ModelsConfig, ProxyConfig, RouterConfig, TimeoutConfig, validate};
pub use error::{CallError, ConfigError, FailureReason};
pub use health::{ModelHealthOracle, ModelHealthReport, ModelsInfo};
pub use proxy::{ProxyEndpoint, parse_proxy, select_request_proxy};
pub use router::{
    CascadeFailure, CascadeOutcome, CascadeRouter, Completion, CompletionRequest, DetailedStats,
    MAX_RETRIES, SessionInfo, StatsSnapshot,
};
pub use session::SessionIdentity;
pub use trackers::{
    CircuitBreaker, DedupeCache, KeyTimeoutTracker, ModelPerfTracker, RateLimitTracker,
    TimeoutClass, WarningStatus,
};
pub use transport::{ChatMessage, ChatReply, ChatTransport, HttpTransport, NormalizedRequest};
