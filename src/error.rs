//! Error taxonomy.
//!
//! Transport failures are classified into [`CallError`] and consumed inside
//! the cascade loop as "try the next candidate" signals; they never cross
//! the public boundary. The only `Err` a caller can see is [`ConfigError`]
//! at construction. Terminal cascade outcomes are reported as values
//! ([`FailureReason`]) so callers can distinguish failure modes without
//! parsing stack traces.

use std::time::Duration;

/// A classified transport-level failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// Non-2xx response from the upstream provider.
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        retryable: bool,
    },

    /// The per-call deadline elapsed and the request was aborted.
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    /// The proxy client could not be constructed; no network attempt made.
    #[error("proxy setup failed: {0}")]
    Proxy(String),

    /// Connection/DNS/TLS failure below the HTTP layer.
    #[error("network error: {0}")]
    Network(String),
}

impl CallError {
    /// Classify an HTTP status. 429 and all 5xx are retryable.
    pub fn from_status(status: u16, body: String) -> Self {
        Self::Http {
            status,
            body,
            retryable: status == 429 || (500..600).contains(&status),
        }
    }

    /// True for failures worth counting against a model's rate-limit set:
    /// 429 and server errors.
    pub fn is_rate_limit_class(&self) -> bool {
        matches!(self, Self::Http { retryable: true, .. })
    }
}

/// Construction-time configuration failure.
#[derive(Debug, thiserror::Error)]
#[error("invalid router configuration: {}", errors.join("; "))]
pub struct ConfigError {
    pub errors: Vec<String>,
}

/// Why a cascade terminated without a completion.
///
/// Display strings are part of the contract: callers pattern-match on
/// "not enabled" and "exhausted".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Router is switched off.
    NotEnabled,
    /// No API keys configured, so no session key could be pinned.
    NoKeys,
    /// No primary, no fallbacks, no known-working models.
    NoCandidates,
    /// The session's pinned key has zero remaining quota.
    KeyExhausted { key_index: usize },
    /// Every candidate and retry was consumed.
    Exhausted { retries: u32 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotEnabled => write!(f, "Free API router not enabled"),
            Self::NoKeys => write!(f, "No API keys configured"),
            Self::NoCandidates => write!(f, "No candidate models configured"),
            Self::KeyExhausted { key_index } => {
                write!(f, "API key #{key_index} rate limit exhausted")
            }
            Self::Exhausted { retries } => {
                write!(f, "All models and fallbacks exhausted after {retries} retries")
            }
        }
    }
}
