//! Proxy list parsing and per-request selection.
//!
//! Proxies are configured as `host:port` or `host:port:username:password`
//! strings. Selection is uniformly random per outbound call, deliberately
//! not pinned to the session, so successive requests from one session do
//! not correlate to one exit address.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::ProxyConfig;

/// A parsed proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    /// The `http://host:port` URL reqwest expects for a proxy.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Parse a raw proxy string.
///
/// Accepts exactly 2 fields (`host:port`) or exactly 4
/// (`host:port:username:password`). Any other shape, including the empty
/// string, yields `None` — malformed entries mean "no usable proxy", they
/// are never an error.
pub fn parse_proxy(raw: &str) -> Option<ProxyEndpoint> {
    if raw.is_empty() {
        return None;
    }
    let fields: Vec<&str> = raw.split(':').collect();
    match fields.as_slice() {
        [host, port] => Some(ProxyEndpoint {
            host: host.to_string(),
            port: port.to_string(),
            username: None,
            password: None,
        }),
        [host, port, user, pass] => Some(ProxyEndpoint {
            host: host.to_string(),
            port: port.to_string(),
            username: Some(user.to_string()),
            password: Some(pass.to_string()),
        }),
        _ => None,
    }
}

/// Pick one raw proxy string for this outbound call.
///
/// `None` when the proxy layer is disabled or the list is empty.
pub fn select_request_proxy(cfg: &ProxyConfig) -> Option<&str> {
    if !cfg.enabled || cfg.list.is_empty() {
        return None;
    }
    cfg.list
        .choose(&mut rand::thread_rng())
        .map(|s| s.as_str())
}
