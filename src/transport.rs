//! HTTP transport to the upstream chat-completions endpoint.
//!
//! Two entry points with one contract: `direct` goes straight out,
//! `via_proxy` routes through a parsed proxy endpoint. Both bound the call
//! with a per-request timeout (reqwest aborts the in-flight request when it
//! elapses) and classify every failure into a [`CallError`] variant so the
//! cascade loop can decide what to do next without inspecting strings.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CallError;
use crate::proxy::ProxyEndpoint;

/// One chat message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A request after the router has filled in defaults. The model is chosen
/// per attempt, so it is not part of this struct.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// A successful upstream reply.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub content: String,
    pub usage: Option<serde_json::Value>,
}

/// Extract reply content from a parsed response.
///
/// Some providers stream "thinking" into `reasoning_content` and leave
/// `content` empty; fall back to it so those replies are not lost.
fn extract_reply(resp: WireResponse) -> ChatReply {
    let message = resp
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .unwrap_or_default();
    let content = match message.content {
        Some(c) if !c.is_empty() => c,
        _ => message.reasoning_content.unwrap_or_default(),
    };
    ChatReply {
        content,
        usage: resp.usage,
    }
}

/// The seam between the cascade loop and the network.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn direct(
        &self,
        model: &str,
        request: &NormalizedRequest,
        api_key: &str,
        timeout: Duration,
    ) -> Result<ChatReply, CallError>;

    async fn via_proxy(
        &self,
        model: &str,
        request: &NormalizedRequest,
        api_key: &str,
        proxy: &ProxyEndpoint,
        timeout: Duration,
    ) -> Result<ChatReply, CallError>;
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        model: &str,
        request: &NormalizedRequest,
        api_key: &str,
        timeout: Duration,
    ) -> Result<ChatReply, CallError> {
        let body = WireRequest {
            model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let response = client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(model, status = status.as_u16(), "upstream returned non-2xx");
            return Err(CallError::from_status(status.as_u16(), body));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| CallError::Network(format!("invalid response body: {e}")))?;
        Ok(extract_reply(parsed))
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn direct(
        &self,
        model: &str,
        request: &NormalizedRequest,
        api_key: &str,
        timeout: Duration,
    ) -> Result<ChatReply, CallError> {
        self.post(&self.client, model, request, api_key, timeout).await
    }

    async fn via_proxy(
        &self,
        model: &str,
        request: &NormalizedRequest,
        api_key: &str,
        proxy: &ProxyEndpoint,
        timeout: Duration,
    ) -> Result<ChatReply, CallError> {
        let mut builder =
            reqwest::Proxy::all(proxy.url()).map_err(|e| CallError::Proxy(e.to_string()))?;
        if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
            builder = builder.basic_auth(user, pass);
        }
        // One-off client per proxy call: proxy choice varies per request.
        let client = reqwest::Client::builder()
            .proxy(builder)
            .build()
            .map_err(|e| CallError::Proxy(e.to_string()))?;
        self.post(&client, model, request, api_key, timeout).await
    }
}

fn classify_reqwest_error(e: reqwest::Error, timeout: Duration) -> CallError {
    if e.is_timeout() {
        CallError::Timeout { after: timeout }
    } else {
        CallError::Network(e.to_string())
    }
}
