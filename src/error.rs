//! Error types raised by the data bridge and token provider.
//!
//! These cross the interpreter boundary as external Lua errors and are
//! recovered by the execution host, so they must stay `Clone + Send + Sync`.

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Failures of the data bridge, the token provider, or their configuration.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// Missing tenant, environment, or credentials. No network call was made.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The relative path does not resolve inside the environment's API scope.
    #[error("invalid request path: {0}")]
    InvalidPath(String),

    /// The identity provider refused the client-credentials grant.
    #[error("token request rejected by identity provider ({status}): {body}")]
    Auth { status: u16, body: String },

    /// DNS, connect, TLS or timeout failure reaching the identity or data endpoint.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The data API answered with a non-2xx status.
    #[error(transparent)]
    Upstream(Box<UpstreamApiError>),

    /// A 2xx response could not be decoded as advertised.
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl BridgeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }

    /// Upstream status code, if this is an upstream API error.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Upstream(upstream) => Some(upstream.status),
            _ => None,
        }
    }
}

/// Full diagnostic payload of a non-2xx data API response.
#[derive(Debug, Clone, Error)]
#[error("upstream API returned {status} for {url}: {body}")]
pub struct UpstreamApiError {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// The body parsed as JSON, when it decodes.
    pub json: Option<JsonValue>,
}

impl UpstreamApiError {
    pub fn new(status: u16, url: String, headers: Vec<(String, String)>, body: String) -> Self {
        let json = serde_json::from_str(&body).ok();
        Self {
            status,
            url,
            headers,
            body,
            json,
        }
    }

    /// Multi-line rendering appended to execution fault traces.
    pub fn diagnostics(&self) -> String {
        let mut out = format!("\nupstream status: {}\nupstream url: {}\n", self.status, self.url);
        out.push_str("upstream headers:\n");
        for (name, value) in &self.headers {
            out.push_str(&format!("  {name}: {value}\n"));
        }
        out.push_str("upstream body:\n");
        out.push_str(&self.body);
        out.push('\n');
        out
    }
}
