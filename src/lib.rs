//! Script Gateway
//!
//! Runs user-submitted Lua scripts against a curated capability set and
//! returns whatever the script binds to `output`, normalized to JSON.
//!
//! # Pipeline
//!
//! 1. **Admission**: whole-word denylist check on the raw text, before any
//!    interpreter exists.
//! 2. **Capabilities**: a fresh interpreter and a namespace built from a
//!    static allow-list; the only network-capable entry is `fetch`.
//! 3. **Execution**: the script runs in an empty scope whose outer namespace
//!    is the registry; `output` is read back from that scope.
//! 4. **Normalization**: the output becomes a JSON tree; unrepresentable
//!    shapes follow a declared fallback policy.
//!
//! # Module Structure
//!
//! - `admission`: lexical denylist prefilter
//! - `analysis`: builtins, `stats`, `Frame`
//! - `capability`: the script namespace
//! - `host`: interpreter lifecycle and fault capture
//! - `normalize`: output to JSON
//! - `bridge`: data API reads, token acquisition, optional token cache
//! - `gateway`: the request pipeline and reply mapping
//! - `api`: HTTP listener
//! - `config`: file and environment configuration

use rand::RngCore;
use serde::Deserialize;
use thiserror::Error;

pub mod admission;
pub mod analysis;
pub mod api;
pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod gateway;
pub mod host;
pub mod normalize;

pub use admission::{AdmissionFilter, Rejection};
pub use bridge::{AccessToken, BridgeSettings, ClientCredentials, DataBridge, TokenCache};
pub use capability::{CapabilityRegistry, CAPABILITIES};
pub use error::{BridgeError, UpstreamApiError};
pub use gateway::{Gateway, Outcome, Reply};
pub use host::{ExecutionFault, ExecutionHost, ExecutionResult};
pub use normalize::{FallbackPolicy, FallbackStrategy, Normalizer};

const MAX_CORRELATION_ID_LEN: usize = 128;

/// 16 random bytes, hex encoded.
pub fn new_correlation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The caller's correlation id when it is a plausible token, else a new one.
pub fn resolve_correlation_id(presented: Option<&str>) -> String {
    match presented.map(str::trim).filter(|id| valid_correlation_id(id)) {
        Some(id) => id.to_string(),
        None => new_correlation_id(),
    }
}

fn valid_correlation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CORRELATION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request body is not valid JSON: {0}")]
    Json(String),
    #[error("request body must be a JSON object with a string 'code' field")]
    MissingCode,
}

#[derive(Deserialize)]
struct ExecuteBody {
    code: Option<serde_json::Value>,
}

/// One script submission. Lives for a single call.
#[derive(Clone, Debug)]
pub struct ScriptRequest {
    pub code: String,
    pub correlation_id: String,
}

impl ScriptRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            correlation_id: new_correlation_id(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Parse an `{"code": "..."}` request body.
    pub fn from_body(body: &[u8]) -> Result<Self, RequestError> {
        let parsed: ExecuteBody =
            serde_json::from_slice(body).map_err(|e| RequestError::Json(e.to_string()))?;
        match parsed.code {
            Some(serde_json::Value::String(code)) => Ok(Self::new(code)),
            _ => Err(RequestError::MissingCode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_random_hex() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn caller_correlation_id_is_kept_when_safe() {
        assert_eq!(resolve_correlation_id(Some(" req-42 ")), "req-42");
        assert_eq!(resolve_correlation_id(Some("bad\r\nheader")).len(), 32);
        assert_eq!(resolve_correlation_id(Some("")).len(), 32);
        assert_eq!(resolve_correlation_id(None).len(), 32);
    }

    #[test]
    fn body_parsing() {
        let req = ScriptRequest::from_body(br#"{"code":"output = 1"}"#).unwrap();
        assert_eq!(req.code, "output = 1");
        assert!(matches!(
            ScriptRequest::from_body(b"not json"),
            Err(RequestError::Json(_))
        ));
        assert_eq!(
            ScriptRequest::from_body(br#"{"code": 5}"#).unwrap_err(),
            RequestError::MissingCode
        );
        assert_eq!(
            ScriptRequest::from_body(br#"{}"#).unwrap_err(),
            RequestError::MissingCode
        );
    }
}
