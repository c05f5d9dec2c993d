//! Request pipeline.
//!
//! admission -> capability registry -> execution host -> normalizer -> reply.
//! Each stage runs only if the previous one succeeded, and the interpreter
//! lives exactly as long as one call to [`Gateway::handle`].

use anyhow::{anyhow, Result};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

use crate::admission::{AdmissionFilter, Rejection};
use crate::bridge::{DataBridge, TokenCache};
use crate::capability::CapabilityRegistry;
use crate::config::GatewayConfig;
use crate::host::{ExecutionFault, ExecutionHost, ExecutionResult};
use crate::normalize::Normalizer;
use crate::ScriptRequest;

pub const RESULT_CONTRACT_HEADER: &str = "X-Result-Contract";
pub const RESULT_CONTRACT_VERSION: &str = "1";
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

const NO_OUTPUT_MESSAGE: &str = "Error: No 'output' variable returned from the script.";

/// Terminal state of one script request.
#[derive(Debug)]
pub enum Outcome {
    Completed(JsonValue),
    Rejected(Rejection),
    NoOutput,
    Fault(ExecutionFault),
}

impl Outcome {
    pub fn status(&self) -> u16 {
        match self {
            Outcome::Completed(_) => 200,
            Outcome::Rejected(_) | Outcome::NoOutput => 400,
            Outcome::Fault(_) => 500,
        }
    }

    pub fn into_reply(self, correlation_id: &str) -> Reply {
        let status = self.status();
        let reply = match self {
            Outcome::Completed(result) => Reply::json(status, &json!({ "result": result })),
            Outcome::Rejected(rejection) => Reply::text(
                status,
                format!(
                    "Error: Unsafe code detected (restricted identifier '{}' used).",
                    rejection.identifier
                ),
            ),
            Outcome::NoOutput => Reply::text(status, NO_OUTPUT_MESSAGE),
            Outcome::Fault(fault) => Reply::text(
                status,
                format!("Error during execution:\n{}\n\n{}", fault.message, fault.trace),
            ),
        };
        reply.with_contract(correlation_id)
    }
}

/// A transport-neutral HTTP reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Reply {
    pub fn json(status: u16, body: &JsonValue) -> Self {
        Self {
            status,
            content_type: "application/json",
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Stamp the result-contract version and correlation id headers.
    pub fn with_contract(mut self, correlation_id: &str) -> Self {
        self.headers.push((
            RESULT_CONTRACT_HEADER.to_string(),
            RESULT_CONTRACT_VERSION.to_string(),
        ));
        self.headers
            .push((CORRELATION_HEADER.to_string(), correlation_id.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Immutable, shareable request pipeline.
pub struct Gateway {
    admission: AdmissionFilter,
    normalizer: Normalizer,
    bridge: DataBridge,
}

impl Gateway {
    pub fn new(admission: AdmissionFilter, normalizer: Normalizer, bridge: DataBridge) -> Self {
        Self {
            admission,
            normalizer,
            bridge,
        }
    }

    pub fn from_config(cfg: &GatewayConfig) -> Result<Self> {
        let admission = AdmissionFilter::new(&cfg.deny_extra)
            .map_err(|e| anyhow!("invalid admission denylist: {}", e))?;
        let mut bridge = DataBridge::new(Arc::new(cfg.bridge.clone()));
        if let Some(refresh_skew) = cfg.token_cache {
            log::info!(
                "token cache enabled (refresh skew {}s)",
                refresh_skew.as_secs()
            );
            bridge = bridge.with_token_cache(Arc::new(TokenCache::new(refresh_skew)));
        }
        Ok(Self::new(
            admission,
            Normalizer::new(cfg.fallback.clone()),
            bridge,
        ))
    }

    pub fn bridge(&self) -> &DataBridge {
        &self.bridge
    }

    /// Run one script to a terminal outcome.
    pub fn handle(&self, request: &ScriptRequest) -> Outcome {
        let id = request.correlation_id.as_str();
        if let Err(rejection) = self.admission.check(&request.code) {
            log::warn!(
                "[{}] script rejected: {} at offset {}",
                id,
                rejection,
                rejection.offset
            );
            return Outcome::Rejected(rejection);
        }

        let host = match ExecutionHost::new() {
            Ok(host) => host,
            Err(fault) => return self.fault(id, fault),
        };
        let registry = match CapabilityRegistry::build(host.lua(), self.bridge.clone()) {
            Ok(registry) => registry,
            Err(err) => return self.fault(id, ExecutionFault::from_lua(err)),
        };

        match host.execute(&request.code, &registry) {
            Ok(ExecutionResult::Bound(value)) => {
                let result = self.normalizer.normalize(host.lua(), &value);
                log::info!("[{}] script completed", id);
                Outcome::Completed(result)
            }
            Ok(ExecutionResult::Absent) => {
                log::info!("[{}] script completed without an output binding", id);
                Outcome::NoOutput
            }
            Err(fault) => self.fault(id, fault),
        }
    }

    fn fault(&self, id: &str, fault: ExecutionFault) -> Outcome {
        match fault.bridge.as_ref().and_then(|b| b.upstream_status()) {
            Some(status) => log::error!(
                "[{}] script failed (upstream status {}): {}",
                id,
                status,
                fault.message
            ),
            None => log::error!("[{}] script failed: {}", id, fault.message),
        }
        Outcome::Fault(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeSettings, ClientCredentials};

    fn gateway() -> Gateway {
        let mut settings = BridgeSettings::new(ClientCredentials::new("t", "c", "s"));
        settings.authority = "http://127.0.0.1:9".to_string();
        Gateway::new(
            AdmissionFilter::standard().unwrap(),
            Normalizer::default(),
            DataBridge::new(Arc::new(settings)),
        )
    }

    fn run(code: &str) -> Outcome {
        gateway().handle(&ScriptRequest::new(code))
    }

    #[test]
    fn arithmetic_result_is_wrapped() {
        let reply = run("output = 2 + 2").into_reply("abc");
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, r#"{"result":4}"#);
        assert_eq!(reply.header("x-result-contract"), Some("1"));
        assert_eq!(reply.header("x-correlation-id"), Some("abc"));
    }

    #[test]
    fn admission_rejection_names_identifier() {
        let outcome = run("import os\noutput = 1");
        assert!(matches!(&outcome, Outcome::Rejected(r) if r.identifier == "os"));
        let reply = outcome.into_reply("x");
        assert_eq!(reply.status, 400);
        assert!(reply.body.contains("'os'"));
    }

    #[test]
    fn missing_output_is_a_400() {
        let reply = run("local x = 1").into_reply("x");
        assert_eq!(reply.status, 400);
        assert_eq!(reply.body, NO_OUTPUT_MESSAGE);
    }

    #[test]
    fn faults_carry_message_and_trace() {
        let reply = run("output = nil + 1").into_reply("x");
        assert_eq!(reply.status, 500);
        assert!(reply.body.starts_with("Error during execution:\n"));
        assert!(reply.body.contains("attempt to perform arithmetic"));
        assert!(reply.body.contains("\n\n"));
    }

    #[test]
    fn frames_and_analysis_flow_through() {
        let outcome = run(
            r#"
            local f = Frame({ {k = "a", v = 1}, {k = "b", v = 2}, {k = "a", v = 3} })
            output = { totals = f:group_sum("k", "v"), n = len(f), avg = stats.mean(f:column("v")) }
            "#,
        );
        match outcome {
            Outcome::Completed(result) => assert_eq!(
                result,
                json!({"totals": {"a": 4, "b": 2}, "n": 3, "avg": 2.0})
            ),
            other => panic!("unexpected {other:?}"),
        }
    }
}
