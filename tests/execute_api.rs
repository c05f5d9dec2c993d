mod support;

use anyhow::Result;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use script_gateway::api::{ApiConfig, ApiHandle, ApiServer};
use script_gateway::{AdmissionFilter, DataBridge, Gateway, Normalizer};
use support::MockUpstream;

struct Response {
    status: u16,
    headers: String,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<String> {
        self.headers.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim()
                .eq_ignore_ascii_case(name)
                .then(|| v.trim().to_string())
        })
    }

    fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

fn read_response(stream: &mut TcpStream) -> Result<Response> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Ok(Response {
        status,
        headers,
        body,
    })
}

struct TestApi {
    upstream: MockUpstream,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(api_key: Option<&str>) -> Result<Self> {
        Self::with_limit(api_key, 64 * 1024)
    }

    fn with_limit(api_key: Option<&str>, max_body_bytes: usize) -> Result<Self> {
        let upstream = MockUpstream::business_central()?;
        let gateway = Gateway::new(
            AdmissionFilter::standard()?,
            Normalizer::default(),
            DataBridge::new(Arc::new(upstream.bridge_settings())),
        );
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            api_key: api_key.map(str::to_string),
            max_body_bytes,
        };
        let api_handle = ApiServer::new(api_config, Arc::new(gateway)).spawn()?;
        Ok(Self {
            upstream,
            api_handle: Some(api_handle),
        })
    }

    fn send(&self, raw: &str) -> Result<Response> {
        let addr = self
            .api_handle
            .as_ref()
            .map(|handle| handle.addr)
            .ok_or_else(|| anyhow::anyhow!("api stopped"))?;
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(raw.as_bytes())?;
        read_response(&mut stream)
    }

    fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> Result<Response> {
        let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
        self.send(&raw)
    }

    fn execute(&self, code: &str) -> Result<Response> {
        self.execute_with(code, &[])
    }

    fn execute_with(&self, code: &str, headers: &[(&str, &str)]) -> Result<Response> {
        let body = json!({ "code": code }).to_string();
        let mut all = vec![("Content-Type", "application/json")];
        all.extend_from_slice(headers);
        self.request("POST", "/execute", &all, &body)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
    }
}

#[test]
fn arithmetic_script_returns_wrapped_result() -> Result<()> {
    let api = TestApi::new(None)?;
    let response = api.execute_with("output = 2 + 2", &[("X-Correlation-Id", "req-1")])?;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()?, json!({"result": 4}));
    assert_eq!(response.header("x-result-contract").as_deref(), Some("1"));
    assert_eq!(response.header("x-correlation-id").as_deref(), Some("req-1"));
    assert_eq!(api.upstream.request_count(), 0);
    Ok(())
}

#[test]
fn correlation_id_is_generated_when_absent() -> Result<()> {
    let api = TestApi::new(None)?;
    let response = api.execute("output = 'hi'")?;
    assert_eq!(response.status, 200);
    let id = response.header("x-correlation-id").unwrap_or_default();
    assert_eq!(id.len(), 32);
    Ok(())
}

#[test]
fn rejected_scripts_never_reach_the_bridge() -> Result<()> {
    let api = TestApi::new(None)?;
    let response = api.execute("import os\noutput = fetch('companies', 'sandbox')")?;
    assert_eq!(response.status, 400);
    assert!(response.body.contains("'os'"));
    assert_eq!(response.header("x-result-contract").as_deref(), Some("1"));
    assert_eq!(api.upstream.request_count(), 0);
    Ok(())
}

#[test]
fn scripts_without_output_are_client_errors() -> Result<()> {
    let api = TestApi::new(None)?;
    let response = api.execute("local total = 1 + 1")?;
    assert_eq!(response.status, 400);
    assert!(response.body.contains("No 'output' variable"));
    Ok(())
}

#[test]
fn fetched_records_flow_into_output() -> Result<()> {
    let api = TestApi::new(None)?;
    let response = api.execute(
        r#"
        local data = fetch("companies", "sandbox")
        local names = {}
        for _, company in ipairs(data.value) do
            names[#names + 1] = company.name
        end
        output = { names = names, context = data["@odata.context"] }
        "#,
    )?;
    assert_eq!(response.status, 200, "body: {}", response.body);
    assert_eq!(
        response.json()?,
        json!({"result": {"names": ["CRONUS", "Fabrikam"], "context": "ctx"}})
    );
    assert_eq!(api.upstream.token_requests(), 1);
    Ok(())
}

#[test]
fn frames_built_from_fetched_data_serialize() -> Result<()> {
    let api = TestApi::new(None)?;
    let response = api.execute(
        r#"
        local f = Frame(fetch("companies", "sandbox"))
        output = {
            total = f:sum("revenue"),
            rows = len(f),
            top = f:sort_by("revenue", true):head(1),
        }
        "#,
    )?;
    assert_eq!(response.status, 200, "body: {}", response.body);
    assert_eq!(
        response.json()?,
        json!({"result": {
            "total": 200.5,
            "rows": 2,
            "top": {"id": ["1"], "name": ["CRONUS"], "revenue": [120.5]}
        }})
    );
    Ok(())
}

#[test]
fn upstream_failures_surface_as_execution_faults() -> Result<()> {
    let api = TestApi::new(None)?;
    let response = api.execute("output = fetch('companies', 'nonexistent')")?;
    assert_eq!(response.status, 500);
    assert!(response.body.starts_with("Error during execution:"));
    assert!(response.body.contains("404"));
    assert!(response.body.contains("NoEnvironment"));
    Ok(())
}

#[test]
fn missing_environment_faults_without_network() -> Result<()> {
    let api = TestApi::new(None)?;
    let response = api.execute("output = fetch('companies')")?;
    assert_eq!(response.status, 500);
    assert!(response.body.contains("environment is required"));
    assert_eq!(api.upstream.request_count(), 0);
    Ok(())
}

#[test]
fn api_key_is_enforced_when_configured() -> Result<()> {
    let api = TestApi::new(Some("k-secret"))?;

    let response = api.execute("output = 1")?;
    assert_eq!(response.status, 401);

    let response = api.execute_with("output = 1", &[("x-functions-key", "k-wrong")])?;
    assert_eq!(response.status, 401);

    let response = api.execute_with("output = 1", &[("x-functions-key", "k-secret")])?;
    assert_eq!(response.status, 200);

    let response = api.execute_with("output = 1", &[("Authorization", "Bearer k-secret")])?;
    assert_eq!(response.status, 200);
    Ok(())
}

#[test]
fn function_route_alias_runs_scripts() -> Result<()> {
    let api = TestApi::new(None)?;
    let body = json!({"code": "output = {1, 2, 3}"}).to_string();
    let response = api.request("POST", "/api/main", &[], &body)?;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()?, json!({"result": [1, 2, 3]}));
    Ok(())
}

#[test]
fn health_and_routing() -> Result<()> {
    let api = TestApi::new(Some("k-secret"))?;

    let response = api.request("GET", "/health", &[], "")?;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()?, json!({"status": "ok"}));

    let response = api.request("GET", "/execute", &[], "")?;
    assert_eq!(response.status, 405);

    let response = api.request("POST", "/nope", &[], "{}")?;
    assert_eq!(response.status, 404);
    Ok(())
}

#[test]
fn malformed_bodies_are_rejected() -> Result<()> {
    let api = TestApi::new(None)?;

    let response = api.request("POST", "/execute", &[], "not json")?;
    assert_eq!(response.status, 400);

    let response = api.request("POST", "/execute", &[], r#"{"script": "output = 1"}"#)?;
    assert_eq!(response.status, 400);
    assert!(response.body.contains("'code'"));
    Ok(())
}

#[test]
fn oversized_bodies_are_refused() -> Result<()> {
    let api = TestApi::with_limit(None, 16)?;
    let response = api.send(
        "POST /execute HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100000\r\n\r\n",
    )?;
    assert_eq!(response.status, 413);
    Ok(())
}
