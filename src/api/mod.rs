use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::gateway::{Gateway, Reply};
use crate::{resolve_correlation_id, ScriptRequest};

const MAX_HEADER_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const EXECUTE_PATHS: &[&str] = &["/execute", "/api/main"];
const FUNCTION_KEY_HEADER: &str = "x-functions-key";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub api_key: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            api_key: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl ApiConfig {
    pub fn from_gateway_config(cfg: &GatewayConfig) -> Self {
        Self {
            addr: cfg.api_addr.clone(),
            api_key: cfg.api_key.clone(),
            max_body_bytes: cfg.max_body_bytes,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    gateway: Arc<Gateway>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, gateway: Arc<Gateway>) -> Self {
        Self { cfg, gateway }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;
        if self.cfg.api_key.is_none() {
            log::warn!("no api key configured; /execute accepts unauthenticated requests");
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let gateway = self.gateway;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, gateway, shutdown_thread) {
                log::error!("script api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    gateway: Arc<Gateway>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = cfg.clone();
                let gateway = gateway.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &gateway) {
                        log::warn!("script api request failed: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, gateway: &Gateway) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream, cfg.max_body_bytes) {
        Ok(request) => request,
        Err(ReadError::TooLarge) => {
            write_reply(&mut stream, &Reply::text(413, "Error: request too large."))?;
            return Ok(());
        }
        Err(ReadError::Malformed(reason)) => {
            write_reply(&mut stream, &Reply::text(400, format!("Error: {reason}.")))?;
            return Ok(());
        }
        Err(ReadError::Io(err)) => return Err(err.into()),
    };

    if request.path == "/health" {
        let reply = if request.method == "GET" {
            Reply::json(200, &serde_json::json!({"status": "ok"}))
        } else {
            Reply::text(405, "Error: method not allowed.")
        };
        return write_reply(&mut stream, &reply);
    }
    if !EXECUTE_PATHS.contains(&request.path.as_str()) {
        return write_reply(&mut stream, &Reply::text(404, "Error: not found."));
    }

    let correlation_id =
        resolve_correlation_id(request.headers.get("x-correlation-id").map(String::as_str));

    if request.method != "POST" {
        let reply = Reply::text(405, "Error: method not allowed.").with_contract(&correlation_id);
        return write_reply(&mut stream, &reply);
    }
    if let Some(expected) = &cfg.api_key {
        if !request.presents_key(expected) {
            log::warn!("[{}] request without a valid api key", correlation_id);
            let reply = Reply::text(401, "Error: missing or invalid api key.")
                .with_contract(&correlation_id);
            return write_reply(&mut stream, &reply);
        }
    }

    let script = match ScriptRequest::from_body(&request.body) {
        Ok(parsed) => parsed.with_correlation_id(correlation_id),
        Err(err) => {
            let reply = Reply::text(400, format!("Error: {err}.")).with_contract(&correlation_id);
            return write_reply(&mut stream, &reply);
        }
    };

    log::info!(
        "[{}] executing script ({} bytes)",
        script.correlation_id,
        script.code.len()
    );
    let reply = gateway.handle(&script).into_reply(&script.correlation_id);
    log::info!("[{}] replied {}", script.correlation_id, reply.status);
    write_reply(&mut stream, &reply)
}

#[derive(Debug, Error)]
enum ReadError {
    #[error("request too large")]
    TooLarge,
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<HttpRequest, ReadError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(ReadError::TooLarge);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Malformed("connection closed before headers completed"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(ReadError::Malformed("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ReadError::Malformed("missing method"))?;
    let raw_path = parts.next().ok_or(ReadError::Malformed("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    if headers.contains_key("transfer-encoding") {
        return Err(ReadError::Malformed("chunked request bodies are not supported"));
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ReadError::Malformed("invalid content-length"))?,
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(ReadError::TooLarge);
    }
    let mut body = data[header_end + 4..].to_vec();
    if body.len() < content_length {
        let mut rest = vec![0u8; content_length - body.len()];
        stream.read_exact(&mut rest)?;
        body.extend_from_slice(&rest);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn write_reply(stream: &mut TcpStream, reply: &Reply) -> Result<()> {
    let status_line = match reply.status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = reply.content_type,
        len = reply.body.len()
    );
    for (name, value) in &reply.headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(reply.body.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn presents_key(&self, expected: &str) -> bool {
        let function_key = self.headers.get(FUNCTION_KEY_HEADER).cloned();
        [function_key, self.bearer_token()]
            .into_iter()
            .flatten()
            .any(|presented| keys_match(&presented, expected))
    }
}

fn keys_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_comparison() {
        assert!(keys_match("abc123", "abc123"));
        assert!(!keys_match("abc124", "abc123"));
        assert!(!keys_match("abc", "abc123"));
    }

    #[test]
    fn key_is_accepted_from_either_header() {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), "Bearer k1".to_string());
        let request = HttpRequest {
            method: "POST".to_string(),
            path: "/execute".to_string(),
            headers,
            body: Vec::new(),
        };
        assert!(request.presents_key("k1"));
        assert!(!request.presents_key("k2"));

        let mut headers = HashMap::new();
        headers.insert(FUNCTION_KEY_HEADER.to_string(), "k2".to_string());
        let request = HttpRequest {
            method: "POST".to_string(),
            path: "/execute".to_string(),
            headers,
            body: Vec::new(),
        };
        assert!(request.presents_key("k2"));
    }
}
