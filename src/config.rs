use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::bridge::cache::DEFAULT_REFRESH_SKEW;
use crate::bridge::{BridgeSettings, ClientCredentials};
use crate::normalize::{FallbackPolicy, FallbackStrategy};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize, Default)]
struct GatewayConfigFile {
    api: Option<ApiConfigFile>,
    bridge: Option<BridgeConfigFile>,
    admission: Option<AdmissionConfigFile>,
    normalizer: Option<FallbackPolicy>,
    token_cache: Option<TokenCacheConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    api_key: Option<String>,
    max_body_bytes: Option<usize>,
}

#[derive(Deserialize, Default)]
struct BridgeConfigFile {
    tenant_id: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    api_base: Option<String>,
    authority: Option<String>,
    scope: Option<String>,
    api_version: Option<String>,
    timeout_secs: Option<u64>,
}

impl fmt::Debug for BridgeConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfigFile")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, Default)]
struct AdmissionConfigFile {
    deny: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenCacheConfigFile {
    enabled: Option<bool>,
    refresh_skew_secs: Option<u64>,
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub api_addr: String,
    /// Access key required on `/execute` when set.
    pub api_key: Option<String>,
    pub max_body_bytes: usize,
    pub bridge: BridgeSettings,
    /// Identifiers appended to the default admission denylist.
    pub deny_extra: Vec<String>,
    pub fallback: FallbackPolicy,
    /// Refresh skew when the token cache is enabled.
    pub token_cache: Option<Duration>,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("api_addr", &self.api_addr)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_body_bytes", &self.max_body_bytes)
            .field("bridge", &self.bridge)
            .field("deny_extra", &self.deny_extra)
            .field("fallback", &self.fallback)
            .field("token_cache", &self.token_cache)
            .finish()
    }
}

impl GatewayConfig {
    /// File named by `GATEWAY_CONFIG` (if any), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GATEWAY_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GatewayConfigFile) -> Result<Self> {
        let api = file.api.unwrap_or_default();
        let bridge_file = file.bridge.unwrap_or_default();

        let credentials = ClientCredentials::new(
            bridge_file.tenant_id.unwrap_or_default(),
            bridge_file.client_id.unwrap_or_default(),
            bridge_file.client_secret.unwrap_or_default(),
        );
        let mut bridge = BridgeSettings::new(credentials);
        if let Some(api_base) = bridge_file.api_base {
            bridge.api_base = api_base;
        }
        if let Some(authority) = bridge_file.authority {
            bridge.authority = authority;
        }
        if let Some(scope) = bridge_file.scope {
            bridge.scope = scope;
        }
        if let Some(version) = bridge_file.api_version {
            bridge.api_version = non_empty(version);
        }
        if let Some(secs) = bridge_file.timeout_secs {
            bridge.timeout = Duration::from_secs(secs);
        }

        let token_cache = file.token_cache.and_then(|tc| {
            tc.enabled.unwrap_or(false).then(|| {
                tc.refresh_skew_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_REFRESH_SKEW)
            })
        });

        Ok(Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            api_key: api.api_key.and_then(non_empty),
            max_body_bytes: api.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            bridge,
            deny_extra: file.admission.and_then(|a| a.deny).unwrap_or_default(),
            fallback: file.normalizer.unwrap_or_default(),
            token_cache,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("GATEWAY_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(key) = std::env::var("GATEWAY_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(tenant) = std::env::var("BC_TENANT_ID") {
            if !tenant.trim().is_empty() {
                self.bridge.credentials.tenant_id = tenant;
            }
        }
        if let Ok(client_id) = std::env::var("BC_CLIENT_ID") {
            if !client_id.trim().is_empty() {
                self.bridge.credentials.client_id = client_id;
            }
        }
        if let Ok(secret) = std::env::var("BC_CLIENT_SECRET") {
            if !secret.is_empty() {
                self.bridge.credentials.set_client_secret(secret);
            }
        }
        if let Ok(api_base) = std::env::var("BC_API_BASE") {
            if !api_base.trim().is_empty() {
                self.bridge.api_base = api_base;
            }
        }
        if let Ok(authority) = std::env::var("BC_AUTHORITY") {
            if !authority.trim().is_empty() {
                self.bridge.authority = authority;
            }
        }
        if let Ok(scope) = std::env::var("BC_SCOPE") {
            if !scope.trim().is_empty() {
                self.bridge.scope = scope;
            }
        }
        if let Ok(version) = std::env::var("BC_API_VERSION") {
            self.bridge.api_version = non_empty(version);
        }
        if let Ok(timeout) = std::env::var("BC_HTTP_TIMEOUT_SECS") {
            let seconds: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("BC_HTTP_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.bridge.timeout = Duration::from_secs(seconds);
        }
        if let Ok(deny) = std::env::var("GATEWAY_DENY_EXTRA") {
            for ident in split_csv(&deny) {
                if !self.deny_extra.contains(&ident) {
                    self.deny_extra.push(ident);
                }
            }
        }
        if let Ok(fields) = std::env::var("GATEWAY_STRINGIFY_FIELDS") {
            for field in split_csv(&fields) {
                self.fallback.fields.insert(field, FallbackStrategy::Stringify);
            }
        }
        if let Ok(flag) = std::env::var("GATEWAY_TOKEN_CACHE") {
            let enabled = parse_flag(&flag)
                .ok_or_else(|| anyhow!("GATEWAY_TOKEN_CACHE must be true or false"))?;
            self.token_cache = match (enabled, self.token_cache) {
                (false, _) => None,
                (true, Some(skew)) => Some(skew),
                (true, None) => Some(DEFAULT_REFRESH_SKEW),
            };
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let missing = self.bridge.credentials.missing();
        if !missing.is_empty() {
            return Err(anyhow!(
                "missing required bridge credentials: {} (set BC_TENANT_ID, BC_CLIENT_ID, BC_CLIENT_SECRET)",
                missing.join(", ")
            ));
        }
        for (name, value) in [
            ("api_base", &self.bridge.api_base),
            ("authority", &self.bridge.authority),
        ] {
            let url = url::Url::parse(value)
                .map_err(|e| anyhow!("bridge {} '{}' is not a valid URL: {}", name, value, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!("bridge {} must be an http(s) URL", name));
            }
        }
        if self.bridge.timeout.as_secs() == 0 {
            return Err(anyhow!("bridge timeout must be greater than zero"));
        }
        if self.max_body_bytes == 0 {
            return Err(anyhow!("api max_body_bytes must be greater than zero"));
        }
        self.deny_extra.retain(|ident| !ident.trim().is_empty());
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<GatewayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
