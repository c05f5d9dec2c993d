//! Data bridge.
//!
//! The only network-capable capability a script can reach. Each call:
//! 1. Validates the environment name and the resolved URL (no network yet)
//! 2. Acquires a bearer token (fresh per call unless the token cache is on)
//! 3. Issues one authenticated GET against the tenant/environment-scoped API
//!
//! The bridge MUST NOT:
//! - Hand the token or client secret to script code
//! - Retry failed requests
//! - Log bearer tokens or secrets

pub mod cache;
pub mod token;

use serde_json::{json, Value as JsonValue};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{BridgeError, UpstreamApiError};
pub use cache::TokenCache;
pub use token::{AccessToken, ClientCredentials, TokenProvider};

pub const DEFAULT_API_BASE: &str = "https://api.businesscentral.dynamics.com/v2.0";
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_SCOPE: &str = "https://api.businesscentral.dynamics.com/.default";
pub const DEFAULT_API_VERSION: &str = "v2.0";
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Key under which non-JSON 2xx bodies are returned.
pub const TEXT_DATA_FIELD: &str = "text_data";

/// Endpoint and credential settings shared by every bridge call.
#[derive(Clone, Debug)]
pub struct BridgeSettings {
    pub api_base: String,
    pub authority: String,
    pub scope: String,
    /// Path segment after `/api`; omitted when `None`.
    pub api_version: Option<String>,
    pub credentials: ClientCredentials,
    pub timeout: Duration,
}

impl BridgeSettings {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            authority: DEFAULT_AUTHORITY.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            api_version: Some(DEFAULT_API_VERSION.to_string()),
            credentials,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    fn scope_prefix(&self, environment: &str) -> String {
        let mut prefix = format!(
            "{}/{}/{}/api",
            self.api_base.trim_end_matches('/'),
            self.credentials.tenant_id,
            environment
        );
        if let Some(version) = self.api_version.as_deref().filter(|v| !v.is_empty()) {
            prefix.push('/');
            prefix.push_str(version.trim_matches('/'));
        }
        prefix
    }

    /// Resolve `{apiBase}/{tenant}/{environment}/api[/version]/{relative_path}`.
    pub fn resource_url(&self, environment: &str, relative_path: &str) -> Result<Url, BridgeError> {
        validate_environment(environment)?;
        let prefix = self.scope_prefix(environment);
        let scope = Url::parse(&format!("{prefix}/"))
            .map_err(|e| BridgeError::configuration(format!("invalid api base {prefix}: {e}")))?;
        let raw = format!("{prefix}/{}", relative_path.trim_start_matches('/'));
        let url = Url::parse(&raw)
            .map_err(|e| BridgeError::InvalidPath(format!("{relative_path}: {e}")))?;
        if url.origin() != scope.origin() || !url.path().starts_with(scope.path()) {
            return Err(BridgeError::InvalidPath(format!(
                "{relative_path} resolves outside {}",
                scope.path()
            )));
        }
        Ok(url)
    }
}

fn validate_environment(environment: &str) -> Result<(), BridgeError> {
    if environment.trim().is_empty() {
        return Err(BridgeError::configuration(
            "environment is required (e.g. 'sandbox' or 'production')",
        ));
    }
    if !environment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BridgeError::configuration(format!(
            "invalid environment name '{environment}'"
        )));
    }
    Ok(())
}

/// Authenticated reader for the tenant's data API.
///
/// Cheap to clone; one is handed to every capability registry.
#[derive(Clone)]
pub struct DataBridge {
    settings: Arc<BridgeSettings>,
    agent: ureq::Agent,
    cache: Option<Arc<TokenCache>>,
}

impl DataBridge {
    pub fn new(settings: Arc<BridgeSettings>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self {
            settings,
            agent,
            cache: None,
        }
    }

    /// Reuse tokens through `cache` instead of acquiring one per call.
    pub fn with_token_cache(mut self, cache: Arc<TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    fn token(&self) -> Result<AccessToken, BridgeError> {
        let settings = &self.settings;
        let provider = TokenProvider::new(
            &self.agent,
            &settings.authority,
            &settings.scope,
            &settings.credentials,
        );
        match &self.cache {
            Some(cache) => cache.get_or_acquire(&settings.credentials.tenant_id, || provider.acquire()),
            None => provider.acquire(),
        }
    }

    /// GET `relative_path` in `environment`.
    ///
    /// Returns the parsed JSON body for JSON responses and
    /// `{"text_data": <body>}` for any other 2xx content type.
    pub fn fetch(&self, relative_path: &str, environment: &str) -> Result<JsonValue, BridgeError> {
        let url = self.settings.resource_url(environment, relative_path)?;
        let token = self.token()?;
        log::debug!("data bridge GET {}", url);

        let response = self
            .agent
            .get(url.as_str())
            .set("Authorization", &token.authorization())
            .set("Accept", "application/json")
            .call();

        match response {
            Ok(response) => read_success(response, url.as_str()),
            Err(ureq::Error::Status(status, response)) => {
                if status == 401 {
                    if let Some(cache) = &self.cache {
                        cache.invalidate(&self.settings.credentials.tenant_id);
                    }
                }
                let headers = collect_headers(&response);
                let (body, read_err) = read_body(response);
                if let Some(err) = read_err {
                    log::warn!("data bridge GET {} error body truncated: {}", url, err);
                }
                log::warn!("data bridge GET {} returned {}", url, status);
                Err(BridgeError::Upstream(Box::new(UpstreamApiError::new(
                    status,
                    url.to_string(),
                    headers,
                    body,
                ))))
            }
            Err(ureq::Error::Transport(transport)) => {
                log::warn!("data bridge GET {} failed: {}", url, transport);
                Err(BridgeError::transport(transport))
            }
        }
    }
}

fn read_success(response: ureq::Response, url: &str) -> Result<JsonValue, BridgeError> {
    let is_json = is_json_content_type(response.content_type());
    let body = match read_body(response) {
        (body, None) => body,
        (_, Some(err)) => {
            return Err(BridgeError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            })
        }
    };
    if is_json {
        serde_json::from_str(&body).map_err(|e| BridgeError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    } else {
        Ok(json!({ TEXT_DATA_FIELD: body }))
    }
}

/// Whole body, unbounded. On a read error, whatever arrived is kept
/// alongside the error.
fn read_body(response: ureq::Response) -> (String, Option<std::io::Error>) {
    let mut bytes = Vec::new();
    let err = response.into_reader().read_to_end(&mut bytes).err();
    (String::from_utf8_lossy(&bytes).into_owned(), err)
}

fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}

fn collect_headers(response: &ureq::Response) -> Vec<(String, String)> {
    response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            response
                .header(&name)
                .map(|value| (name.clone(), value.to_string()))
        })
        .collect()
}
