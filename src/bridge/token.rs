//! OAuth2 client-credentials token acquisition.
//!
//! One POST per call. No retry, no backoff, no caching here; see
//! [`super::cache::TokenCache`] for the opt-in reuse layer.

use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::BridgeError;

/// Identity-provider credentials for the client-credentials grant.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn set_client_secret(&mut self, secret: impl Into<String>) {
        self.client_secret.zeroize();
        self.client_secret = secret.into();
    }

    /// Names of the settings that are still empty.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.tenant_id.trim().is_empty() {
            missing.push("tenant_id");
        }
        if self.client_id.trim().is_empty() {
            missing.push("client_id");
        }
        if self.client_secret.is_empty() {
            missing.push("client_secret");
        }
        missing
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// A bearer credential. Never persisted, never logged, never handed to scripts.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccessToken {
    bearer: String,
    pub scope: String,
    pub tenant: String,
    #[zeroize(skip)]
    expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn new(
        bearer: impl Into<String>,
        scope: impl Into<String>,
        tenant: impl Into<String>,
        expires_in: Option<Duration>,
    ) -> Self {
        Self {
            bearer: bearer.into(),
            scope: scope.into(),
            tenant: tenant.into(),
            expires_at: expires_in.map(|ttl| Instant::now() + ttl),
        }
    }

    /// `Authorization` header value.
    pub(crate) fn authorization(&self) -> String {
        format!("Bearer {}", self.bearer)
    }

    /// True while the token stays valid for at least `skew` more.
    /// Tokens without a known expiry are never considered fresh.
    pub fn is_fresh(&self, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() + skew < expires_at,
            None => false,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("bearer", &"<redacted>")
            .field("scope", &self.scope)
            .field("tenant", &self.tenant)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Issues client-credentials grants against `{authority}/{tenant}/oauth2/v2.0/token`.
pub struct TokenProvider<'a> {
    agent: &'a ureq::Agent,
    authority: &'a str,
    scope: &'a str,
    credentials: &'a ClientCredentials,
}

impl<'a> TokenProvider<'a> {
    pub fn new(
        agent: &'a ureq::Agent,
        authority: &'a str,
        scope: &'a str,
        credentials: &'a ClientCredentials,
    ) -> Self {
        Self {
            agent,
            authority,
            scope,
            credentials,
        }
    }

    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/'),
            self.credentials.tenant_id
        )
    }

    /// Acquire a new bearer token.
    pub fn acquire(&self) -> Result<AccessToken, BridgeError> {
        let url = self.token_url();
        log::debug!(
            "requesting access token for tenant {} (scope {})",
            self.credentials.tenant_id,
            self.scope
        );
        let response = self.agent.post(&url).send_form(&[
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", self.scope),
        ]);
        match response {
            Ok(response) => {
                let body: TokenResponse = response.into_json().map_err(|e| BridgeError::Decode {
                    url: url.clone(),
                    message: format!("token response: {e}"),
                })?;
                Ok(AccessToken::new(
                    body.access_token.as_str(),
                    self.scope,
                    self.credentials.tenant_id.as_str(),
                    body.expires_in.map(Duration::from_secs),
                ))
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                log::warn!("identity provider rejected token request with status {}", status);
                Err(BridgeError::Auth { status, body })
            }
            Err(ureq::Error::Transport(transport)) => Err(BridgeError::transport(transport)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = ClientCredentials::new("tenant-a", "client-a", "s3cret");
        let token = AccessToken::new("eyJ.bearer", "scope", "tenant-a", None);
        let rendered = format!("{creds:?} {token:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("eyJ.bearer"));
        assert!(rendered.contains("tenant-a"));
    }

    #[test]
    fn freshness_respects_expiry_and_skew() {
        let long = AccessToken::new("t", "s", "x", Some(Duration::from_secs(3600)));
        assert!(long.is_fresh(Duration::from_secs(60)));
        let short = AccessToken::new("t", "s", "x", Some(Duration::from_secs(30)));
        assert!(!short.is_fresh(Duration::from_secs(60)));
        let unknown = AccessToken::new("t", "s", "x", None);
        assert!(!unknown.is_fresh(Duration::ZERO));
    }

    #[test]
    fn token_url_is_tenant_scoped() {
        let agent = ureq::AgentBuilder::new().build();
        let creds = ClientCredentials::new("contoso", "c", "s");
        let provider = TokenProvider::new(&agent, "https://login.example.com/", "scope", &creds);
        assert_eq!(
            provider.token_url(),
            "https://login.example.com/contoso/oauth2/v2.0/token"
        );
    }
}
