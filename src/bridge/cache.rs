//! Per-tenant, single-flight, expiry-aware token cache.
//!
//! Disabled by default. When enabled, concurrent callers for the same tenant
//! serialize on that tenant's slot, so at most one token request is in
//! flight per tenant and the rest reuse its result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::token::AccessToken;
use crate::error::BridgeError;

pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(120);

type Slot = Arc<Mutex<Option<AccessToken>>>;

#[derive(Debug)]
pub struct TokenCache {
    slots: Mutex<HashMap<String, Slot>>,
    refresh_skew: Duration,
}

impl TokenCache {
    pub fn new(refresh_skew: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            refresh_skew,
        }
    }

    fn slot(&self, tenant: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(tenant.to_string()).or_default().clone()
    }

    /// Return a fresh cached token for `tenant`, or run `acquire` while
    /// holding the tenant slot and cache its result.
    pub fn get_or_acquire<F>(&self, tenant: &str, acquire: F) -> Result<AccessToken, BridgeError>
    where
        F: FnOnce() -> Result<AccessToken, BridgeError>,
    {
        let slot = self.slot(tenant);
        let mut cached = slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(self.refresh_skew) {
                return Ok(token.clone());
            }
        }
        let token = acquire()?;
        log::debug!("cached new access token for tenant {}", tenant);
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token for `tenant`.
    pub fn invalidate(&self, tenant: &str) {
        let slot = self.slot(tenant);
        let mut cached = slot.lock().unwrap_or_else(|p| p.into_inner());
        *cached = None;
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_SKEW)
    }
}
