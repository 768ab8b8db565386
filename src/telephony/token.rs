//! Time-boxed cache for the provider's short-lived access token.
//!
//! The token lives in an explicitly scoped cache object owned by the
//! `TelephonyClient`, not in module-level ambient state, so cache
//! lifetime equals client lifetime and tests can construct isolated
//! instances. Refreshes are serialized through a tokio mutex.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Refresh this many seconds before the provider-reported expiry; a token
/// that expires mid-request is worse than an early refresh.
const EXPIRY_SKEW_SECS: i64 = 60;

/// One cached access token with its expiry.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// Build from the provider's `expires_in` seconds.
    pub fn from_expires_in(value: String, expires_in_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at: now + Duration::seconds(expires_in_secs as i64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + Duration::seconds(EXPIRY_SKEW_SECS)
    }
}

/// Holder for the cached token. Locking the slot serializes concurrent
/// refreshes: the first caller through exchanges, the rest reuse.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot for a check-then-refresh sequence.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Option<CachedToken>> {
        self.slot.lock().await
    }

    /// Drop the cached token (after the provider rejected it).
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}
