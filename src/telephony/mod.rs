//! Telephony provider client.
//!
//! Direct HTTP via reqwest against the voice provider's REST API: a token
//! exchange endpoint issues short-lived bearer tokens, and a calls endpoint
//! places outbound calls. Status transitions come back asynchronously on
//! the status webhook, not through this client.
//!
//! Modules:
//! - token: time-boxed access-token cache

pub mod token;

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::config::TelephonyConfig;
use token::{CachedToken, TokenCache};

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token expired or rejected")]
    AuthExpired,
    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("Telephony credentials missing")]
    MissingCredentials,
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying 429/408/5xx responses and transport-level
/// timeouts with exponential backoff. `Retry-After` is honored when present.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, TelephonyError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(TelephonyError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                let decision = retry_decision_for_status(status);
                if decision == RetryDecision::Retryable && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "telephony retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "telephony retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(TelephonyError::Http(err));
            }
        }
    }

    Err(TelephonyError::TokenExchangeFailed(
        "request exhausted retries".to_string(),
    ))
}

// ============================================================================
// Call placement
// ============================================================================

/// The provider's synchronous answer to a placement request.
#[derive(Debug, Clone)]
pub struct PlacedCall {
    pub sid: String,
    pub status: String,
}

/// Seam for the outbound-dial step. The dispatcher only ever talks to this
/// trait; tests substitute a scripted implementation.
#[async_trait::async_trait]
pub trait CallPlacer: Send + Sync {
    async fn place_call(&self, to: &str, incident_id: &str)
        -> Result<PlacedCall, TelephonyError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallResponse {
    sid: String,
    #[serde(default)]
    status: String,
}

/// reqwest-backed client for the voice provider.
pub struct TelephonyClient {
    http: reqwest::Client,
    config: TelephonyConfig,
    token: TokenCache,
    retry: RetryPolicy,
}

impl TelephonyClient {
    pub fn new(config: TelephonyConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token: TokenCache::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Get a valid access token, exchanging credentials if the cached one
    /// is absent or inside the expiry skew. Holding the cache lock across
    /// the exchange serializes concurrent refreshes.
    async fn access_token(&self) -> Result<String, TelephonyError> {
        if !self.config.is_configured() {
            return Err(TelephonyError::MissingCredentials);
        }

        let mut slot = self.token.lock().await;
        let now = Utc::now();
        if let Some(cached) = slot.as_ref() {
            if !cached.is_expired(now) {
                return Ok(cached.value.clone());
            }
        }

        let url = format!("{}/v1/token", self.config.base_url.trim_end_matches('/'));
        let resp = send_with_retry(
            self.http.post(&url).json(&serde_json::json!({
                "apiKey": self.config.api_key,
                "apiSecret": self.config.api_secret,
            })),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TelephonyError::TokenExchangeFailed(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let body: TokenResponse = resp.json().await?;
        let cached = CachedToken::from_expires_in(body.access_token, body.expires_in, now);
        let value = cached.value.clone();
        *slot = Some(cached);
        Ok(value)
    }
}

#[async_trait::async_trait]
impl CallPlacer for TelephonyClient {
    async fn place_call(
        &self,
        to: &str,
        incident_id: &str,
    ) -> Result<PlacedCall, TelephonyError> {
        let token = self.access_token().await?;

        let url = format!("{}/v1/calls", self.config.base_url.trim_end_matches('/'));
        let resp = send_with_retry(
            self.http
                .post(&url)
                .bearer_auth(&token)
                .json(&serde_json::json!({
                    "to": to,
                    "from": self.config.caller_id,
                    "statusCallback": self.config.status_callback_url,
                    "clientReference": incident_id,
                })),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Provider revoked the token early; next placement re-exchanges.
            self.token.invalidate().await;
            return Err(TelephonyError::AuthExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TelephonyError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: CallResponse = resp.json().await?;
        Ok(PlacedCall {
            sid: body.sid,
            status: body.status,
        })
    }
}
