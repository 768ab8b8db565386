//! Service configuration loaded from `~/.lifeline/config.json`.
//!
//! Every knob carries a serde default so a minimal config file (or none at
//! all) still yields a runnable service; telephony credentials are the only
//! section whose absence is surfaced as an error, and only at SOS trigger
//! time. `LIFELINE_CONFIG` overrides the config file path.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub telephony: TelephonyConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Explicit database path. Defaults to `~/.lifeline/lifeline.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    /// Bearer tokens seeded into the `api_tokens` table at startup.
    /// Self-hosted deployments list their device tokens here; a managed
    /// deployment writes the table directly.
    #[serde(default)]
    pub api_tokens: Vec<ApiTokenEntry>,
}

/// A bearer token mapped to the user it authenticates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTokenEntry {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8700".to_string()
}

/// Telephony provider credentials. All fields must be present for outbound
/// dialing; `is_configured` gates the SOS trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelephonyConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Caller id presented on outbound calls.
    #[serde(default)]
    pub caller_id: String,
    /// Public URL the provider posts status transitions to.
    #[serde(default)]
    pub status_callback_url: String,
}

impl TelephonyConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
            && !self.api_key.is_empty()
            && !self.api_secret.is_empty()
            && !self.caller_id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationConfig {
    /// How long each contact's phone rings before the dispatcher advances.
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: default_ring_timeout(),
        }
    }
}

fn default_ring_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    /// 5-field cron expression for the scheduled purge.
    #[serde(default = "default_retention_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Ping history older than this is deleted.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    /// Shared secret for the external job trigger (`x-job-secret` header).
    /// Empty disables the HTTP trigger; the in-process schedule still runs.
    #[serde(default)]
    pub job_secret: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cron: default_retention_cron(),
            timezone: default_timezone(),
            max_age_days: default_max_age_days(),
            job_secret: String::new(),
        }
    }
}

fn default_retention_cron() -> String {
    "0 4 * * *".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_max_age_days() -> u32 {
    30
}

/// Resolve the config file path: `LIFELINE_CONFIG` env var, else
/// `~/.lifeline/config.json`.
pub fn config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("LIFELINE_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".lifeline").join("config.json"))
}

/// Load configuration from disk. A missing file yields defaults so the
/// service can start for presence-only deployments; a malformed file is an
/// error, not a silent fallback.
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;

    if !path.exists() {
        log::info!(
            "Config file not found at {}, starting with defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content =
        fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;

    let config: Config =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.http.bind, "127.0.0.1:8700");
        assert_eq!(config.escalation.ring_timeout_secs, 15);
        assert_eq!(config.retention.max_age_days, 30);
        assert_eq!(config.retention.cron, "0 4 * * *");
        assert!(!config.telephony.is_configured());
    }

    #[test]
    fn test_telephony_configured_requires_all_fields() {
        let mut telephony = TelephonyConfig {
            base_url: "https://voice.example.com".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            caller_id: "+15550100".to_string(),
            status_callback_url: String::new(),
        };
        assert!(telephony.is_configured());

        telephony.api_secret = String::new();
        assert!(!telephony.is_configured());
    }

    #[test]
    fn test_camel_case_fields() {
        let json = r#"{
            "http": { "bind": "0.0.0.0:9000" },
            "telephony": {
                "baseUrl": "https://voice.example.com",
                "apiKey": "k",
                "apiSecret": "s",
                "callerId": "+15550100",
                "statusCallbackUrl": "https://app.example.com/webhooks/telephony/status"
            },
            "escalation": { "ringTimeoutSecs": 20 },
            "retention": { "maxAgeDays": 14, "jobSecret": "hunter2" },
            "apiTokens": [{ "token": "tok-1", "userId": "user-1" }]
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.http.bind, "0.0.0.0:9000");
        assert!(config.telephony.is_configured());
        assert_eq!(config.escalation.ring_timeout_secs, 20);
        assert_eq!(config.retention.max_age_days, 14);
        assert_eq!(config.retention.job_secret, "hunter2");
        assert_eq!(config.api_tokens.len(), 1);
        assert_eq!(config.api_tokens[0].user_id, "user-1");
    }
}
