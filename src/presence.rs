//! Presence publishing and recency classification.
//!
//! Publishing appends to the ping history (audit trail) and overwrites the
//! single live-presence row per user. Classification happens at read time:
//! staleness is purely a function of `last_seen`, with the explicit pause
//! flag overriding recency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::presence::PingRecord;
use crate::db::{DbError, DbMemberPresence, SosDb};
use crate::util::{now_string, parse_timestamp, rfc3339_millis};

/// Members seen within this window are `live`.
const LIVE_WINDOW_SECS: i64 = 2 * 60;

/// Members seen within this window (but outside the live window) are `idle`.
const IDLE_WINDOW_SECS: i64 = 60 * 60;

/// Read-time recency classification for a family member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Live,
    Idle,
    Offline,
    Paused,
}

/// One accepted location sample as submitted by the device.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingInput {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub captured_at: Option<String>,
}

/// Why a ping was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingRejection {
    NonFiniteCoordinate,
    LatitudeOutOfRange,
    LongitudeOutOfRange,
    BadTimestamp,
}

impl PingRejection {
    pub fn message(&self) -> &'static str {
        match self {
            PingRejection::NonFiniteCoordinate => "lat/lng must be finite numbers",
            PingRejection::LatitudeOutOfRange => "lat must be within [-90, 90]",
            PingRejection::LongitudeOutOfRange => "lng must be within [-180, 180]",
            PingRejection::BadTimestamp => "capturedAt must be RFC 3339",
        }
    }
}

/// Validate a submitted ping and normalize it for storage. `capturedAt`
/// defaults to server time; optional numeric fields are dropped when
/// non-finite rather than failing the whole sample.
pub fn validate_ping(user_id: &str, input: &PingInput) -> Result<PingRecord, PingRejection> {
    if !input.lat.is_finite() || !input.lng.is_finite() {
        return Err(PingRejection::NonFiniteCoordinate);
    }
    if !(-90.0..=90.0).contains(&input.lat) {
        return Err(PingRejection::LatitudeOutOfRange);
    }
    if !(-180.0..=180.0).contains(&input.lng) {
        return Err(PingRejection::LongitudeOutOfRange);
    }

    let captured_at = match &input.captured_at {
        Some(raw) => rfc3339_millis(parse_timestamp(raw).ok_or(PingRejection::BadTimestamp)?),
        None => now_string(),
    };

    let finite = |v: Option<f64>| v.filter(|n| n.is_finite());
    Ok(PingRecord {
        user_id: user_id.to_string(),
        lat: input.lat,
        lng: input.lng,
        accuracy: finite(input.accuracy),
        speed: finite(input.speed),
        battery: finite(input.battery),
        source: input
            .source
            .clone()
            .unwrap_or_else(|| "app".to_string()),
        captured_at,
    })
}

/// Publish one sample: history append plus conditional live-row overwrite.
/// Returns true when the live row took the sample (false for out-of-order
/// deliveries, which are kept in history only).
pub fn publish_ping(db: &SosDb, record: &PingRecord) -> Result<bool, DbError> {
    db.append_ping(record)?;
    let applied = db.upsert_presence(record)?;
    if !applied {
        log::debug!(
            "Out-of-order ping for {} (captured {}) ignored for live presence",
            record.user_id,
            record.captured_at
        );
    }
    Ok(applied)
}

/// Classify a member's presence at `now`.
pub fn classify(last_seen: Option<&str>, paused: bool, now: DateTime<Utc>) -> PresenceStatus {
    if paused {
        return PresenceStatus::Paused;
    }
    let Some(last_seen) = last_seen.and_then(parse_timestamp) else {
        return PresenceStatus::Offline;
    };

    let age = (now - last_seen).num_seconds();
    if age < LIVE_WINDOW_SECS {
        PresenceStatus::Live
    } else if age < IDLE_WINDOW_SECS {
        PresenceStatus::Idle
    } else {
        PresenceStatus::Offline
    }
}

/// One marker on the family map.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberMarker {
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

/// Purge ping history older than the retention window. Live presence rows
/// are never touched: current position is overwritten in place, not
/// appended, so retention does not apply to it.
pub fn purge_expired_pings(
    db: &SosDb,
    max_age_days: u32,
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let cutoff = rfc3339_millis(now - chrono::Duration::days(max_age_days as i64));
    db.purge_pings_before(&cutoff)
}

/// Render the raw member/presence join into map markers.
pub fn build_markers(members: Vec<DbMemberPresence>, now: DateTime<Utc>) -> Vec<MemberMarker> {
    members
        .into_iter()
        .map(|member| match member.presence {
            Some(p) => MemberMarker {
                user_id: member.user_id,
                status: classify(Some(&p.last_seen), p.paused, now),
                lat: Some(p.lat),
                lng: Some(p.lng),
                battery: p.battery,
                last_seen: Some(p.last_seen),
            },
            None => MemberMarker {
                user_id: member.user_id,
                status: PresenceStatus::Offline,
                lat: None,
                lng: None,
                battery: None,
                last_seen: None,
            },
        })
        .collect()
}
