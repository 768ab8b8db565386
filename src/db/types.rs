//! Row types and status vocabularies for the SQLite store.

use serde::{Deserialize, Serialize};

/// Telephony state of one outbound call attempt.
///
/// `queued → initiated → ringing → {answered | no-answer | busy | failed}`.
/// The four right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Initiated,
    Ringing,
    Answered,
    NoAnswer,
    Busy,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<CallStatus> {
        match s {
            "queued" => Some(CallStatus::Queued),
            "initiated" => Some(CallStatus::Initiated),
            "ringing" => Some(CallStatus::Ringing),
            "answered" => Some(CallStatus::Answered),
            "no-answer" => Some(CallStatus::NoAnswer),
            "busy" => Some(CallStatus::Busy),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Answered | CallStatus::NoAnswer | CallStatus::Busy | CallStatus::Failed
        )
    }
}

/// Incident lifecycle: `open → completed`. Completion is reached by operator
/// close or by exhausting the contact queue; an answered call keeps the
/// incident open until an operator closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Completed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<IncidentStatus> {
        match s {
            "open" => Some(IncidentStatus::Open),
            "completed" => Some(IncidentStatus::Completed),
            _ => None,
        }
    }
}

/// How an incident ended up (or is being handled while still open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentOutcome {
    /// A contact answered; the incident is considered handled but stays open.
    Answered,
    /// Every contact was tried and none answered.
    Unreachable,
    /// An operator closed the incident.
    Closed,
}

impl IncidentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentOutcome::Answered => "answered",
            IncidentOutcome::Unreachable => "unreachable",
            IncidentOutcome::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<IncidentOutcome> {
        match s {
            "answered" => Some(IncidentOutcome::Answered),
            "unreachable" => Some(IncidentOutcome::Unreachable),
            "closed" => Some(IncidentOutcome::Closed),
            _ => None,
        }
    }
}

/// A row from the `emergency_contacts` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbContact {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub relationship: String,
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `sos_incidents` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbIncident {
    pub id: String,
    pub owner_id: String,
    pub status: IncidentStatus,
    pub outcome: Option<IncidentOutcome>,
    /// Index of the in-flight entry in the escalation queue snapshot.
    pub cursor: i64,
    /// Durable ring-window deadline for the in-flight attempt (RFC 3339).
    pub next_check_at: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// A row from the `sos_escalation_queue` table, one snapshotted contact.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbQueueEntry {
    pub incident_id: String,
    pub position: i64,
    pub contact_id: String,
    pub name: String,
    pub phone: String,
}

/// A row from the `sos_call_attempts` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCallAttempt {
    pub id: String,
    pub incident_id: String,
    pub contact_id: String,
    pub position: i64,
    pub call_sid: Option<String>,
    pub status: CallStatus,
    /// Set when the status was synthesized by the ring-window sweep rather
    /// than reported by the provider.
    pub timed_out: bool,
    pub duration_seconds: Option<i64>,
    pub created_at: String,
    pub ended_at: Option<String>,
}

/// A row from the `location_pings` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbLocationPing {
    pub id: String,
    pub user_id: String,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub battery: Option<f64>,
    pub source: String,
    pub captured_at: String,
    pub received_at: String,
}

/// A row from the `live_presence` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbLivePresence {
    pub user_id: String,
    pub lat: f64,
    pub lng: f64,
    pub battery: Option<f64>,
    pub paused: bool,
    pub last_seen: String,
    pub updated_at: String,
}

/// A family member joined with their current presence, if any.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMemberPresence {
    pub user_id: String,
    pub role: Option<String>,
    pub presence: Option<DbLivePresence>,
}
