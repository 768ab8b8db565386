//! Error types for SOS dispatch
//!
//! Errors are classified by recoverability:
//! - Configuration: no contacts, no telephony credentials. Fail fast,
//!   surfaced to the triggering user before any Incident row exists
//! - Transient: provider rejected one call. Recovered per-contact,
//!   escalation advances to the next contact
//! - Fatal: storage failures, unknown incidents

use thiserror::Error;

use crate::db::DbError;
use crate::telephony::TelephonyError;

/// Error types for escalation dispatch and incident handling
#[derive(Debug, Error)]
pub enum DispatchError {
    // Configuration errors, reported before an Incident is created
    #[error("No emergency contacts configured")]
    NoContactsConfigured,

    #[error("Telephony credentials not configured")]
    TelephonyNotConfigured,

    // Per-contact transient, recorded as a failed attempt, never fatal
    #[error("Call placement failed: {0}")]
    CallPlacement(#[from] TelephonyError),

    // Fatal
    #[error("Incident not found: {0}")]
    IncidentNotFound(String),

    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

impl DispatchError {
    /// Returns true when the caller misconfigured the service and should
    /// fix setup before retrying.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            DispatchError::NoContactsConfigured | DispatchError::TelephonyNotConfigured
        )
    }

    /// Returns true when the error is scoped to a single contact and the
    /// escalation can continue past it.
    pub fn is_per_contact(&self) -> bool {
        matches!(self, DispatchError::CallPlacement(_))
    }
}
