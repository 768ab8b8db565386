//! Family-circle access resolution for presence reads.
//!
//! Membership rows written by older app versions can carry a null or
//! unrecognized role. That is not a denial: the viewer may well be a
//! legitimate member whose role record is incomplete. Resolution therefore
//! returns a three-state decision, never silently collapsing "unknown"
//! into "denied" or defaulting it to member.

use crate::db::{DbError, SosDb};

/// Roles this build recognizes on a membership row.
const KNOWN_ROLES: &[&str] = &["owner", "adult", "member"];

/// Outcome of resolving a viewer's access to a family group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Authorized,
    Denied,
    /// Membership exists but its role data is missing or unrecognized.
    /// The caller should surface a retryable condition, not a denial.
    Indeterminate,
}

/// Resolve whether `viewer_id` may read presence for `group_id`.
pub fn resolve_presence_access(
    db: &SosDb,
    viewer_id: &str,
    group_id: &str,
) -> Result<AccessDecision, DbError> {
    // Group owners are authorized even if their membership row is damaged.
    if db.get_group_owner(group_id)?.as_deref() == Some(viewer_id) {
        return Ok(AccessDecision::Authorized);
    }

    let Some(membership) = db.get_membership(group_id, viewer_id)? else {
        return Ok(AccessDecision::Denied);
    };

    match membership.role.as_deref() {
        Some(role) if KNOWN_ROLES.contains(&role) => Ok(AccessDecision::Authorized),
        Some(_) | None => Ok(AccessDecision::Indeterminate),
    }
}
