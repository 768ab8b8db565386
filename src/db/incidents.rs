use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::util::now_string;

use super::{
    CallStatus, DbCallAttempt, DbContact, DbError, DbIncident, DbQueueEntry, IncidentOutcome,
    IncidentStatus, SosDb,
};

/// What applying a provider status callback did to the attempt row.
#[derive(Debug, Clone)]
pub struct WebhookUpdate {
    pub attempt: DbCallAttempt,
    /// False when the delivery was a replay or arrived after a provider
    /// terminal state and was ignored.
    pub applied: bool,
}

impl SosDb {
    // =========================================================================
    // Incidents + escalation queue
    // =========================================================================

    /// Create an incident and snapshot the contact list into its escalation
    /// queue, atomically. The queue, not the live registry, is what the
    /// dispatcher walks, so registry edits cannot alter an in-flight
    /// escalation.
    pub fn create_incident_with_queue(
        &self,
        owner_id: &str,
        contacts: &[DbContact],
    ) -> Result<DbIncident, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = now_string();

        self.with_transaction(|db| {
            db.conn_ref().execute(
                "INSERT INTO sos_incidents (id, owner_id, status, cursor, created_at)
                 VALUES (?1, ?2, 'open', 0, ?3)",
                params![id, owner_id, now],
            )?;

            for (position, contact) in contacts.iter().enumerate() {
                db.conn_ref().execute(
                    "INSERT INTO sos_escalation_queue
                        (incident_id, position, contact_id, name, phone)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, position as i64, contact.id, contact.name, contact.phone],
                )?;
            }
            Ok(())
        })?;

        Ok(DbIncident {
            id,
            owner_id: owner_id.to_string(),
            status: IncidentStatus::Open,
            outcome: None,
            cursor: 0,
            next_check_at: None,
            created_at: now,
            completed_at: None,
        })
    }

    pub fn get_incident(&self, id: &str) -> Result<Option<DbIncident>, DbError> {
        let incident = self
            .conn_ref()
            .query_row(
                "SELECT id, owner_id, status, outcome, cursor, next_check_at,
                        created_at, completed_at
                 FROM sos_incidents
                 WHERE id = ?1",
                params![id],
                Self::map_incident_row,
            )
            .optional()?;
        Ok(incident)
    }

    pub fn get_queue_entry(
        &self,
        incident_id: &str,
        position: i64,
    ) -> Result<Option<DbQueueEntry>, DbError> {
        let entry = self
            .conn_ref()
            .query_row(
                "SELECT incident_id, position, contact_id, name, phone
                 FROM sos_escalation_queue
                 WHERE incident_id = ?1 AND position = ?2",
                params![incident_id, position],
                |row| {
                    Ok(DbQueueEntry {
                        incident_id: row.get(0)?,
                        position: row.get(1)?,
                        contact_id: row.get(2)?,
                        name: row.get(3)?,
                        phone: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn queue_len(&self, incident_id: &str) -> Result<i64, DbError> {
        let len: i64 = self.conn_ref().query_row(
            "SELECT COUNT(*) FROM sos_escalation_queue WHERE incident_id = ?1",
            params![incident_id],
            |r| r.get(0),
        )?;
        Ok(len)
    }

    /// Advance the in-flight cursor, compare-and-set against the value the
    /// caller observed. Returns false when another path advanced first:
    /// both the status webhook and the ring-window sweep drive advancement,
    /// and whichever loses this update simply stops.
    pub fn advance_cursor(&self, incident_id: &str, expected: i64) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE sos_incidents
             SET cursor = cursor + 1, next_check_at = NULL
             WHERE id = ?1 AND cursor = ?2 AND status = 'open'",
            params![incident_id, expected],
        )?;
        Ok(changed > 0)
    }

    /// Persist the ring-window deadline for the in-flight attempt.
    pub fn set_incident_deadline(
        &self,
        incident_id: &str,
        deadline: &str,
    ) -> Result<(), DbError> {
        self.conn_ref().execute(
            "UPDATE sos_incidents SET next_check_at = ?2 WHERE id = ?1",
            params![incident_id, deadline],
        )?;
        Ok(())
    }

    /// Record that a contact answered: the incident is handled but stays
    /// open until an operator closes it. Clears the durable deadline so the
    /// sweep stops driving this incident.
    pub fn mark_incident_answered(&self, incident_id: &str) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE sos_incidents
             SET outcome = 'answered', next_check_at = NULL
             WHERE id = ?1 AND status = 'open'",
            params![incident_id],
        )?;
        Ok(changed > 0)
    }

    /// Complete an incident. CAS on `status = 'open'` so concurrent webhook
    /// deliveries and the sweep complete it exactly once. An outcome already
    /// recorded (answered) is preserved.
    pub fn complete_incident(
        &self,
        incident_id: &str,
        fallback_outcome: IncidentOutcome,
    ) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE sos_incidents
             SET status = 'completed',
                 outcome = COALESCE(outcome, ?2),
                 completed_at = ?3,
                 next_check_at = NULL
             WHERE id = ?1 AND status = 'open'",
            params![incident_id, fallback_outcome.as_str(), now_string()],
        )?;
        Ok(changed > 0)
    }

    /// Webhook-side completion check: complete the incident only when the
    /// queue is fully dispatched, nothing is still in flight, and no attempt
    /// answered (an answered attempt keeps the incident open as handled).
    /// Safe under concurrent terminal deliveries for sibling attempts.
    pub fn complete_if_fully_terminal(&self, incident_id: &str) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE sos_incidents
             SET status = 'completed',
                 outcome = COALESCE(outcome, 'unreachable'),
                 completed_at = ?2,
                 next_check_at = NULL
             WHERE id = ?1 AND status = 'open'
               AND NOT EXISTS (
                   SELECT 1 FROM sos_call_attempts a
                   WHERE a.incident_id = ?1
                     AND a.status IN ('queued', 'initiated', 'ringing'))
               AND NOT EXISTS (
                   SELECT 1 FROM sos_call_attempts a
                   WHERE a.incident_id = ?1 AND a.status = 'answered')
               AND (SELECT COUNT(*) FROM sos_call_attempts a
                    WHERE a.incident_id = ?1)
                   = (SELECT COUNT(*) FROM sos_escalation_queue q
                      WHERE q.incident_id = ?1)",
            params![incident_id, now_string()],
        )?;
        Ok(changed > 0)
    }

    /// Open incidents whose ring-window deadline has elapsed.
    pub fn get_due_incidents(&self, now: &str) -> Result<Vec<DbIncident>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id, owner_id, status, outcome, cursor, next_check_at,
                    created_at, completed_at
             FROM sos_incidents
             WHERE status = 'open'
               AND next_check_at IS NOT NULL
               AND next_check_at <= ?1",
        )?;

        let rows = stmt.query_map(params![now], Self::map_incident_row)?;
        let mut incidents = Vec::new();
        for row in rows {
            incidents.push(row?);
        }
        Ok(incidents)
    }

    fn map_incident_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbIncident> {
        let status_text: String = row.get(2)?;
        let outcome_text: Option<String> = row.get(3)?;
        Ok(DbIncident {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            status: IncidentStatus::parse(&status_text).unwrap_or(IncidentStatus::Open),
            outcome: outcome_text.as_deref().and_then(IncidentOutcome::parse),
            cursor: row.get(4)?,
            next_check_at: row.get(5)?,
            created_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    // =========================================================================
    // Call attempts
    // =========================================================================

    /// Create a `queued` attempt row for the contact about to be dialed.
    /// The row exists before the provider call goes out so a crash between
    /// the two can never double-dial the contact.
    pub fn insert_attempt(
        &self,
        incident_id: &str,
        contact_id: &str,
        position: i64,
    ) -> Result<DbCallAttempt, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = now_string();
        self.conn_ref().execute(
            "INSERT INTO sos_call_attempts
                (id, incident_id, contact_id, position, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5)",
            params![id, incident_id, contact_id, position, now],
        )?;

        Ok(DbCallAttempt {
            id,
            incident_id: incident_id.to_string(),
            contact_id: contact_id.to_string(),
            position,
            call_sid: None,
            status: CallStatus::Queued,
            timed_out: false,
            duration_seconds: None,
            created_at: now,
            ended_at: None,
        })
    }

    /// Record the provider call identifier once placement succeeded.
    pub fn mark_attempt_placed(&self, attempt_id: &str, call_sid: &str) -> Result<(), DbError> {
        self.conn_ref().execute(
            "UPDATE sos_call_attempts
             SET call_sid = ?2, status = 'initiated'
             WHERE id = ?1 AND status = 'queued'",
            params![attempt_id, call_sid],
        )?;
        Ok(())
    }

    /// Provider rejected the placement: the attempt goes straight to
    /// `failed` and escalation moves on.
    pub fn mark_attempt_placement_failed(&self, attempt_id: &str) -> Result<(), DbError> {
        self.conn_ref().execute(
            "UPDATE sos_call_attempts
             SET status = 'failed', ended_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![attempt_id, now_string()],
        )?;
        Ok(())
    }

    /// Ring window elapsed without a terminal callback: synthesize
    /// `no-answer` so the escalation can advance. Conditional on the attempt
    /// still being non-terminal; a webhook that raced us wins. The
    /// `timed_out` flag marks the status as locally synthesized so a late
    /// provider callback may still overwrite it.
    pub fn mark_attempt_timed_out(&self, attempt_id: &str) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE sos_call_attempts
             SET status = 'no-answer', timed_out = 1, ended_at = ?2
             WHERE id = ?1 AND status IN ('queued', 'initiated', 'ringing')",
            params![attempt_id, now_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_attempt_at(
        &self,
        incident_id: &str,
        position: i64,
    ) -> Result<Option<DbCallAttempt>, DbError> {
        let attempt = self
            .conn_ref()
            .query_row(
                "SELECT id, incident_id, contact_id, position, call_sid, status,
                        timed_out, duration_seconds, created_at, ended_at
                 FROM sos_call_attempts
                 WHERE incident_id = ?1 AND position = ?2",
                params![incident_id, position],
                Self::map_attempt_row,
            )
            .optional()?;
        Ok(attempt)
    }

    pub fn get_attempt_by_sid(&self, call_sid: &str) -> Result<Option<DbCallAttempt>, DbError> {
        let attempt = self
            .conn_ref()
            .query_row(
                "SELECT id, incident_id, contact_id, position, call_sid, status,
                        timed_out, duration_seconds, created_at, ended_at
                 FROM sos_call_attempts
                 WHERE call_sid = ?1",
                params![call_sid],
                Self::map_attempt_row,
            )
            .optional()?;
        Ok(attempt)
    }

    /// All attempts for an incident, dialing order.
    pub fn get_attempts(&self, incident_id: &str) -> Result<Vec<DbCallAttempt>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id, incident_id, contact_id, position, call_sid, status,
                    timed_out, duration_seconds, created_at, ended_at
             FROM sos_call_attempts
             WHERE incident_id = ?1
             ORDER BY position",
        )?;

        let rows = stmt.query_map(params![incident_id], Self::map_attempt_row)?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?);
        }
        Ok(attempts)
    }

    /// Apply a provider status callback to the attempt identified by
    /// `call_sid`. Returns None when no attempt matches.
    ///
    /// Ordering rules:
    /// - re-applying the current status is a no-op
    /// - a non-terminal attempt accepts any provider status
    /// - a locally synthesized `no-answer` (timed_out) accepts a later
    ///   provider terminal; the late webhook corrects the record
    /// - a provider terminal never changes to a different terminal
    pub fn apply_provider_status(
        &self,
        call_sid: &str,
        status: CallStatus,
        duration_seconds: Option<i64>,
    ) -> Result<Option<WebhookUpdate>, DbError> {
        let Some(attempt) = self.get_attempt_by_sid(call_sid)? else {
            return Ok(None);
        };

        if attempt.status == status && !attempt.timed_out {
            return Ok(Some(WebhookUpdate {
                attempt,
                applied: false,
            }));
        }

        let accept = !attempt.status.is_terminal() || attempt.timed_out;
        if !accept {
            return Ok(Some(WebhookUpdate {
                attempt,
                applied: false,
            }));
        }

        let ended_at = if status.is_terminal() {
            Some(now_string())
        } else {
            None
        };
        self.conn_ref().execute(
            "UPDATE sos_call_attempts
             SET status = ?2,
                 timed_out = 0,
                 duration_seconds = COALESCE(?3, duration_seconds),
                 ended_at = COALESCE(?4, ended_at)
             WHERE id = ?1",
            params![attempt.id, status.as_str(), duration_seconds, ended_at],
        )?;

        Ok(self
            .get_attempt_by_sid(call_sid)?
            .map(|attempt| WebhookUpdate {
                attempt,
                applied: true,
            }))
    }

    fn map_attempt_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbCallAttempt> {
        let status_text: String = row.get(5)?;
        let timed_out: i64 = row.get(6)?;
        Ok(DbCallAttempt {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            contact_id: row.get(2)?,
            position: row.get(3)?,
            call_sid: row.get(4)?,
            status: CallStatus::parse(&status_text).unwrap_or(CallStatus::Failed),
            timed_out: timed_out != 0,
            duration_seconds: row.get(7)?,
            created_at: row.get(8)?,
            ended_at: row.get(9)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn seed_contacts(db: &SosDb, owner: &str, count: usize) -> Vec<DbContact> {
        (0..count)
            .map(|i| {
                db.insert_contact(
                    owner,
                    &format!("Contact {}", i + 1),
                    &format!("+1555010{}", i),
                    None,
                    "family",
                    (i + 1) as i64,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_create_incident_snapshots_queue() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 3);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();

        assert_eq!(db.queue_len(&incident.id).unwrap(), 3);
        let first = db.get_queue_entry(&incident.id, 0).unwrap().unwrap();
        assert_eq!(first.name, "Contact 1");

        // Deleting a contact afterwards does not touch the snapshot
        db.delete_contact("owner-1", &contacts[0].id).unwrap();
        assert_eq!(db.queue_len(&incident.id).unwrap(), 3);
    }

    #[test]
    fn test_advance_cursor_cas() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 2);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();

        assert!(db.advance_cursor(&incident.id, 0).unwrap());
        // Stale expected value: a concurrent advance already happened
        assert!(!db.advance_cursor(&incident.id, 0).unwrap());
        assert_eq!(db.get_incident(&incident.id).unwrap().unwrap().cursor, 1);
    }

    #[test]
    fn test_complete_incident_exactly_once() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 1);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();

        assert!(db
            .complete_incident(&incident.id, IncidentOutcome::Unreachable)
            .unwrap());
        assert!(!db
            .complete_incident(&incident.id, IncidentOutcome::Unreachable)
            .unwrap());

        let stored = db.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.status, IncidentStatus::Completed);
        assert_eq!(stored.outcome, Some(IncidentOutcome::Unreachable));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn test_complete_if_fully_terminal_requires_full_dispatch() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 2);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();

        // First attempt terminal, but the queue has an undialed entry:
        // the incident must stay open.
        let attempt = db.insert_attempt(&incident.id, &contacts[0].id, 0).unwrap();
        db.mark_attempt_placed(&attempt.id, "CA-1").unwrap();
        db.apply_provider_status("CA-1", CallStatus::Busy, None)
            .unwrap();
        assert!(!db.complete_if_fully_terminal(&incident.id).unwrap());

        // Second attempt terminal too: now it completes, once.
        let attempt2 = db.insert_attempt(&incident.id, &contacts[1].id, 1).unwrap();
        db.mark_attempt_placed(&attempt2.id, "CA-2").unwrap();
        db.apply_provider_status("CA-2", CallStatus::NoAnswer, None)
            .unwrap();
        assert!(db.complete_if_fully_terminal(&incident.id).unwrap());
        assert!(!db.complete_if_fully_terminal(&incident.id).unwrap());

        let stored = db.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.outcome, Some(IncidentOutcome::Unreachable));
    }

    #[test]
    fn test_answered_attempt_blocks_completion() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 1);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();

        let attempt = db.insert_attempt(&incident.id, &contacts[0].id, 0).unwrap();
        db.mark_attempt_placed(&attempt.id, "CA-1").unwrap();
        db.apply_provider_status("CA-1", CallStatus::Answered, None)
            .unwrap();
        db.mark_incident_answered(&incident.id).unwrap();

        assert!(!db.complete_if_fully_terminal(&incident.id).unwrap());
        let stored = db.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.status, IncidentStatus::Open);
        assert_eq!(stored.outcome, Some(IncidentOutcome::Answered));
    }

    #[test]
    fn test_webhook_replay_is_noop() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 1);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();
        let attempt = db.insert_attempt(&incident.id, &contacts[0].id, 0).unwrap();
        db.mark_attempt_placed(&attempt.id, "CA-1").unwrap();

        let first = db
            .apply_provider_status("CA-1", CallStatus::NoAnswer, Some(0))
            .unwrap()
            .unwrap();
        assert!(first.applied);

        let replay = db
            .apply_provider_status("CA-1", CallStatus::NoAnswer, Some(0))
            .unwrap()
            .unwrap();
        assert!(!replay.applied);
        assert_eq!(replay.attempt.status, CallStatus::NoAnswer);
    }

    #[test]
    fn test_provider_terminal_not_overwritten_by_other_terminal() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 1);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();
        let attempt = db.insert_attempt(&incident.id, &contacts[0].id, 0).unwrap();
        db.mark_attempt_placed(&attempt.id, "CA-1").unwrap();

        db.apply_provider_status("CA-1", CallStatus::Busy, None)
            .unwrap();
        let second = db
            .apply_provider_status("CA-1", CallStatus::Failed, None)
            .unwrap()
            .unwrap();
        assert!(!second.applied);
        assert_eq!(second.attempt.status, CallStatus::Busy);
    }

    #[test]
    fn test_late_webhook_overwrites_timed_out_status() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 1);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();
        let attempt = db.insert_attempt(&incident.id, &contacts[0].id, 0).unwrap();
        db.mark_attempt_placed(&attempt.id, "CA-1").unwrap();

        assert!(db.mark_attempt_timed_out(&attempt.id).unwrap());
        let stored = db.get_attempt_by_sid("CA-1").unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::NoAnswer);
        assert!(stored.timed_out);

        // Provider truth arrives late with a duration: it wins over the
        // synthesized status.
        let late = db
            .apply_provider_status("CA-1", CallStatus::Busy, Some(4))
            .unwrap()
            .unwrap();
        assert!(late.applied);
        assert_eq!(late.attempt.status, CallStatus::Busy);
        assert!(!late.attempt.timed_out);
        assert_eq!(late.attempt.duration_seconds, Some(4));
    }

    #[test]
    fn test_timed_out_cas_loses_to_webhook() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 1);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();
        let attempt = db.insert_attempt(&incident.id, &contacts[0].id, 0).unwrap();
        db.mark_attempt_placed(&attempt.id, "CA-1").unwrap();

        db.apply_provider_status("CA-1", CallStatus::Answered, Some(12))
            .unwrap();
        // Sweep fires after the webhook already resolved the attempt
        assert!(!db.mark_attempt_timed_out(&attempt.id).unwrap());
        let stored = db.get_attempt_by_sid("CA-1").unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Answered);
    }

    #[test]
    fn test_unknown_sid_returns_none() {
        let db = test_db();
        assert!(db
            .apply_provider_status("CA-missing", CallStatus::Failed, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_due_incidents_filtering() {
        let db = test_db();
        let contacts = seed_contacts(&db, "owner-1", 1);
        let incident = db.create_incident_with_queue("owner-1", &contacts).unwrap();

        assert!(db.get_due_incidents("2026-08-07T12:00:00.000Z").unwrap().is_empty());

        db.set_incident_deadline(&incident.id, "2026-08-07T11:59:00.000Z")
            .unwrap();
        let due = db.get_due_incidents("2026-08-07T12:00:00.000Z").unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, incident.id);

        // Future deadline is not due
        db.set_incident_deadline(&incident.id, "2026-08-07T12:01:00.000Z")
            .unwrap();
        assert!(db.get_due_incidents("2026-08-07T12:00:00.000Z").unwrap().is_empty());
    }
}
