//! Escalation dispatcher and incident recorder.
//!
//! On SOS trigger the dispatcher snapshots the owner's ranked contact list
//! into the incident's escalation queue and dials one contact at a time.
//! Each dial opens a ring window persisted as `next_check_at` on the
//! incident (a durable timer, not an in-memory sleep) and two independent
//! paths drive the walk forward:
//!
//! - the provider status webhook, when a terminal state arrives before the
//!   window closes (`record_status`)
//! - the scheduler sweep, when the window closes first (`run_due`)
//!
//! Both orderings converge: advancement is a compare-and-set on the
//! incident cursor, so whichever path loses the race becomes a no-op. A
//! late webhook after a timeout advance still corrects the attempt record
//! but never re-dials.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::db::{
    CallStatus, DbIncident, IncidentOutcome, IncidentStatus,
};
use crate::error::DispatchError;
use crate::state::AppState;
use crate::util::{now_string, parse_timestamp, rfc3339_millis};

/// What a status callback delivery did, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// No attempt matches the call identifier.
    NoMatch,
    /// Replay or post-terminal delivery; nothing changed.
    Ignored,
    /// The attempt record was updated.
    Applied,
}

/// Walks the escalation queue for SOS incidents.
pub struct EscalationDispatcher {
    state: Arc<AppState>,
}

impl EscalationDispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Trigger an SOS escalation for `owner_id`.
    ///
    /// Configuration problems (no contacts, no telephony credentials) fail
    /// fast before any Incident row is written.
    pub async fn trigger(&self, owner_id: &str) -> Result<DbIncident, DispatchError> {
        if !self.state.config.telephony.is_configured() {
            return Err(DispatchError::TelephonyNotConfigured);
        }

        let contacts = self.state.with_db(|db| db.get_contacts(owner_id))?;
        if contacts.is_empty() {
            return Err(DispatchError::NoContactsConfigured);
        }

        let incident = self
            .state
            .with_db(|db| db.create_incident_with_queue(owner_id, &contacts))?;
        log::info!(
            "SOS triggered for {}: incident {} with {} contact(s)",
            owner_id,
            incident.id,
            contacts.len()
        );

        self.dial_from(&incident.id, 0).await?;

        let stored = self
            .state
            .with_db(|db| db.get_incident(&incident.id))?
            .ok_or_else(|| DispatchError::IncidentNotFound(incident.id.clone()))?;
        Ok(stored)
    }

    /// Operator close: completes the incident and suppresses any further
    /// dialing. The in-flight call, if any, cannot be unplaced; its late
    /// status callback will still be recorded.
    pub fn close(&self, incident_id: &str) -> Result<DbIncident, DispatchError> {
        let closed = self
            .state
            .with_db(|db| db.complete_incident(incident_id, IncidentOutcome::Closed))?;
        if closed {
            log::info!("Incident {} closed by operator", incident_id);
        }

        self.state
            .with_db(|db| db.get_incident(incident_id))?
            .ok_or_else(|| DispatchError::IncidentNotFound(incident_id.to_string()))
    }

    /// Apply a provider status callback, then drive the escalation if the
    /// in-flight attempt just resolved.
    pub async fn record_status(
        &self,
        call_sid: &str,
        status: CallStatus,
        duration_seconds: Option<i64>,
    ) -> Result<WebhookDisposition, DispatchError> {
        let update = self
            .state
            .with_db(|db| db.apply_provider_status(call_sid, status, duration_seconds))?;

        let Some(update) = update else {
            // Not fatal for the sender: a record may have been purged or the
            // callback may belong to a foreign environment.
            log::warn!("Status callback for unknown call_sid {}", call_sid);
            return Ok(WebhookDisposition::NoMatch);
        };

        let attempt = update.attempt;
        let incident = self
            .state
            .with_db(|db| db.get_incident(&attempt.incident_id))?
            .ok_or_else(|| DispatchError::IncidentNotFound(attempt.incident_id.clone()))?;

        // Only the in-flight attempt advances the walk. A late callback for
        // an already-passed position updates the record above and stops here.
        if incident.status == IncidentStatus::Open
            && attempt.position == incident.cursor
            && attempt.status.is_terminal()
        {
            if attempt.status == CallStatus::Answered {
                self.state
                    .with_db(|db| db.mark_incident_answered(&incident.id))?;
                log::info!(
                    "Incident {}: contact at position {} answered",
                    incident.id,
                    attempt.position
                );
            } else {
                self.advance(&incident.id, attempt.position).await?;
            }
        }

        // Sibling webhooks may race to be the final terminal delivery; the
        // conditional update completes the incident exactly once.
        let completed = self
            .state
            .with_db(|db| db.complete_if_fully_terminal(&attempt.incident_id))?;
        if completed {
            log::info!(
                "Incident {} completed: all contacts terminal, none answered",
                attempt.incident_id
            );
        }

        Ok(if update.applied {
            WebhookDisposition::Applied
        } else {
            WebhookDisposition::Ignored
        })
    }

    /// Sweep entry point: drive every open incident whose ring window has
    /// closed. Per-incident errors are logged, not propagated, so one bad
    /// row cannot stall the rest.
    pub async fn run_due(&self) {
        let due = match self.state.with_db(|db| db.get_due_incidents(&now_string())) {
            Ok(due) => due,
            Err(e) => {
                log::error!("Failed to query due incidents: {}", e);
                return;
            }
        };

        for incident in due {
            if let Err(e) = self.advance(&incident.id, incident.cursor).await {
                log::error!("Failed to advance incident {}: {}", incident.id, e);
            }
        }
    }

    /// Move the escalation past the attempt at `expected_cursor`, if it is
    /// resolved or its ring window has closed. Safe to call from both the
    /// webhook path and the sweep; the cursor CAS deduplicates.
    async fn advance(&self, incident_id: &str, expected_cursor: i64) -> Result<(), DispatchError> {
        let incident = self
            .state
            .with_db(|db| db.get_incident(incident_id))?
            .ok_or_else(|| DispatchError::IncidentNotFound(incident_id.to_string()))?;

        if incident.status != IncidentStatus::Open || incident.cursor != expected_cursor {
            return Ok(());
        }

        let attempt = self
            .state
            .with_db(|db| db.get_attempt_at(incident_id, expected_cursor))?;

        match attempt {
            Some(attempt) if attempt.status == CallStatus::Answered => {
                self.state
                    .with_db(|db| db.mark_incident_answered(incident_id))?;
                return Ok(());
            }
            Some(attempt) if !attempt.status.is_terminal() => {
                let deadline_elapsed = incident
                    .next_check_at
                    .as_deref()
                    .and_then(parse_timestamp)
                    .map(|deadline| deadline <= Utc::now())
                    .unwrap_or(false);
                if !deadline_elapsed {
                    // Still ringing inside the window; the webhook owns it.
                    return Ok(());
                }

                // Window closed without a terminal callback: treat as
                // no-answer. If the CAS loses, a webhook resolved the
                // attempt in the meantime. Re-read and honor an answer.
                if !self.state.with_db(|db| db.mark_attempt_timed_out(&attempt.id))? {
                    let resolved = self
                        .state
                        .with_db(|db| db.get_attempt_at(incident_id, expected_cursor))?;
                    if let Some(resolved) = resolved {
                        if resolved.status == CallStatus::Answered {
                            self.state
                                .with_db(|db| db.mark_incident_answered(incident_id))?;
                            return Ok(());
                        }
                    }
                } else {
                    log::info!(
                        "Incident {}: ring window closed at position {}, treating as no-answer",
                        incident_id,
                        expected_cursor
                    );
                }
            }
            Some(_) => {
                // Non-answered terminal: fall through to the cursor CAS.
            }
            None => {
                // Dialed never happened for this position (interrupted
                // trigger); dial it now rather than skipping the contact.
                return self.dial_from(incident_id, expected_cursor).await;
            }
        }

        if !self
            .state
            .with_db(|db| db.advance_cursor(incident_id, expected_cursor))?
        {
            return Ok(());
        }

        self.dial_from(incident_id, expected_cursor + 1).await
    }

    /// Dial the queue entry at `position`, walking forward past placement
    /// failures, until a call is in flight or the queue is exhausted.
    async fn dial_from(&self, incident_id: &str, position: i64) -> Result<(), DispatchError> {
        let mut position = position;
        loop {
            let incident = self
                .state
                .with_db(|db| db.get_incident(incident_id))?
                .ok_or_else(|| DispatchError::IncidentNotFound(incident_id.to_string()))?;
            if incident.status != IncidentStatus::Open {
                return Ok(());
            }

            let entry = self
                .state
                .with_db(|db| db.get_queue_entry(incident_id, position))?;
            let Some(entry) = entry else {
                let completed = self
                    .state
                    .with_db(|db| db.complete_incident(incident_id, IncidentOutcome::Unreachable))?;
                if completed {
                    log::warn!(
                        "Incident {}: contact list exhausted with no answer",
                        incident_id
                    );
                }
                return Ok(());
            };

            let attempt = self
                .state
                .with_db(|db| db.insert_attempt(incident_id, &entry.contact_id, position))?;

            // The DB lock is released while the provider call is in flight.
            match self
                .state
                .telephony
                .place_call(&entry.phone, incident_id)
                .await
            {
                Ok(placed) => {
                    let deadline = rfc3339_millis(
                        Utc::now()
                            + Duration::seconds(
                                self.state.config.escalation.ring_timeout_secs as i64,
                            ),
                    );
                    self.state.with_db(|db| {
                        db.mark_attempt_placed(&attempt.id, &placed.sid)?;
                        db.set_incident_deadline(incident_id, &deadline)
                    })?;
                    log::info!(
                        "Incident {}: dialing {} at position {} (sid {})",
                        incident_id,
                        entry.phone,
                        position,
                        placed.sid
                    );
                    return Ok(());
                }
                Err(err) => {
                    // Per-contact failure: record and move on. Never fatal
                    // for the escalation as a whole.
                    log::warn!(
                        "Incident {}: placement failed at position {}: {}",
                        incident_id,
                        position,
                        err
                    );
                    self.state
                        .with_db(|db| db.mark_attempt_placement_failed(&attempt.id))?;
                    if !self
                        .state
                        .with_db(|db| db.advance_cursor(incident_id, position))?
                    {
                        return Ok(());
                    }
                    position += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::config::{Config, TelephonyConfig};
    use crate::db::test_utils::test_db;
    use crate::db::SosDb;
    use crate::telephony::{CallPlacer, PlacedCall, TelephonyError};

    /// Scripted stand-in for the provider: pops one result per placement,
    /// defaulting to success with a fresh sid.
    struct ScriptedPlacer {
        script: Mutex<VecDeque<Result<(), TelephonyError>>>,
        placed: Mutex<Vec<String>>,
        counter: Mutex<u64>,
    }

    impl ScriptedPlacer {
        fn new(script: Vec<Result<(), TelephonyError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                placed: Mutex::new(Vec::new()),
                counter: Mutex::new(0),
            }
        }

        fn placed_numbers(&self) -> Vec<String> {
            self.placed.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CallPlacer for ScriptedPlacer {
        async fn place_call(
            &self,
            to: &str,
            _incident_id: &str,
        ) -> Result<PlacedCall, TelephonyError> {
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()));
            outcome?;

            self.placed.lock().unwrap().push(to.to_string());
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            Ok(PlacedCall {
                sid: format!("CA-{}", counter),
                status: "queued".to_string(),
            })
        }
    }

    fn test_config() -> Config {
        Config {
            telephony: TelephonyConfig {
                base_url: "https://voice.example.com".to_string(),
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
                caller_id: "+15550100".to_string(),
                status_callback_url: "https://app.example.com/webhooks/telephony/status"
                    .to_string(),
            },
            ..Default::default()
        }
    }

    fn seed_contacts(db: &SosDb, owner: &str, phones: &[&str]) {
        for (i, phone) in phones.iter().enumerate() {
            db.insert_contact(owner, &format!("Contact {}", i + 1), phone, None, "family", (i + 1) as i64)
                .unwrap();
        }
    }

    fn dispatcher_with(
        placer: Arc<ScriptedPlacer>,
        seed: impl FnOnce(&SosDb),
    ) -> (EscalationDispatcher, Arc<AppState>) {
        let db = test_db();
        seed(&db);
        let state = Arc::new(AppState::new(test_config(), db, placer));
        (EscalationDispatcher::new(state.clone()), state)
    }

    fn sid_at(state: &AppState, incident_id: &str, position: i64) -> String {
        state
            .with_db(|db| db.get_attempt_at(incident_id, position))
            .unwrap()
            .unwrap()
            .call_sid
            .unwrap()
    }

    #[tokio::test]
    async fn test_trigger_without_contacts_creates_nothing() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer, |_db| {});

        let err = dispatcher.trigger("owner-1").await.unwrap_err();
        assert!(matches!(err, DispatchError::NoContactsConfigured));

        let incidents: i64 = state
            .with_db(|db| {
                db.conn_ref()
                    .query_row("SELECT COUNT(*) FROM sos_incidents", [], |r| r.get(0))
                    .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(incidents, 0);
    }

    #[tokio::test]
    async fn test_trigger_without_telephony_config_fails_fast() {
        let db = test_db();
        seed_contacts(&db, "owner-1", &["+15550101"]);
        let state = Arc::new(AppState::new(
            Config::default(),
            db,
            Arc::new(ScriptedPlacer::new(vec![])),
        ));
        let dispatcher = EscalationDispatcher::new(state);

        let err = dispatcher.trigger("owner-1").await.unwrap_err();
        assert!(matches!(err, DispatchError::TelephonyNotConfigured));
    }

    #[tokio::test]
    async fn test_trigger_dials_only_first_contact() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102", "+15550103"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();
        assert_eq!(placer.placed_numbers(), vec!["+15550101"]);
        assert_eq!(incident.cursor, 0);
        assert!(incident.next_check_at.is_some());

        let attempts = state.with_db(|db| db.get_attempts(&incident.id)).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, CallStatus::Initiated);
    }

    #[tokio::test]
    async fn test_no_answer_advances_in_priority_order() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102", "+15550103"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();
        let sid = sid_at(&state, &incident.id, 0);
        dispatcher
            .record_status(&sid, CallStatus::NoAnswer, None)
            .await
            .unwrap();

        assert_eq!(
            placer.placed_numbers(),
            vec!["+15550101", "+15550102"]
        );
        let stored = state
            .with_db(|db| db.get_incident(&incident.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.cursor, 1);
        assert_eq!(stored.status, IncidentStatus::Open);
    }

    #[tokio::test]
    async fn test_answered_stops_escalation_and_keeps_incident_open() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102", "+15550103"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();
        let sid = sid_at(&state, &incident.id, 0);
        dispatcher
            .record_status(&sid, CallStatus::NoAnswer, None)
            .await
            .unwrap();
        let sid2 = sid_at(&state, &incident.id, 1);
        dispatcher
            .record_status(&sid2, CallStatus::Answered, Some(42))
            .await
            .unwrap();

        // Third contact never dialed; exactly two attempts exist
        assert_eq!(
            placer.placed_numbers(),
            vec!["+15550101", "+15550102"]
        );
        let attempts = state.with_db(|db| db.get_attempts(&incident.id)).unwrap();
        assert_eq!(attempts.len(), 2);

        let stored = state
            .with_db(|db| db.get_incident(&incident.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, IncidentStatus::Open);
        assert_eq!(stored.outcome, Some(IncidentOutcome::Answered));
        assert!(stored.next_check_at.is_none());
    }

    #[tokio::test]
    async fn test_placement_failure_advances_to_next_contact() {
        let placer = Arc::new(ScriptedPlacer::new(vec![Err(TelephonyError::ApiError {
            status: 503,
            message: "carrier unavailable".to_string(),
        })]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();

        // First placement was rejected, second went out
        assert_eq!(placer.placed_numbers(), vec!["+15550102"]);
        let attempts = state.with_db(|db| db.get_attempts(&incident.id)).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, CallStatus::Failed);
        assert_eq!(attempts[1].status, CallStatus::Initiated);
        assert_eq!(incident.cursor, 1);
    }

    #[tokio::test]
    async fn test_all_placements_failing_completes_unreachable() {
        let reject = || {
            Err(TelephonyError::ApiError {
                status: 400,
                message: "invalid number".to_string(),
            })
        };
        let placer = Arc::new(ScriptedPlacer::new(vec![reject(), reject()]));
        let (dispatcher, state) = dispatcher_with(placer, |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();
        assert_eq!(incident.status, IncidentStatus::Completed);
        assert_eq!(incident.outcome, Some(IncidentOutcome::Unreachable));

        let attempts = state.with_db(|db| db.get_attempts(&incident.id)).unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.status == CallStatus::Failed));
    }

    #[tokio::test]
    async fn test_exhausted_queue_completes_unreachable() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer, |db| {
            seed_contacts(db, "owner-1", &["+15550101"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();
        let sid = sid_at(&state, &incident.id, 0);
        dispatcher
            .record_status(&sid, CallStatus::Busy, None)
            .await
            .unwrap();

        let stored = state
            .with_db(|db| db.get_incident(&incident.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, IncidentStatus::Completed);
        assert_eq!(stored.outcome, Some(IncidentOutcome::Unreachable));
    }

    #[tokio::test]
    async fn test_sweep_times_out_silent_attempt_and_advances() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();

        // Nothing due while the ring window is open
        dispatcher.run_due().await;
        assert_eq!(placer.placed_numbers().len(), 1);

        // Force the deadline into the past and sweep again
        state
            .with_db(|db| db.set_incident_deadline(&incident.id, "2020-01-01T00:00:00.000Z"))
            .unwrap();
        dispatcher.run_due().await;

        assert_eq!(
            placer.placed_numbers(),
            vec!["+15550101", "+15550102"]
        );
        let first = state
            .with_db(|db| db.get_attempt_at(&incident.id, 0))
            .unwrap()
            .unwrap();
        assert_eq!(first.status, CallStatus::NoAnswer);
        assert!(first.timed_out);
    }

    #[tokio::test]
    async fn test_late_webhook_after_timeout_updates_without_redial() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();
        let sid = sid_at(&state, &incident.id, 0);

        state
            .with_db(|db| db.set_incident_deadline(&incident.id, "2020-01-01T00:00:00.000Z"))
            .unwrap();
        dispatcher.run_due().await;
        assert_eq!(placer.placed_numbers().len(), 2);

        // Provider truth arrives late for the timed-out attempt
        let disposition = dispatcher
            .record_status(&sid, CallStatus::Busy, Some(0))
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Applied);

        // Record corrected, but no extra dial and cursor unchanged
        assert_eq!(placer.placed_numbers().len(), 2);
        let first = state
            .with_db(|db| db.get_attempt_at(&incident.id, 0))
            .unwrap()
            .unwrap();
        assert_eq!(first.status, CallStatus::Busy);
        let stored = state
            .with_db(|db| db.get_incident(&incident.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.cursor, 1);
    }

    #[tokio::test]
    async fn test_webhook_replay_is_idempotent() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();
        let sid = sid_at(&state, &incident.id, 0);

        dispatcher
            .record_status(&sid, CallStatus::NoAnswer, None)
            .await
            .unwrap();
        let replay = dispatcher
            .record_status(&sid, CallStatus::NoAnswer, None)
            .await
            .unwrap();
        assert_eq!(replay, WebhookDisposition::Ignored);

        // The replay must not dial anyone else
        assert_eq!(placer.placed_numbers().len(), 2);
        let stored = state
            .with_db(|db| db.get_incident(&incident.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.cursor, 1);
    }

    #[tokio::test]
    async fn test_unknown_sid_is_acknowledged() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, _state) = dispatcher_with(placer, |_db| {});

        let disposition = dispatcher
            .record_status("CA-unknown", CallStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::NoMatch);
    }

    #[tokio::test]
    async fn test_operator_close_suppresses_further_dialing() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();
        let closed = dispatcher.close(&incident.id).unwrap();
        assert_eq!(closed.status, IncidentStatus::Completed);
        assert_eq!(closed.outcome, Some(IncidentOutcome::Closed));

        // The in-flight call resolves afterwards; no further dialing
        let sid = sid_at(&state, &incident.id, 0);
        dispatcher
            .record_status(&sid, CallStatus::NoAnswer, None)
            .await
            .unwrap();
        assert_eq!(placer.placed_numbers(), vec!["+15550101"]);
    }

    #[tokio::test]
    async fn test_registry_edits_do_not_affect_inflight_escalation() {
        let placer = Arc::new(ScriptedPlacer::new(vec![]));
        let (dispatcher, state) = dispatcher_with(placer.clone(), |db| {
            seed_contacts(db, "owner-1", &["+15550101", "+15550102"]);
        });

        let incident = dispatcher.trigger("owner-1").await.unwrap();

        // Owner deletes the second contact mid-escalation
        let contacts = state.with_db(|db| db.get_contacts("owner-1")).unwrap();
        state
            .with_db(|db| db.delete_contact("owner-1", &contacts[1].id).map(|_| ()))
            .unwrap();

        let sid = sid_at(&state, &incident.id, 0);
        dispatcher
            .record_status(&sid, CallStatus::NoAnswer, None)
            .await
            .unwrap();

        // The snapshot still dials the deleted contact
        assert_eq!(
            placer.placed_numbers(),
            vec!["+15550101", "+15550102"]
        );
    }
}
