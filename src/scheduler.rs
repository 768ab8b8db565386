//! Scheduler loop: escalation sweep + retention schedule.
//!
//! Two cadences share one loop:
//! - every pass, open incidents whose ring-window deadline elapsed are
//!   advanced (the durable-timer half of the dispatcher; the other half is
//!   the status webhook)
//! - once a minute, the retention cron entry is evaluated with
//!   timezone-aware scheduling, sleep/wake detection via time-jump polling,
//!   and missed-job handling within a grace period

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::escalation::EscalationDispatcher;
use crate::presence::purge_expired_pings;
use crate::state::AppState;

/// Sweep cadence. Ring windows are ~15s; a 2s sweep keeps timeout
/// advancement prompt without hammering the database.
const SWEEP_INTERVAL_SECS: u64 = 2;

/// How often the retention cron entry is evaluated.
const RETENTION_CHECK_INTERVAL_SECS: i64 = 60;

/// Grace period for a retention run missed during sleep (2 hours).
const MISSED_JOB_GRACE_PERIOD_SECS: i64 = 7200;

/// Time jump threshold to detect sleep/wake (5 minutes).
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Scheduler driving the escalation sweep and the retention job.
pub struct Scheduler {
    state: Arc<AppState>,
    dispatcher: EscalationDispatcher,
    last_retention_run: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        let dispatcher = EscalationDispatcher::new(state.clone());
        Self {
            state,
            dispatcher,
            last_retention_run: None,
        }
    }

    /// Start the scheduler loop. Runs indefinitely.
    pub async fn run(mut self) {
        let mut last_check = Utc::now();
        let mut last_retention_check = Utc::now();

        loop {
            tokio::time::sleep(Duration::from_secs(SWEEP_INTERVAL_SECS)).await;

            let now = Utc::now();

            // Detect sleep: time jumped more than 5 minutes
            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for missed retention run",
                    time_jump
                );
                if let Ok(Some(missed)) = self.find_missed_retention(now) {
                    log::info!("Found missed retention run (scheduled {}), running now", missed);
                    self.run_retention(now);
                }
            }

            self.dispatcher.run_due().await;

            if (now - last_retention_check).num_seconds() >= RETENTION_CHECK_INTERVAL_SECS {
                match self.should_run_retention(now) {
                    Ok(true) => self.run_retention(now),
                    Ok(false) => {}
                    Err(e) => log::warn!("Retention schedule misconfigured: {}", e),
                }
                last_retention_check = now;
            }

            last_check = now;
        }
    }

    fn run_retention(&mut self, now: DateTime<Utc>) {
        let max_age_days = self.state.config.retention.max_age_days;
        match self
            .state
            .with_db(|db| purge_expired_pings(db, max_age_days, now))
        {
            Ok(deleted) => {
                log::info!(
                    "Retention purge: deleted {} ping(s) older than {} days",
                    deleted,
                    max_age_days
                );
                self.last_retention_run = Some(now);
            }
            Err(e) => log::error!("Retention purge failed: {}", e),
        }
    }

    /// Check if the retention job should run at the given time.
    fn should_run_retention(&self, now: DateTime<Utc>) -> Result<bool, String> {
        let entry = &self.state.config.retention;
        let schedule = parse_cron(&entry.cron)?;
        let tz: Tz = entry
            .timezone
            .parse()
            .map_err(|_| format!("Invalid timezone: {}", entry.timezone))?;

        let now_local = now.with_timezone(&tz);

        // Find the most recent scheduled time that's <= now
        let mut scheduled_times = schedule.after(&(now_local - chrono::Duration::minutes(2)));

        if let Some(next_time) = scheduled_times.next() {
            let next_utc = next_time.with_timezone(&Utc);
            let diff = (now - next_utc).num_seconds().abs();

            // Within 2 minutes of scheduled time
            if diff < 120 {
                // Check if we already ran this scheduled time
                if let Some(last) = self.last_retention_run {
                    if (last - next_utc).num_seconds().abs() < 60 {
                        return Ok(false); // Already ran
                    }
                }
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Find a retention run missed during sleep, within the grace period.
    fn find_missed_retention(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, String> {
        let entry = &self.state.config.retention;
        let schedule = parse_cron(&entry.cron)?;
        let tz: Tz = entry
            .timezone
            .parse()
            .map_err(|_| format!("Invalid timezone: {}", entry.timezone))?;

        let now_local = now.with_timezone(&tz);
        let grace_start = now_local - chrono::Duration::seconds(MISSED_JOB_GRACE_PERIOD_SECS);

        for scheduled in schedule.after(&grace_start) {
            let scheduled_utc = scheduled.with_timezone(&Utc);

            if scheduled_utc > now {
                break;
            }

            if let Some(last) = self.last_retention_run {
                if last >= scheduled_utc {
                    continue; // Already ran
                }
            }

            return Ok(Some(scheduled_utc));
        }

        Ok(None)
    }
}

/// Parse a cron expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, String> {
    // The cron crate expects 6 fields (with seconds), but config uses the
    // 5-field format. Add "0" for seconds at the start.
    let full_expr = format!("0 {}", expr);

    full_expr
        .parse::<Schedule>()
        .map_err(|e| format!("Invalid cron expression '{}': {}", expr, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cron_daily_4am() {
        assert!(parse_cron("0 4 * * *").is_ok());
    }

    #[test]
    fn test_parse_cron_weekdays() {
        assert!(parse_cron("30 2 * * 1-5").is_ok());
    }

    #[test]
    fn test_parse_cron_invalid() {
        assert!(parse_cron("not a cron").is_err());
    }
}
