//! Shared application state.

use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::db::{DbError, SosDb};
use crate::telephony::CallPlacer;

/// State shared by the HTTP handlers and the scheduler loop.
///
/// The SQLite connection is not `Sync`, so it sits behind a mutex; every
/// access goes through `with_db` and the guard is never held across an
/// await point.
pub struct AppState {
    pub config: Config,
    db: Mutex<SosDb>,
    pub telephony: Arc<dyn CallPlacer>,
}

impl AppState {
    pub fn new(config: Config, db: SosDb, telephony: Arc<dyn CallPlacer>) -> Self {
        // Seed configured bearer tokens so self-hosted deployments are
        // usable straight from the config file.
        for entry in &config.api_tokens {
            if let Err(e) = db.upsert_api_token(&entry.token, &entry.user_id) {
                log::warn!("Failed to seed api token for {}: {}", entry.user_id, e);
            }
        }

        Self {
            config,
            db: Mutex::new(db),
            telephony,
        }
    }

    /// Run a closure against the database under the lock.
    pub fn with_db<T>(&self, f: impl FnOnce(&SosDb) -> Result<T, DbError>) -> Result<T, DbError> {
        let guard = self.db.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&guard)
    }
}
