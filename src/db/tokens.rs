use rusqlite::{params, OptionalExtension};

use crate::util::now_string;

use super::{DbError, SosDb};

impl SosDb {
    // =========================================================================
    // API tokens: bearer-token lookup for authenticated endpoints
    // =========================================================================

    pub fn upsert_api_token(&self, token: &str, user_id: &str) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO api_tokens (token, user_id, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(token) DO UPDATE SET user_id = excluded.user_id",
            params![token, user_id, now_string()],
        )?;
        Ok(())
    }

    /// Resolve a bearer token to the user it authenticates.
    pub fn lookup_api_token(&self, token: &str) -> Result<Option<String>, DbError> {
        let user_id = self
            .conn_ref()
            .query_row(
                "SELECT user_id FROM api_tokens WHERE token = ?1",
                params![token],
                |r| r.get(0),
            )
            .optional()?;
        Ok(user_id)
    }
}
