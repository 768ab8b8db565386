use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::util::now_string;

use super::{DbError, DbLivePresence, DbLocationPing, DbMemberPresence, SosDb};

/// Fields of one accepted location sample, written to both the history and
/// the live row.
#[derive(Debug, Clone)]
pub struct PingRecord {
    pub user_id: String,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub battery: Option<f64>,
    pub source: String,
    pub captured_at: String,
}

impl SosDb {
    // =========================================================================
    // Location pings + live presence
    // =========================================================================

    /// Append one sample to the ping history. Appends are race-free; the
    /// history keeps every accepted sample for the retention window.
    pub fn append_ping(&self, ping: &PingRecord) -> Result<DbLocationPing, DbError> {
        let id = Uuid::new_v4().to_string();
        let received_at = now_string();
        self.conn_ref().execute(
            "INSERT INTO location_pings
                (id, user_id, lat, lng, accuracy, speed, battery, source,
                 captured_at, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                ping.user_id,
                ping.lat,
                ping.lng,
                ping.accuracy,
                ping.speed,
                ping.battery,
                ping.source,
                ping.captured_at,
                received_at
            ],
        )?;

        Ok(DbLocationPing {
            id,
            user_id: ping.user_id.clone(),
            lat: ping.lat,
            lng: ping.lng,
            accuracy: ping.accuracy,
            speed: ping.speed,
            battery: ping.battery,
            source: ping.source.clone(),
            captured_at: ping.captured_at.clone(),
            received_at,
        })
    }

    /// Overwrite the user's current position, last-write-wins by
    /// `captured_at`. A single conditional upsert (never read-modify-write)
    /// so concurrent duplicate pings race harmlessly, and a sample older
    /// than the stored `last_seen` (network-delayed delivery) is rejected.
    /// Returns true when the live row was updated.
    pub fn upsert_presence(&self, ping: &PingRecord) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "INSERT INTO live_presence
                (user_id, lat, lng, battery, paused, last_seen, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                 lat = excluded.lat,
                 lng = excluded.lng,
                 battery = excluded.battery,
                 last_seen = excluded.last_seen,
                 updated_at = excluded.updated_at
             WHERE excluded.last_seen >= live_presence.last_seen",
            params![
                ping.user_id,
                ping.lat,
                ping.lng,
                ping.battery,
                ping.captured_at,
                now_string()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Flip the explicit sharing-pause flag. Only meaningful for users who
    /// have published at least once; returns false when no live row exists.
    pub fn set_presence_paused(&self, user_id: &str, paused: bool) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE live_presence
             SET paused = ?2, updated_at = ?3
             WHERE user_id = ?1",
            params![user_id, paused as i64, now_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_presence(&self, user_id: &str) -> Result<Option<DbLivePresence>, DbError> {
        let presence = self
            .conn_ref()
            .query_row(
                "SELECT user_id, lat, lng, battery, paused, last_seen, updated_at
                 FROM live_presence
                 WHERE user_id = ?1",
                params![user_id],
                Self::map_presence_row,
            )
            .optional()?;
        Ok(presence)
    }

    /// Every member of a family group joined with their current presence
    /// (None for members who never published).
    pub fn get_group_presence(&self, group_id: &str) -> Result<Vec<DbMemberPresence>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT m.user_id, m.role,
                    p.user_id, p.lat, p.lng, p.battery, p.paused, p.last_seen, p.updated_at
             FROM family_members m
             LEFT JOIN live_presence p ON p.user_id = m.user_id
             WHERE m.group_id = ?1
             ORDER BY m.user_id",
        )?;

        let rows = stmt.query_map(params![group_id], |row| {
            let presence_user: Option<String> = row.get(2)?;
            let presence = match presence_user {
                Some(user_id) => {
                    let paused: i64 = row.get(6)?;
                    Some(DbLivePresence {
                        user_id,
                        lat: row.get(3)?,
                        lng: row.get(4)?,
                        battery: row.get(5)?,
                        paused: paused != 0,
                        last_seen: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                }
                None => None,
            };
            Ok(DbMemberPresence {
                user_id: row.get(0)?,
                role: row.get(1)?,
                presence,
            })
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Delete ping history older than the cutoff. The live_presence table is
    /// deliberately untouched: it is overwritten in place, not appended.
    pub fn purge_pings_before(&self, cutoff: &str) -> Result<usize, DbError> {
        let deleted = self.conn_ref().execute(
            "DELETE FROM location_pings WHERE captured_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    fn map_presence_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbLivePresence> {
        let paused: i64 = row.get(4)?;
        Ok(DbLivePresence {
            user_id: row.get(0)?,
            lat: row.get(1)?,
            lng: row.get(2)?,
            battery: row.get(3)?,
            paused: paused != 0,
            last_seen: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}
