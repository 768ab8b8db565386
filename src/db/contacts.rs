use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::util::now_string;

use super::{DbContact, DbError, SosDb};

impl SosDb {
    // =========================================================================
    // Contact registry
    // =========================================================================

    /// Insert a contact and return the stored row.
    pub fn insert_contact(
        &self,
        owner_id: &str,
        name: &str,
        phone: &str,
        email: Option<&str>,
        relationship: &str,
        priority: i64,
    ) -> Result<DbContact, DbError> {
        let now = now_string();
        let id = Uuid::new_v4().to_string();
        self.conn_ref().execute(
            "INSERT INTO emergency_contacts
                (id, owner_id, name, phone, email, relationship, priority, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![id, owner_id, name, phone, email, relationship, priority, now],
        )?;

        Ok(DbContact {
            id,
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            email: email.map(str::to_string),
            relationship: relationship.to_string(),
            priority,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// All contacts for an owner, ascending by priority. Priority is a sort
    /// key only; duplicates are allowed and tie-break on insertion order.
    pub fn get_contacts(&self, owner_id: &str) -> Result<Vec<DbContact>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id, owner_id, name, phone, email, relationship, priority,
                    created_at, updated_at
             FROM emergency_contacts
             WHERE owner_id = ?1
             ORDER BY priority, created_at",
        )?;

        let rows = stmt.query_map(params![owner_id], Self::map_contact_row)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    pub fn get_contact(&self, id: &str) -> Result<Option<DbContact>, DbError> {
        let contact = self
            .conn_ref()
            .query_row(
                "SELECT id, owner_id, name, phone, email, relationship, priority,
                        created_at, updated_at
                 FROM emergency_contacts
                 WHERE id = ?1",
                params![id],
                Self::map_contact_row,
            )
            .optional()?;
        Ok(contact)
    }

    /// Delete a contact owned by `owner_id`. Returns true when a row was
    /// removed. In-flight escalations are unaffected: they dial from the
    /// queue snapshot, not the live registry.
    pub fn delete_contact(&self, owner_id: &str, id: &str) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "DELETE FROM emergency_contacts WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id],
        )?;
        Ok(changed > 0)
    }

    fn map_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbContact> {
        Ok(DbContact {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            email: row.get(4)?,
            relationship: row.get(5)?,
            priority: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}
