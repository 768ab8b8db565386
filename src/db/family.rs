use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::util::now_string;

use super::{DbError, SosDb};

/// A family membership row as stored: the role column is nullable and may
/// hold values written by older app versions.
#[derive(Debug, Clone)]
pub struct DbMembership {
    pub group_id: String,
    pub user_id: String,
    pub role: Option<String>,
}

impl SosDb {
    // =========================================================================
    // Family groups: access scoping for presence reads
    // =========================================================================

    pub fn insert_family_group(&self, owner_id: &str, name: &str) -> Result<String, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = now_string();
        self.with_transaction(|db| {
            db.conn_ref().execute(
                "INSERT INTO family_groups (id, owner_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, owner_id, name, now],
            )?;
            db.conn_ref().execute(
                "INSERT INTO family_members (group_id, user_id, role)
                 VALUES (?1, ?2, 'owner')",
                params![id, owner_id],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn insert_family_member(
        &self,
        group_id: &str,
        user_id: &str,
        role: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT OR REPLACE INTO family_members (group_id, user_id, role)
             VALUES (?1, ?2, ?3)",
            params![group_id, user_id, role],
        )?;
        Ok(())
    }

    pub fn get_group_owner(&self, group_id: &str) -> Result<Option<String>, DbError> {
        let owner = self
            .conn_ref()
            .query_row(
                "SELECT owner_id FROM family_groups WHERE id = ?1",
                params![group_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    pub fn get_membership(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<DbMembership>, DbError> {
        let membership = self
            .conn_ref()
            .query_row(
                "SELECT group_id, user_id, role
                 FROM family_members
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
                |row| {
                    Ok(DbMembership {
                        group_id: row.get(0)?,
                        user_id: row.get(1)?,
                        role: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_utils::test_db;

    #[test]
    fn test_group_owner_gets_owner_role() {
        let db = test_db();
        let group = db.insert_family_group("owner-1", "Family").unwrap();

        assert_eq!(
            db.get_group_owner(&group).unwrap().as_deref(),
            Some("owner-1")
        );
        let membership = db.get_membership(&group, "owner-1").unwrap().unwrap();
        assert_eq!(membership.role.as_deref(), Some("owner"));
    }

    #[test]
    fn test_membership_role_may_be_null() {
        let db = test_db();
        let group = db.insert_family_group("owner-1", "Family").unwrap();
        db.insert_family_member(&group, "user-2", None).unwrap();

        let membership = db.get_membership(&group, "user-2").unwrap().unwrap();
        assert!(membership.role.is_none());
        assert!(db.get_membership(&group, "user-3").unwrap().is_none());
    }
}
