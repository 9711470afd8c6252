// src/db/models.rs

//! Data models for the changeset history
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading and updating records.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fmt;
use std::str::FromStr;

/// Changeset status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetStatus {
    Pending,
    Applied,
    RolledBack,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for ChangesetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangesetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "applied" => Ok(ChangesetStatus::Applied),
            "rolled_back" => Ok(ChangesetStatus::RolledBack),
            _ => Err(format!("Invalid changeset status: {}", s)),
        }
    }
}

/// A Changeset records one transaction against the prefix
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: Option<i64>,
    pub description: String,
    /// `install`, `uninstall`, `link` or `unlink`
    pub operation: String,
    pub status: ChangesetStatus,
    pub created_at: Option<String>,
    pub applied_at: Option<String>,
    pub rolled_back_at: Option<String>,
    /// Why the changeset was rolled back
    pub error: Option<String>,
}

impl Changeset {
    pub fn new(operation: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
            operation: operation.into(),
            status: ChangesetStatus::Pending,
            created_at: None,
            applied_at: None,
            rolled_back_at: None,
            error: None,
        }
    }

    /// Insert this changeset into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changesets (description, operation, status) VALUES (?1, ?2, ?3)",
            params![&self.description, &self.operation, self.status.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, operation, status, created_at, applied_at, rolled_back_at, error
             FROM changesets WHERE id = ?1",
        )?;

        let changeset = stmt.query_row([id], Self::from_row).optional()?;

        Ok(changeset)
    }

    /// All changesets, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, operation, status, created_at, applied_at, rolled_back_at, error
             FROM changesets ORDER BY id DESC",
        )?;

        let changesets = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// Update changeset status
    pub fn update_status(&mut self, conn: &Connection, new_status: ChangesetStatus) -> Result<()> {
        let id = self.require_id()?;

        let timestamp_field = match new_status {
            ChangesetStatus::Applied => Some("applied_at"),
            ChangesetStatus::RolledBack => Some("rolled_back_at"),
            ChangesetStatus::Pending => None,
        };

        match timestamp_field {
            Some(field) => conn.execute(
                &format!(
                    "UPDATE changesets SET status = ?1, {} = CURRENT_TIMESTAMP WHERE id = ?2",
                    field
                ),
                params![new_status.as_str(), id],
            )?,
            None => conn.execute(
                "UPDATE changesets SET status = ?1 WHERE id = ?2",
                params![new_status.as_str(), id],
            )?,
        };

        self.status = new_status;
        Ok(())
    }

    /// Mark rolled back, keeping the reason
    pub fn roll_back(&mut self, conn: &Connection, reason: &str) -> Result<()> {
        let id = self.require_id()?;
        conn.execute(
            "UPDATE changesets SET error = ?1 WHERE id = ?2",
            params![reason, id],
        )?;
        self.error = Some(reason.to_string());
        self.update_status(conn, ChangesetStatus::RolledBack)
    }

    /// Kegs recorded against this changeset
    pub fn kegs(&self, conn: &Connection) -> Result<Vec<ChangesetKeg>> {
        ChangesetKeg::find_by_changeset(conn, self.require_id()?)
    }

    fn require_id(&self) -> Result<i64> {
        self.id
            .ok_or_else(|| Error::InitError("Changeset has not been inserted".to_string()))
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(3)?;
        let status = status_str.parse::<ChangesetStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            operation: row.get(2)?,
            status,
            created_at: row.get(4)?,
            applied_at: row.get(5)?,
            rolled_back_at: row.get(6)?,
            error: row.get(7)?,
        })
    }
}

/// What a changeset did to a keg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KegAction {
    /// Built, adopted and (unless keg-only) linked
    Installed,
    /// An existing keg was linked
    Linked,
    /// A previously superseded keg was linked again
    Relinked,
    /// An older version was unlinked in favour of a newer one
    Superseded,
    Unlinked,
    Removed,
}

impl KegAction {
    pub fn as_str(&self) -> &str {
        match self {
            KegAction::Installed => "installed",
            KegAction::Linked => "linked",
            KegAction::Relinked => "relinked",
            KegAction::Superseded => "superseded",
            KegAction::Unlinked => "unlinked",
            KegAction::Removed => "removed",
        }
    }
}

impl fmt::Display for KegAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KegAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "installed" => Ok(KegAction::Installed),
            "linked" => Ok(KegAction::Linked),
            "relinked" => Ok(KegAction::Relinked),
            "superseded" => Ok(KegAction::Superseded),
            "unlinked" => Ok(KegAction::Unlinked),
            "removed" => Ok(KegAction::Removed),
            _ => Err(format!("Invalid keg action: {}", s)),
        }
    }
}

/// One keg touched by a changeset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetKeg {
    pub id: Option<i64>,
    pub changeset_id: i64,
    pub name: String,
    pub version: String,
    pub action: KegAction,
}

impl ChangesetKeg {
    pub fn new(
        changeset_id: i64,
        name: impl Into<String>,
        version: impl Into<String>,
        action: KegAction,
    ) -> Self {
        Self {
            id: None,
            changeset_id,
            name: name.into(),
            version: version.into(),
            action,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changeset_kegs (changeset_id, name, version, action)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.changeset_id, &self.name, &self.version, self.action.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Rows of one changeset in the order they were recorded
    pub fn find_by_changeset(conn: &Connection, changeset_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, changeset_id, name, version, action
             FROM changeset_kegs WHERE changeset_id = ?1 ORDER BY id",
        )?;

        let kegs = stmt
            .query_map([changeset_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(kegs)
    }

    /// Every recorded action on a formula, oldest first
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, changeset_id, name, version, action
             FROM changeset_kegs WHERE name = ?1 ORDER BY id",
        )?;

        let kegs = stmt
            .query_map([name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(kegs)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let action_str: String = row.get(4)?;
        let action = action_str.parse::<KegAction>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            changeset_id: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_changeset_crud() {
        let (_temp, conn) = create_test_db();

        let mut changeset = Changeset::new("install", "Install git");
        let id = changeset.insert(&conn).unwrap();

        let found = Changeset::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.description, "Install git");
        assert_eq!(found.operation, "install");
        assert_eq!(found.status, ChangesetStatus::Pending);
        assert!(found.applied_at.is_none());

        changeset
            .update_status(&conn, ChangesetStatus::Applied)
            .unwrap();
        let found = Changeset::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.status, ChangesetStatus::Applied);
        assert!(found.applied_at.is_some());
    }

    #[test]
    fn test_roll_back_records_reason() {
        let (_temp, conn) = create_test_db();

        let mut changeset = Changeset::new("install", "Install broken");
        let id = changeset.insert(&conn).unwrap();
        changeset.roll_back(&conn, "Build of broken failed").unwrap();

        let found = Changeset::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.status, ChangesetStatus::RolledBack);
        assert_eq!(found.error.as_deref(), Some("Build of broken failed"));
        assert!(found.rolled_back_at.is_some());
    }

    #[test]
    fn test_list_all_newest_first() {
        let (_temp, conn) = create_test_db();
        for name in ["a", "b", "c"] {
            Changeset::new("install", format!("Install {}", name))
                .insert(&conn)
                .unwrap();
        }

        let all = Changeset::list_all(&conn).unwrap();
        let descriptions: Vec<_> = all.iter().map(|c| c.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Install c", "Install b", "Install a"]);
    }

    #[test]
    fn test_changeset_kegs() {
        let (_temp, conn) = create_test_db();
        let mut changeset = Changeset::new("install", "Install app");
        let id = changeset.insert(&conn).unwrap();

        ChangesetKeg::new(id, "lib", "1.0", KegAction::Installed)
            .insert(&conn)
            .unwrap();
        ChangesetKeg::new(id, "app", "2.0", KegAction::Installed)
            .insert(&conn)
            .unwrap();
        ChangesetKeg::new(id, "app", "1.0", KegAction::Superseded)
            .insert(&conn)
            .unwrap();

        let kegs = changeset.kegs(&conn).unwrap();
        assert_eq!(kegs.len(), 3);
        assert_eq!(kegs[0].name, "lib");
        assert_eq!(kegs[2].action, KegAction::Superseded);

        let app = ChangesetKeg::find_by_name(&conn, "app").unwrap();
        assert_eq!(app.len(), 2);
    }

    #[test]
    fn test_keg_rows_require_changeset() {
        let (_temp, conn) = create_test_db();
        let result = ChangesetKeg::new(999, "ghost", "1.0", KegAction::Installed).insert(&conn);
        assert!(result.is_err());
    }

    #[test]
    fn test_status_and_action_strings() {
        for status in [
            ChangesetStatus::Pending,
            ChangesetStatus::Applied,
            ChangesetStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<ChangesetStatus>().unwrap(), status);
        }
        assert_eq!("relinked".parse::<KegAction>().unwrap(), KegAction::Relinked);
        assert!("bogus".parse::<KegAction>().is_err());
    }
}
