use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode};
use uuid::Uuid;

use mvrx_shared::{Commit, StationUuid};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Append `commit` to the persisted log of `station`.
    pub fn insert_commit(&self, station: StationUuid, commit: &Commit) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO commits
                (station_uuid, commit_uuid, file_uuid, author_uuid, timestamp, comment, file_name, file_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                station.to_string(),
                commit.commit_uuid.to_string(),
                commit.file_uuid.to_string(),
                commit.station_uuid.to_string(),
                commit.timestamp.to_rfc3339(),
                commit.comment,
                commit.file_name,
                commit.file_size.map(|s| s as i64),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateCommit(commit.commit_uuid))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every persisted commit with the log it belongs to, in append order.
    pub fn load_commits(&self) -> Result<Vec<(StationUuid, Commit)>> {
        let mut stmt = self.conn().prepare(
            "SELECT station_uuid, commit_uuid, file_uuid, author_uuid, timestamp, comment, file_name, file_size
             FROM commits
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(RawRow {
                station: row.get(0)?,
                commit_uuid: row.get(1)?,
                file_uuid: row.get(2)?,
                author: row.get(3)?,
                timestamp: row.get(4)?,
                comment: row.get(5)?,
                file_name: row.get(6)?,
                file_size: row.get(7)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_commit()?);
        }
        Ok(out)
    }

    /// Delete a station's persisted log. Returns the number of removed rows.
    pub fn delete_commits(&self, station: StationUuid) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM commits WHERE station_uuid = ?1",
            params![station.to_string()],
        )?;
        Ok(affected)
    }
}

struct RawRow {
    station: String,
    commit_uuid: String,
    file_uuid: String,
    author: String,
    timestamp: String,
    comment: String,
    file_name: Option<String>,
    file_size: Option<i64>,
}

impl RawRow {
    fn into_commit(self) -> Result<(StationUuid, Commit)> {
        let parse = |s: &str| Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("{s}: {e}")));

        let station = StationUuid(parse(&self.station)?);
        let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("timestamp {}: {e}", self.timestamp)))?;

        let commit = Commit {
            commit_uuid: parse(&self.commit_uuid)?,
            file_uuid: parse(&self.file_uuid)?,
            station_uuid: StationUuid(parse(&self.author)?),
            timestamp,
            comment: self.comment,
            file_name: self.file_name,
            file_size: self.file_size.map(|s| s as u64),
        };
        Ok((station, commit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("commits.db")).unwrap();
        (db, dir)
    }

    #[test]
    fn test_insert_and_load_in_order() {
        let (db, _dir) = test_db();
        let a = StationUuid::generate();
        let b = StationUuid::generate();

        let c1 = Commit::new_local(a, "one").with_file("show.mvr", 42);
        let c2 = Commit::new_local(b, "two");
        let c3 = Commit::new_local(a, "three");
        db.insert_commit(a, &c1).unwrap();
        db.insert_commit(b, &c2).unwrap();
        db.insert_commit(a, &c3).unwrap();

        let loaded = db.load_commits().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].0, a);
        assert_eq!(loaded[0].1.commit_uuid, c1.commit_uuid);
        assert_eq!(loaded[0].1.file_size, Some(42));
        assert_eq!(loaded[1].0, b);
        assert_eq!(loaded[2].1.comment, "three");
    }

    #[test]
    fn test_duplicate_insert_is_distinguishable() {
        let (db, _dir) = test_db();
        let a = StationUuid::generate();
        let commit = Commit::new_local(a, "dup");

        db.insert_commit(a, &commit).unwrap();
        let err = db.insert_commit(a, &commit).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCommit(id) if id == commit.commit_uuid));

        // Same commit under another station's log is a different entry.
        db.insert_commit(StationUuid::generate(), &commit).unwrap();
    }

    #[test]
    fn test_delete_commits_only_touches_one_station() {
        let (db, _dir) = test_db();
        let a = StationUuid::generate();
        let b = StationUuid::generate();
        db.insert_commit(a, &Commit::new_local(a, "a1")).unwrap();
        db.insert_commit(a, &Commit::new_local(a, "a2")).unwrap();
        db.insert_commit(b, &Commit::new_local(b, "b1")).unwrap();

        assert_eq!(db.delete_commits(a).unwrap(), 2);
        let loaded = db.load_commits().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, b);
    }
}
