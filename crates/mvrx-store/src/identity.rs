//! Persistent station identity.
//!
//! The identifier is generated on first run, written to the database and read
//! back on every later start. A stored value is only replaced when it cannot
//! be parsed or is the reserved nil UUID.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use mvrx_shared::StationUuid;

use crate::database::Database;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationIdentity {
    station_uuid: StationUuid,
}

impl StationIdentity {
    /// Load the stored identity, creating and persisting one if none is valid.
    pub fn load_or_create(db: &Database) -> Result<Self> {
        let stored: Option<String> = db
            .conn()
            .query_row(
                "SELECT station_uuid FROM station_identity WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(raw) = stored {
            match StationUuid::parse(&raw) {
                Ok(station_uuid) => {
                    info!(station = %station_uuid, "Loaded station identity");
                    return Ok(Self { station_uuid });
                }
                Err(e) => warn!(value = %raw, error = %e, "Stored station identity is invalid, regenerating"),
            }
        }

        let station_uuid = StationUuid::generate();
        db.conn().execute(
            "INSERT OR REPLACE INTO station_identity (id, station_uuid, created_at) VALUES (1, ?1, ?2)",
            params![station_uuid.to_string(), Utc::now().to_rfc3339()],
        )?;
        info!(station = %station_uuid, "Created station identity");

        Ok(Self { station_uuid })
    }

    /// An identity that is never persisted.
    pub fn ephemeral() -> Self {
        Self {
            station_uuid: StationUuid::generate(),
        }
    }

    pub fn station_uuid(&self) -> StationUuid {
        self.station_uuid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.db");

        let first = {
            let db = Database::open_at(&path).unwrap();
            StationIdentity::load_or_create(&db).unwrap()
        };
        assert!(!first.station_uuid().is_nil());

        let db = Database::open_at(&path).unwrap();
        let second = StationIdentity::load_or_create(&db).unwrap();
        let third = StationIdentity::load_or_create(&db).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.station_uuid(), third.station_uuid());
    }

    #[test]
    fn test_nil_identity_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("identity.db")).unwrap();
        db.conn()
            .execute(
                "INSERT INTO station_identity (id, station_uuid, created_at) VALUES (1, ?1, ?2)",
                params!["00000000-0000-0000-0000-000000000000", Utc::now().to_rfc3339()],
            )
            .unwrap();

        let identity = StationIdentity::load_or_create(&db).unwrap();
        assert!(!identity.station_uuid().is_nil());

        let again = StationIdentity::load_or_create(&db).unwrap();
        assert_eq!(identity, again);
    }
}
