//! v001 -- Initial schema creation.
//!
//! Creates `station_identity` and `commits`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- This installation's identity (single row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS station_identity (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    station_uuid TEXT NOT NULL,               -- UUID, never nil
    created_at   TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Per-station commit logs
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS commits (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,  -- append order
    station_uuid TEXT NOT NULL,               -- log this commit belongs to
    commit_uuid  TEXT NOT NULL,
    file_uuid    TEXT NOT NULL,
    author_uuid  TEXT NOT NULL,               -- station that created the commit
    timestamp    TEXT NOT NULL,
    comment      TEXT NOT NULL,
    file_name    TEXT,
    file_size    INTEGER,
    UNIQUE (station_uuid, commit_uuid)
);

CREATE INDEX IF NOT EXISTS idx_commits_station ON commits (station_uuid, seq);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
