//! In-memory per-station commit logs.
//!
//! [`CommitStore`] is a cheaply clonable handle; every clone sees the same
//! logs. All mutations go through one mutex, reads return snapshot copies.
//! When backed by a [`Database`] each accepted commit is written through
//! before it becomes visible in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use uuid::Uuid;

use mvrx_shared::{Commit, StationUuid};

use crate::database::Database;
use crate::error::{Result, StoreError};

#[derive(Default)]
struct Inner {
    logs: HashMap<StationUuid, Vec<Commit>>,
    db: Option<Database>,
}

#[derive(Clone, Default)]
pub struct CommitStore {
    inner: Arc<Mutex<Inner>>,
}

impl CommitStore {
    /// A store with no persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store writing every append through to `db`.
    pub fn with_database(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                logs: HashMap::new(),
                db: Some(db),
            })),
        }
    }

    /// Restore every persisted log from `db` and keep writing through to it.
    pub fn load(db: Database) -> Result<Self> {
        let mut logs: HashMap<StationUuid, Vec<Commit>> = HashMap::new();
        let rows = db.load_commits()?;
        let total = rows.len();
        for (station, commit) in rows {
            logs.entry(station).or_default().push(commit);
        }
        info!(stations = logs.len(), commits = total, "Restored commit logs");

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { logs, db: Some(db) })),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Append `commit` to the log of `station`.
    ///
    /// A commit UUID already present in that log is rejected with
    /// [`StoreError::DuplicateCommit`] and leaves the log untouched.
    pub fn append(&self, station: StationUuid, commit: Commit) -> Result<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let known = inner
            .logs
            .get(&station)
            .is_some_and(|log| log.iter().any(|c| c.commit_uuid == commit.commit_uuid));
        if known {
            return Err(StoreError::DuplicateCommit(commit.commit_uuid));
        }

        if let Some(db) = inner.db.as_ref() {
            db.insert_commit(station, &commit)?;
        }

        debug!(station = %station, commit = %commit.commit_uuid, "Commit appended");
        inner.logs.entry(station).or_default().push(commit);
        Ok(())
    }

    /// Append every commit not yet known, in order. Returns the accepted ones.
    pub fn merge(&self, station: StationUuid, commits: impl IntoIterator<Item = Commit>) -> Result<Vec<Commit>> {
        let mut accepted = Vec::new();
        for commit in commits {
            match self.append(station, commit.clone()) {
                Ok(()) => accepted.push(commit),
                Err(StoreError::DuplicateCommit(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(accepted)
    }

    /// Snapshot of the log of `station`, in append order.
    pub fn log(&self, station: StationUuid) -> Vec<Commit> {
        match self.inner.lock() {
            Ok(guard) => guard.logs.get(&station).cloned().unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Clear the log of `station`, both in memory and on disk.
    pub fn reset(&self, station: StationUuid) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(db) = guard.db.as_ref() {
            db.delete_commits(station)?;
        }
        let removed = guard.logs.remove(&station).map(|l| l.len()).unwrap_or(0);
        info!(station = %station, removed, "Commit log reset");
        Ok(())
    }

    /// Stations with a non-empty log.
    pub fn stations(&self) -> Vec<StationUuid> {
        match self.inner.lock() {
            Ok(guard) => {
                let mut stations: Vec<_> = guard
                    .logs
                    .iter()
                    .filter(|(_, log)| !log.is_empty())
                    .map(|(s, _)| *s)
                    .collect();
                stations.sort();
                stations
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn contains(&self, station: StationUuid, commit_uuid: Uuid) -> bool {
        match self.inner.lock() {
            Ok(guard) => guard
                .logs
                .get(&station)
                .is_some_and(|log| log.iter().any(|c| c.commit_uuid == commit_uuid)),
            Err(_) => false,
        }
    }

    /// Find a commit by UUID in any log.
    pub fn find(&self, commit_uuid: Uuid) -> Option<(StationUuid, Commit)> {
        let guard = self.inner.lock().ok()?;
        guard.logs.iter().find_map(|(station, log)| {
            log.iter()
                .find(|c| c.commit_uuid == commit_uuid || c.file_uuid == commit_uuid)
                .map(|c| (*station, c.clone()))
        })
    }
}
