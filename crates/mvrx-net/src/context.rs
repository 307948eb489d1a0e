//! Everything a client or server needs from the local station.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mvrx_shared::constants::DEFAULT_PROVIDER;
use mvrx_shared::{Commit, StationUuid};
use mvrx_store::{CommitStore, StationIdentity};

use crate::events::{EventBridge, EventStream};
use crate::peers::PeerDirectory;
use crate::transfer::{FileTransferManager, SessionId, TransferConfig};

/// Shared handles of one station. Cloning is cheap and every clone sees the
/// same stores.
#[derive(Clone)]
pub struct StationContext {
    pub identity: StationIdentity,
    pub station_name: String,
    pub provider: String,
    pub commits: CommitStore,
    pub peers: PeerDirectory,
    pub transfers: FileTransferManager,
    pub events: EventBridge,
    sessions: Arc<AtomicU64>,
}

impl StationContext {
    /// Build a context and the event stream the host drains.
    pub fn new(
        identity: StationIdentity,
        station_name: impl Into<String>,
        commits: CommitStore,
        transfer_config: TransferConfig,
    ) -> (Self, EventStream) {
        let (events, stream) = EventBridge::new();
        let transfers = FileTransferManager::new(transfer_config, identity.station_uuid(), events.clone());
        let ctx = Self {
            identity,
            station_name: station_name.into(),
            provider: DEFAULT_PROVIDER.to_string(),
            commits,
            peers: PeerDirectory::new(),
            transfers,
            events,
            sessions: Arc::new(AtomicU64::new(1)),
        };
        (ctx, stream)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn station_uuid(&self) -> StationUuid {
        self.identity.station_uuid()
    }

    /// This station's own commit log.
    pub fn local_log(&self) -> Vec<Commit> {
        self.commits.log(self.station_uuid())
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.sessions.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::events::StationEvent;

    pub fn context(dir: &Path, name: &str) -> (StationContext, EventStream) {
        let config = TransferConfig {
            artifact_dir: dir.join(name).join("artifacts"),
            connect_timeout: Duration::from_secs(2),
            ..TransferConfig::default()
        };
        StationContext::new(StationIdentity::ephemeral(), name, CommitStore::new(), config)
    }

    /// Collect events until none arrives for `quiet`.
    pub async fn collect(stream: &mut EventStream, quiet: Duration) -> Vec<StationEvent> {
        let mut out = Vec::new();
        while let Some(event) = stream.recv_timeout(quiet).await {
            out.push(event);
        }
        out
    }

    /// Wait for the first event matching `pred`, discarding others.
    pub async fn wait_for<F>(stream: &mut EventStream, timeout: Duration, mut pred: F) -> Option<StationEvent>
    where
        F: FnMut(&StationEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = stream.recv_timeout(remaining).await?;
            if pred(&event) {
                return Some(event);
            }
        }
    }
}
