//! Scene file downloads.
//!
//! Every download runs in its own task over a dedicated connection to the
//! source station: it sends `MVR_FILE_REQUEST` and expects either a file
//! packet or a refusal. Bytes go to `<commit_uuid>.mvr.part` and are renamed
//! into place only once the full payload arrived. Requests are keyed by
//! commit UUID so concurrent requests for one commit share a single download.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mvrx_shared::constants::{DEFAULT_MAX_FILE_SIZE, SCENE_EXTENSION};
use mvrx_shared::{Commit, MessageKind, StationUuid, WireMessage};

use crate::codec::{self, Frame};
use crate::error::NetError;
use crate::events::{EventBridge, StationEvent};

/// Identifies the session that started a transfer.
pub type SessionId = u64;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Directory holding downloaded and published scene files.
    pub artifact_dir: PathBuf,
    /// Zero leaves the connect deadline to the OS.
    pub connect_timeout: Duration,
    pub max_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("artifacts"),
            connect_timeout: Duration::from_secs(5),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Snapshot of one tracked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferRequest {
    pub commit_uuid: Uuid,
    pub target_path: PathBuf,
    pub status: TransferStatus,
}

/// Observer for one request. Clones observe the same transfer.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    commit_uuid: Uuid,
    target_path: PathBuf,
    status: watch::Receiver<TransferStatus>,
}

impl TransferHandle {
    pub fn commit_uuid(&self) -> Uuid {
        self.commit_uuid
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.borrow()
    }

    /// Wait until the transfer is Completed or Failed.
    pub async fn wait(&mut self) -> TransferStatus {
        let _ = self.status.wait_for(|s| s.is_finished()).await;
        *self.status.borrow()
    }

    /// Wait for a new status value. `None` once the transfer task is gone.
    pub async fn changed(&mut self) -> Option<TransferStatus> {
        self.status.changed().await.ok()?;
        Some(*self.status.borrow_and_update())
    }
}

struct Entry {
    generation: u64,
    target_path: PathBuf,
    owner: Option<SessionId>,
    status: watch::Receiver<TransferStatus>,
    cancel: watch::Sender<bool>,
    finished_at: Option<Instant>,
}

struct Inner {
    config: TransferConfig,
    local: StationUuid,
    events: EventBridge,
    entries: Mutex<HashMap<Uuid, Entry>>,
    generation: AtomicU64,
    started: AtomicU64,
}

/// Tracks outstanding downloads. Cheap to clone.
#[derive(Clone)]
pub struct FileTransferManager {
    inner: Arc<Inner>,
}

impl FileTransferManager {
    pub fn new(config: TransferConfig, local: StationUuid, events: EventBridge) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                local,
                events,
                entries: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
                started: AtomicU64::new(0),
            }),
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.inner.config.artifact_dir
    }

    /// Where the artifact for `commit_uuid` lives once downloaded or published.
    pub fn path_for(&self, commit_uuid: Uuid) -> PathBuf {
        self.inner
            .config
            .artifact_dir
            .join(format!("{commit_uuid}.{SCENE_EXTENSION}"))
    }

    fn part_path_for(&self, commit_uuid: Uuid) -> PathBuf {
        self.inner
            .config
            .artifact_dir
            .join(format!("{commit_uuid}.{SCENE_EXTENSION}.part"))
    }

    /// Download the artifact of `commit` from the station listening at `source`.
    ///
    /// Returns the existing handle while a request for the same commit is
    /// still Pending or InFlight. A finished request is replaced by a fresh one.
    pub fn request(&self, commit: &Commit, source: SocketAddr, owner: Option<SessionId>) -> TransferHandle {
        let commit_uuid = commit.commit_uuid;
        let target_path = self.path_for(commit_uuid);

        let Ok(mut entries) = self.inner.entries.lock() else {
            // Poisoned table, nothing can be tracked.
            let (_tx, status) = watch::channel(TransferStatus::Failed);
            return TransferHandle {
                commit_uuid,
                target_path,
                status,
            };
        };

        if let Some(entry) = entries.get(&commit_uuid) {
            if !entry.status.borrow().is_finished() {
                debug!(commit = %commit_uuid, "Transfer already outstanding, coalescing");
                return TransferHandle {
                    commit_uuid,
                    target_path: entry.target_path.clone(),
                    status: entry.status.clone(),
                };
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (status_tx, status_rx) = watch::channel(TransferStatus::Pending);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        entries.insert(
            commit_uuid,
            Entry {
                generation,
                target_path: target_path.clone(),
                owner,
                status: status_rx.clone(),
                cancel: cancel_tx,
                finished_at: None,
            },
        );
        drop(entries);

        debug!(commit = %commit_uuid, source = %source, "Transfer requested");

        let job = Job {
            manager: self.clone(),
            generation,
            commit_uuid,
            file_uuid: commit.file_uuid,
            source,
            target_path: target_path.clone(),
            part_path: self.part_path_for(commit_uuid),
        };
        tokio::spawn(job.run(status_tx, cancel_rx));

        TransferHandle {
            commit_uuid,
            target_path,
            status: status_rx,
        }
    }

    pub fn status(&self, commit_uuid: Uuid) -> Option<TransferStatus> {
        let entries = self.inner.entries.lock().ok()?;
        entries.get(&commit_uuid).map(|e| *e.status.borrow())
    }

    /// Snapshot of every tracked request.
    pub fn requests(&self) -> Vec<FileTransferRequest> {
        let Ok(entries) = self.inner.entries.lock() else {
            return Vec::new();
        };
        entries
            .iter()
            .map(|(uuid, e)| FileTransferRequest {
                commit_uuid: *uuid,
                target_path: e.target_path.clone(),
                status: *e.status.borrow(),
            })
            .collect()
    }

    /// Abort an outstanding transfer. Returns `false` if none was running.
    pub fn cancel(&self, commit_uuid: Uuid) -> bool {
        let Ok(entries) = self.inner.entries.lock() else {
            return false;
        };
        match entries.get(&commit_uuid) {
            Some(e) if !e.status.borrow().is_finished() => {
                let _ = e.cancel.send(true);
                true
            }
            _ => false,
        }
    }

    /// Abort every outstanding transfer started by `owner`.
    pub fn cancel_owned_by(&self, owner: SessionId) -> usize {
        let Ok(entries) = self.inner.entries.lock() else {
            return 0;
        };
        let mut cancelled = 0;
        for (uuid, e) in entries.iter() {
            if e.owner == Some(owner) && !e.status.borrow().is_finished() {
                debug!(commit = %uuid, session = owner, "Cancelling transfer");
                let _ = e.cancel.send(true);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Forget requests that finished more than `max_age` ago.
    pub fn purge_finished(&self, max_age: Duration) -> usize {
        let Ok(mut entries) = self.inner.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| match e.finished_at {
            Some(at) => at.elapsed() <= max_age,
            None => true,
        });
        before - entries.len()
    }

    /// Number of downloads that actually went to the network.
    pub fn transfers_started(&self) -> u64 {
        self.inner.started.load(Ordering::Relaxed)
    }

    fn mark_finished(&self, commit_uuid: Uuid, generation: u64) {
        if let Ok(mut entries) = self.inner.entries.lock() {
            if let Some(e) = entries.get_mut(&commit_uuid) {
                if e.generation == generation {
                    e.finished_at = Some(Instant::now());
                }
            }
        }
    }
}

struct Job {
    manager: FileTransferManager,
    generation: u64,
    commit_uuid: Uuid,
    file_uuid: Uuid,
    source: SocketAddr,
    target_path: PathBuf,
    part_path: PathBuf,
}

impl Job {
    async fn run(self, status: watch::Sender<TransferStatus>, cancel: watch::Receiver<bool>) {
        status.send_replace(TransferStatus::InFlight);
        self.manager.inner.started.fetch_add(1, Ordering::Relaxed);

        let outcome = tokio::select! {
            res = self.fetch() => res,
            _ = cancelled(cancel) => Err(NetError::FileTransfer("cancelled".into())),
        };
        // Once the payload is on disk a cancel no longer applies.
        let outcome = match outcome {
            Ok(bytes) => tokio::fs::rename(&self.part_path, &self.target_path)
                .await
                .map(|_| bytes)
                .map_err(NetError::from),
            Err(e) => Err(e),
        };

        let events = &self.manager.inner.events;
        match outcome {
            Ok(bytes) => {
                info!(commit = %self.commit_uuid, bytes, path = %self.target_path.display(), "Scene file downloaded");
                self.manager.mark_finished(self.commit_uuid, self.generation);
                status.send_replace(TransferStatus::Completed);
                events.emit(StationEvent::FileDownloaded {
                    commit_uuid: self.commit_uuid,
                    path: self.target_path.clone(),
                });
            }
            Err(e) => {
                warn!(commit = %self.commit_uuid, source = %self.source, error = %e, "Scene file download failed");
                if let Err(rm) = tokio::fs::remove_file(&self.part_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %self.part_path.display(), error = %rm, "Failed to remove partial file");
                    }
                }
                self.manager.mark_finished(self.commit_uuid, self.generation);
                status.send_replace(TransferStatus::Failed);
                events.emit(StationEvent::TransferFailed {
                    commit_uuid: self.commit_uuid,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn fetch(&self) -> Result<u64, NetError> {
        let config = &self.manager.inner.config;
        tokio::fs::create_dir_all(&config.artifact_dir).await?;

        let stream = codec::connect(self.source, config.connect_timeout).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = WireMessage::new(MessageKind::FileRequest, self.manager.inner.local).with_file(self.file_uuid);
        codec::write_message(&mut write_half, &request).await?;

        loop {
            match codec::read_frame(&mut reader).await? {
                None => {
                    return Err(NetError::FileTransfer("connection closed before the file arrived".into()));
                }
                Some(Frame::File(len)) => {
                    if len > config.max_file_size {
                        return Err(NetError::FileTransfer(format!(
                            "file of {len} bytes exceeds the {} byte limit",
                            config.max_file_size
                        )));
                    }
                    codec::receive_file(&mut reader, len, &self.part_path).await?;
                    return Ok(len);
                }
                Some(Frame::Message(msg)) if msg.kind == MessageKind::FileRequestRet && !msg.is_ok() => {
                    let reason = msg.message.unwrap_or_else(|| "request refused".into());
                    return Err(NetError::FileTransfer(reason));
                }
                Some(Frame::Message(msg)) => {
                    debug!(kind = ?msg.kind, "Ignoring message on transfer connection");
                }
                Some(Frame::Malformed(e)) => {
                    warn!(source = %self.source, error = %e, "Malformed message on transfer connection");
                }
            }
        }
    }
}

/// Resolves once the cancel flag is raised; never if its sender is gone.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    let raised = cancel.wait_for(|c| *c).await.is_ok();
    if !raised {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;
    use mvrx_shared::constants::PACKET_HEADER_LEN;
    use mvrx_shared::protocol::PacketHeader;
    use mvrx_shared::PayloadKind;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn manager(dir: &Path) -> (FileTransferManager, crate::events::EventStream) {
        let (events, stream) = EventBridge::new();
        let config = TransferConfig {
            artifact_dir: dir.join("artifacts"),
            connect_timeout: Duration::from_secs(2),
            ..TransferConfig::default()
        };
        (FileTransferManager::new(config, StationUuid::generate(), events), stream)
    }

    /// A source that answers the request with a header promising `promised`
    /// bytes, sends `sent` of them, then waits for `release` before closing.
    async fn truncating_source(
        promised: u64,
        sent: usize,
        release: tokio::sync::oneshot::Receiver<()>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _request = codec::read_frame(&mut reader).await.unwrap();

            let mut header = BytesMut::with_capacity(PACKET_HEADER_LEN);
            PacketHeader::new(PayloadKind::File, promised).encode(&mut header);
            write_half.write_all(&header).await.unwrap();
            write_half.write_all(&vec![0x42; sent]).await.unwrap();
            write_half.flush().await.unwrap();
            let _ = release.await;
        });
        addr
    }

    /// A source that answers the request with the whole of `payload`.
    async fn complete_source(payload: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _request = codec::read_frame(&mut reader).await.unwrap();

            let mut header = BytesMut::with_capacity(PACKET_HEADER_LEN);
            PacketHeader::new(PayloadKind::File, payload.len() as u64).encode(&mut header);
            let _ = write_half.write_all(&header).await;
            let _ = write_half.write_all(&payload).await;
            let _ = write_half.flush().await;
        });
        addr
    }

    #[tokio::test]
    async fn test_cancel_near_completion_is_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, _events) = manager(dir.path());

        for round in 0..24u64 {
            let source = complete_source(vec![0x5a; 2048]).await;
            let commit = Commit::new_local(StationUuid::generate(), "racing");
            let mut handle = transfers.request(&commit, source, Some(round));
            for _ in 0..round % 8 {
                tokio::task::yield_now().await;
            }
            transfers.cancel_owned_by(round);

            let status = handle.wait().await;
            let target = transfers.path_for(commit.commit_uuid);
            match status {
                TransferStatus::Completed => {
                    assert_eq!(tokio::fs::read(&target).await.unwrap().len(), 2048);
                }
                TransferStatus::Failed => assert!(!target.exists(), "round {round} left a file behind"),
                other => panic!("unfinished status {other:?}"),
            }
            assert!(!transfers.part_path_for(commit.commit_uuid).exists());
        }
    }

    #[tokio::test]
    async fn test_truncated_transfer_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, mut events) = manager(dir.path());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let source = truncating_source(1000, 100, release_rx).await;

        let commit = Commit::new_local(StationUuid::generate(), "truncated");
        let mut handle = transfers.request(&commit, source, None);
        drop(release_tx);

        assert_eq!(handle.wait().await, TransferStatus::Failed);
        assert!(!transfers.path_for(commit.commit_uuid).exists());
        assert!(!transfers.part_path_for(commit.commit_uuid).exists());

        match events.recv_timeout(Duration::from_secs(2)).await {
            Some(StationEvent::TransferFailed { commit_uuid, .. }) => assert_eq!(commit_uuid, commit.commit_uuid),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.recv_timeout(Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_owned_by_aborts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, mut events) = manager(dir.path());
        let (_release_tx, release_rx) = tokio::sync::oneshot::channel();
        let source = truncating_source(1_000_000, 4096, release_rx).await;

        let commit = Commit::new_local(StationUuid::generate(), "stalled");
        let mut handle = transfers.request(&commit, source, Some(7));

        // Wait until part of the payload has been written.
        let part = transfers.part_path_for(commit.commit_uuid);
        for _ in 0..100 {
            if part.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.status(), TransferStatus::InFlight);

        assert_eq!(transfers.cancel_owned_by(8), 0);
        assert_eq!(transfers.cancel_owned_by(7), 1);
        assert_eq!(handle.wait().await, TransferStatus::Failed);
        assert!(!part.exists());
        assert!(!transfers.path_for(commit.commit_uuid).exists());

        assert!(matches!(
            events.recv_timeout(Duration::from_secs(2)).await,
            Some(StationEvent::TransferFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_once() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, mut events) = manager(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let source = listener.local_addr().unwrap();
        drop(listener);

        let commit = Commit::new_local(StationUuid::generate(), "nobody home");
        let mut first = transfers.request(&commit, source, None);
        let mut second = transfers.request(&commit, source, None);

        assert_eq!(first.wait().await, TransferStatus::Failed);
        assert_eq!(second.wait().await, TransferStatus::Failed);
        assert_eq!(transfers.transfers_started(), 1);
        assert_eq!(transfers.status(commit.commit_uuid), Some(TransferStatus::Failed));

        assert!(matches!(
            events.recv_timeout(Duration::from_secs(2)).await,
            Some(StationEvent::TransferFailed { .. })
        ));
        assert!(events.recv_timeout(Duration::from_millis(100)).await.is_none());

        // A finished request can be retried with a fresh one.
        let mut retry = transfers.request(&commit, source, None);
        assert_eq!(retry.wait().await, TransferStatus::Failed);
        assert_eq!(transfers.transfers_started(), 2);
    }

    #[tokio::test]
    async fn test_purge_finished() {
        let dir = tempfile::tempdir().unwrap();
        let (transfers, _events) = manager(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let source = listener.local_addr().unwrap();
        drop(listener);

        let commit = Commit::new_local(StationUuid::generate(), "short lived");
        let mut handle = transfers.request(&commit, source, None);
        handle.wait().await;

        assert_eq!(transfers.purge_finished(Duration::from_secs(60)), 0);
        assert_eq!(transfers.requests().len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transfers.purge_finished(Duration::from_millis(5)), 1);
        assert!(transfers.status(commit.commit_uuid).is_none());
    }
}
