//! Notifications flowing from the network tasks to the host.
//!
//! Every producer holds a clone of the [`EventBridge`]; the host owns the
//! single [`EventStream`]. Events from one producer arrive in the order they
//! were emitted. Emission never blocks a network task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use mvrx_shared::{Commit, PeerInfo, StationUuid};

/// A user-meaningful outcome of network activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    PeerUpdated(PeerInfo),
    /// New commits accepted into the log of `station`.
    CommitsReceived {
        station: StationUuid,
        commits: Vec<Commit>,
    },
    /// Outcome of an outbound JOIN.
    JoinResult {
        station: Option<StationUuid>,
        ok: bool,
        message: Option<String>,
    },
    FileDownloaded {
        commit_uuid: Uuid,
        path: PathBuf,
    },
    TransferFailed {
        commit_uuid: Uuid,
        reason: String,
    },
    /// An established session ended without a local LEAVE or stop.
    ConnectionLost {
        station: Option<StationUuid>,
    },
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBridge {
    tx: mpsc::UnboundedSender<StationEvent>,
}

impl EventBridge {
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, EventStream { rx })
    }

    pub fn emit(&self, event: StationEvent) {
        trace!(event = ?event, "Emitting station event");
        if self.tx.send(event).is_err() {
            debug!("Event stream dropped, discarding event");
        }
    }
}

/// Callbacks the host application provides.
///
/// Newly downloaded scene files are first reported through
/// [`on_file_downloaded`](Self::on_file_downloaded) and then handed to
/// [`import_scene`](Self::import_scene).
pub trait HostApplication {
    fn on_commits_received(&mut self, station: StationUuid, commits: &[Commit]);

    fn on_peer_updated(&mut self, peer: &PeerInfo);

    fn on_file_downloaded(&mut self, path: &Path);

    fn import_scene(&mut self, path: &Path);

    fn on_join_result(&mut self, _station: Option<StationUuid>, _ok: bool, _message: Option<&str>) {}

    fn on_connection_lost(&mut self, _station: Option<StationUuid>) {}

    fn on_transfer_failed(&mut self, _commit_uuid: Uuid, _reason: &str) {}
}

/// Consumer side, owned by the host.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<StationEvent>,
}

impl EventStream {
    /// Wait for the next event. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<StationEvent> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<StationEvent> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    pub fn try_recv(&mut self) -> Option<StationEvent> {
        self.rx.try_recv().ok()
    }

    /// Deliver events to `host` until every producer is gone.
    pub async fn dispatch<H: HostApplication>(mut self, host: &mut H) {
        while let Some(event) = self.rx.recv().await {
            deliver(host, event);
        }
        debug!("Event stream closed");
    }

    /// Deliver whatever is queued right now. Returns the number of events.
    pub fn drain<H: HostApplication>(&mut self, host: &mut H) -> usize {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            deliver(host, event);
            count += 1;
        }
        count
    }
}

fn deliver<H: HostApplication>(host: &mut H, event: StationEvent) {
    match event {
        StationEvent::PeerUpdated(peer) => host.on_peer_updated(&peer),
        StationEvent::CommitsReceived { station, commits } => host.on_commits_received(station, &commits),
        StationEvent::JoinResult { station, ok, message } => host.on_join_result(station, ok, message.as_deref()),
        StationEvent::FileDownloaded { path, .. } => {
            host.on_file_downloaded(&path);
            host.import_scene(&path);
        }
        StationEvent::TransferFailed { commit_uuid, reason } => host.on_transfer_failed(commit_uuid, &reason),
        StationEvent::ConnectionLost { station } => host.on_connection_lost(station),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHost {
        calls: Vec<String>,
    }

    impl HostApplication for RecordingHost {
        fn on_commits_received(&mut self, _station: StationUuid, commits: &[Commit]) {
            self.calls.push(format!("commits:{}", commits.len()));
        }

        fn on_peer_updated(&mut self, peer: &PeerInfo) {
            self.calls.push(format!("peer:{}", peer.station_name));
        }

        fn on_file_downloaded(&mut self, path: &Path) {
            self.calls.push(format!("downloaded:{}", path.display()));
        }

        fn import_scene(&mut self, path: &Path) {
            self.calls.push(format!("import:{}", path.display()));
        }
    }

    #[tokio::test]
    async fn test_dispatch_preserves_producer_order() {
        let (bridge, stream) = EventBridge::new();
        let station = StationUuid::generate();
        let mut peer = PeerInfo::new(station, "10.0.0.2:4567".parse().unwrap());
        peer.station_name = "FOH".into();

        bridge.emit(StationEvent::PeerUpdated(peer));
        bridge.emit(StationEvent::CommitsReceived {
            station,
            commits: vec![Commit::new_local(station, "a"), Commit::new_local(station, "b")],
        });
        bridge.emit(StationEvent::FileDownloaded {
            commit_uuid: Uuid::new_v4(),
            path: PathBuf::from("/tmp/x.mvr"),
        });
        drop(bridge);

        let mut host = RecordingHost::default();
        stream.dispatch(&mut host).await;
        assert_eq!(
            host.calls,
            vec!["peer:FOH", "commits:2", "downloaded:/tmp/x.mvr", "import:/tmp/x.mvr"]
        );
    }

    #[tokio::test]
    async fn test_drain_is_non_blocking() {
        let (bridge, mut stream) = EventBridge::new();
        let mut host = RecordingHost::default();
        assert_eq!(stream.drain(&mut host), 0);

        bridge.emit(StationEvent::ConnectionLost { station: None });
        assert_eq!(stream.drain(&mut host), 1);
        assert!(host.calls.is_empty());
    }

    #[test]
    fn test_emit_after_stream_dropped_is_harmless() {
        let (bridge, stream) = EventBridge::new();
        drop(stream);
        bridge.emit(StationEvent::ConnectionLost { station: None });
    }
}
