//! Host bridge of the headless station: station events become log lines, and
//! the most recent scene is kept as the "loaded" one.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use mvrx_net::HostApplication;
use mvrx_shared::{Commit, PeerInfo, StationUuid};

#[derive(Debug, Default)]
pub struct LoggingHost {
    current_scene: Option<PathBuf>,
    commits_seen: usize,
}

impl LoggingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_scene(&self) -> Option<&Path> {
        self.current_scene.as_deref()
    }
}

impl HostApplication for LoggingHost {
    fn on_commits_received(&mut self, station: StationUuid, commits: &[Commit]) {
        self.commits_seen += commits.len();
        for commit in commits {
            info!(
                station = %station,
                commit = %commit.commit_uuid,
                comment = %commit.comment,
                "New commit"
            );
        }
    }

    fn on_peer_updated(&mut self, peer: &PeerInfo) {
        info!(
            station = %peer.station_uuid,
            name = %peer.display_name(),
            addr = %format!("{}:{}", peer.ip_address, peer.port),
            "Peer updated"
        );
    }

    fn on_file_downloaded(&mut self, path: &Path) {
        info!(path = %path.display(), "Scene file downloaded");
    }

    fn import_scene(&mut self, path: &Path) {
        info!(path = %path.display(), "Scene loaded");
        self.current_scene = Some(path.to_path_buf());
    }

    fn on_join_result(&mut self, station: Option<StationUuid>, ok: bool, message: Option<&str>) {
        if ok {
            info!(station = ?station, "Joined station");
        } else {
            warn!(station = ?station, reason = message.unwrap_or("unknown"), "Join rejected");
        }
    }

    fn on_connection_lost(&mut self, station: Option<StationUuid>) {
        warn!(station = ?station, "Connection to station lost");
    }

    fn on_transfer_failed(&mut self, commit_uuid: Uuid, reason: &str) {
        warn!(commit = %commit_uuid, reason, "Scene download failed");
    }
}
