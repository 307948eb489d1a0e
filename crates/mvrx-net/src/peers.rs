//! Known peer stations.
//!
//! Maps each station UUID to its last known address and metadata. Entries
//! are written by the peers file loader and by JOIN handshakes, refreshed on
//! every message from the peer, and evicted once unseen for too long. A peer
//! with an open session is pinned and never evicted, however quiet it is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use mvrx_shared::{PeerInfo, StationUuid};

#[derive(Debug, Clone)]
struct PeerEntry {
    info: PeerInfo,
    last_seen: Instant,
    /// Open sessions with this peer, inbound and outbound.
    sessions: usize,
}

/// Shared handle to the peer table. Reads return copies.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<Mutex<HashMap<StationUuid, PeerEntry>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Empty name/provider fields in `info` keep
    /// the previously known values.
    ///
    /// Returns `true` when the stored record changed.
    pub fn upsert(&self, info: PeerInfo) -> bool {
        if info.station_uuid.is_nil() {
            return false;
        }
        let Ok(mut peers) = self.peers.lock() else {
            return false;
        };
        let now = Instant::now();

        match peers.get_mut(&info.station_uuid) {
            Some(entry) => {
                let mut merged = info;
                if merged.station_name.is_empty() {
                    merged.station_name = entry.info.station_name.clone();
                }
                if merged.provider_name.is_empty() {
                    merged.provider_name = entry.info.provider_name.clone();
                }
                if merged.ip_address.is_empty() {
                    merged.ip_address = entry.info.ip_address.clone();
                    merged.port = entry.info.port;
                }
                entry.last_seen = now;
                if merged != entry.info {
                    debug!(station = %merged.station_uuid, addr = %merged.ip_address, "Peer updated");
                    entry.info = merged;
                    true
                } else {
                    false
                }
            }
            None => {
                debug!(station = %info.station_uuid, addr = %info.ip_address, "Tracking new peer");
                peers.insert(
                    info.station_uuid,
                    PeerEntry {
                        info,
                        last_seen: now,
                        sessions: 0,
                    },
                );
                true
            }
        }
    }

    /// Mark a peer as seen right now.
    pub fn touch(&self, station: StationUuid) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&station) {
                entry.last_seen = Instant::now();
            }
        }
    }

    /// Record an open session with `station`. Returns `false` for an unknown peer.
    pub fn pin(&self, station: StationUuid) -> bool {
        let Ok(mut peers) = self.peers.lock() else {
            return false;
        };
        match peers.get_mut(&station) {
            Some(entry) => {
                entry.sessions += 1;
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Release a session taken with [`pin`](Self::pin). The staleness clock
    /// restarts from now.
    pub fn unpin(&self, station: StationUuid) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&station) {
                entry.sessions = entry.sessions.saturating_sub(1);
                entry.last_seen = Instant::now();
            }
        }
    }

    pub fn get(&self, station: StationUuid) -> Option<PeerInfo> {
        self.peers.lock().ok()?.get(&station).map(|e| e.info.clone())
    }

    pub fn remove(&self, station: StationUuid) -> Option<PeerInfo> {
        let removed = self.peers.lock().ok()?.remove(&station).map(|e| e.info);
        if removed.is_some() {
            debug!(station = %station, "Removed peer from directory");
        }
        removed
    }

    /// All known peers, ordered by station UUID.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let Ok(peers) = self.peers.lock() else {
            return Vec::new();
        };
        let mut out: Vec<PeerInfo> = peers.values().map(|e| e.info.clone()).collect();
        out.sort_by_key(|p| p.station_uuid);
        out
    }

    /// Drop every unpinned peer not seen within `max_age`. Returns the evicted peers.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<PeerInfo> {
        let Ok(mut peers) = self.peers.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let stale: Vec<StationUuid> = peers
            .iter()
            .filter(|(_, e)| e.sessions == 0 && now.duration_since(e.last_seen) > max_age)
            .map(|(s, _)| *s)
            .collect();

        stale
            .into_iter()
            .filter_map(|s| peers.remove(&s))
            .map(|e| {
                debug!(station = %e.info.station_uuid, "Evicted stale peer");
                e.info
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerInfo {
        let mut info = PeerInfo::new(StationUuid::generate(), "192.168.1.20:4567".parse().unwrap());
        info.station_name = name.to_string();
        info
    }

    #[test]
    fn test_upsert_and_get() {
        let dir = PeerDirectory::new();
        let p = peer("FOH");

        assert!(dir.upsert(p.clone()));
        assert!(!dir.upsert(p.clone()));
        assert_eq!(dir.get(p.station_uuid), Some(p.clone()));
        assert_eq!(dir.len(), 1);

        assert_eq!(dir.remove(p.station_uuid), Some(p));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_upsert_keeps_known_metadata() {
        let dir = PeerDirectory::new();
        let mut p = peer("Dimmer City");
        p.provider_name = "vendor-x".into();
        dir.upsert(p.clone());

        let mut sparse = PeerInfo::new(p.station_uuid, "192.168.1.21:4568".parse().unwrap());
        sparse.station_name.clear();
        assert!(dir.upsert(sparse));

        let stored = dir.get(p.station_uuid).unwrap();
        assert_eq!(stored.station_name, "Dimmer City");
        assert_eq!(stored.provider_name, "vendor-x");
        assert_eq!(stored.ip_address, "192.168.1.21");
        assert_eq!(stored.port, 4568);
    }

    #[test]
    fn test_nil_station_ignored() {
        let dir = PeerDirectory::new();
        let p = PeerInfo::new(StationUuid(uuid::Uuid::nil()), "10.0.0.1:4567".parse().unwrap());
        assert!(!dir.upsert(p));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_evict_stale() {
        let dir = PeerDirectory::new();
        let old = peer("old");
        let fresh = peer("fresh");
        dir.upsert(old.clone());
        std::thread::sleep(Duration::from_millis(80));
        dir.upsert(fresh.clone());

        let evicted = dir.evict_stale(Duration::from_millis(40));
        assert_eq!(evicted, vec![old]);
        assert_eq!(dir.snapshot(), vec![fresh.clone()]);

        dir.touch(fresh.station_uuid);
        assert!(dir.evict_stale(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_pinned_peer_survives_eviction() {
        let dir = PeerDirectory::new();
        let joined = peer("joined");
        dir.upsert(joined.clone());
        assert!(dir.pin(joined.station_uuid));
        assert!(!dir.pin(StationUuid::generate()));

        std::thread::sleep(Duration::from_millis(60));
        assert!(dir.evict_stale(Duration::from_millis(20)).is_empty());

        // Released sessions age from the moment they closed.
        dir.unpin(joined.station_uuid);
        assert!(dir.evict_stale(Duration::from_millis(20)).is_empty());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(dir.evict_stale(Duration::from_millis(20)), vec![joined]);
    }
}
