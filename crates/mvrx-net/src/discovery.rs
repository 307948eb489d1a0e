//! Static peer list loading.
//!
//! Discovery proper happens outside this crate; a plain peers file stands in
//! for it and seeds the [`PeerDirectory`](crate::peers::PeerDirectory) at
//! startup.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use tracing::{debug, info, warn};

use mvrx_shared::{PeerInfo, StationUuid};

/// Load peers from a configuration file.
///
/// One peer per line: `<station-uuid> <ip>:<port> [station name]`. Empty
/// lines and lines starting with `#` are ignored, malformed lines are logged
/// and skipped.
///
/// # Example file
///
/// ```text
/// # FOH desk and the dimmer room
/// 5d1e1c62-6a0e-4c55-9a63-0b3c3e6f2b10 192.168.1.20:4567 FOH
/// 9b7f4a1e-2c4d-4f7a-8a11-7e0d2f9c6b33 192.168.1.31:4567 Dimmer City
/// ```
pub fn load_peers_file(path: &Path) -> Vec<PeerInfo> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read peers file");
            return Vec::new();
        }
    };

    let peers: Vec<PeerInfo> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match parse_peer_line(line) {
            Ok(peer) => {
                debug!(station = %peer.station_uuid, addr = %peer.ip_address, port = peer.port, "Loaded peer");
                Some(peer)
            }
            Err(e) => {
                warn!(line = %line, error = %e, "Skipping invalid peer line");
                None
            }
        })
        .collect();

    info!(count = peers.len(), path = %path.display(), "Loaded peers file");
    peers
}

/// Parse a single `<station-uuid> <ip>:<port> [name]` entry.
pub fn parse_peer_line(line: &str) -> Result<PeerInfo, String> {
    let mut parts = line.split_whitespace();
    let station = parts.next().ok_or("empty line")?;
    let addr = parts.next().ok_or("missing address")?;

    let station = StationUuid::parse(station).map_err(|e| e.to_string())?;
    let addr: SocketAddr = addr.parse().map_err(|e| format!("invalid address '{addr}': {e}"))?;

    let mut peer = PeerInfo::new(station, addr);
    peer.station_name = parts.collect::<Vec<_>>().join(" ");
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_nonexistent_file() {
        let peers = load_peers_file(Path::new("/nonexistent/peers.txt"));
        assert!(peers.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("peers.txt");

        let mut f = fs::File::create(&file_path).unwrap();
        writeln!(f, "# show network").unwrap();
        writeln!(f, "5d1e1c62-6a0e-4c55-9a63-0b3c3e6f2b10 192.168.1.20:4567 FOH").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "not-a-uuid 192.168.1.21:4567").unwrap();
        writeln!(f, "00000000-0000-0000-0000-000000000000 192.168.1.22:4567").unwrap();
        writeln!(f, "9b7f4a1e-2c4d-4f7a-8a11-7e0d2f9c6b33 192.168.1.31:4600 Dimmer City").unwrap();
        writeln!(f, "9b7f4a1e-2c4d-4f7a-8a11-7e0d2f9c6b34").unwrap();
        drop(f);

        let peers = load_peers_file(&file_path);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].station_name, "FOH");
        assert_eq!(peers[1].station_name, "Dimmer City");
        assert_eq!(peers[1].port, 4600);
    }

    #[test]
    fn test_parse_peer_line_without_name() {
        let peer = parse_peer_line("5d1e1c62-6a0e-4c55-9a63-0b3c3e6f2b10 10.0.0.5:4567").unwrap();
        assert_eq!(peer.ip_address, "10.0.0.5");
        assert!(peer.station_name.is_empty());
        assert_eq!(peer.display_name(), "10.0.0.5");
    }
}
