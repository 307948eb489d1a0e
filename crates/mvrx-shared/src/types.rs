use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MvrxError;

/// Persistent identifier of a station. The nil UUID is reserved as "unset"
/// and never identifies a real station.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StationUuid(pub Uuid);

impl StationUuid {
    /// Generate a fresh random identifier (v4, never nil).
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(uuid: Uuid) -> Result<Self, MvrxError> {
        if uuid.is_nil() {
            return Err(MvrxError::InvalidStation("nil UUID is reserved".into()));
        }
        Ok(Self(uuid))
    }

    pub fn parse(s: &str) -> Result<Self, MvrxError> {
        let uuid = Uuid::parse_str(s.trim()).map_err(|e| MvrxError::InvalidStation(e.to_string()))?;
        Self::new(uuid)
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl std::fmt::Display for StationUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One published edit of a station's show. Immutable once created.
///
/// MVR-xchange peers identify a commit by its file only; when `CommitUUID` is
/// absent on the wire, the file UUID doubles as the commit UUID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawCommit")]
pub struct Commit {
    #[serde(rename = "CommitUUID")]
    pub commit_uuid: Uuid,
    #[serde(rename = "FileUUID")]
    pub file_uuid: Uuid,
    /// May be nil while still attached to a message; see
    /// [`crate::protocol::WireMessage::commits`].
    #[serde(rename = "StationUUID")]
    pub station_uuid: StationUuid,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Comment")]
    pub comment: String,
    #[serde(rename = "FileName", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(rename = "FileSize", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl Commit {
    /// A single-file commit created by this station right now.
    pub fn new_local(station_uuid: StationUuid, comment: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            commit_uuid: id,
            file_uuid: id,
            station_uuid,
            timestamp: Utc::now(),
            comment: comment.into(),
            file_name: None,
            file_size: None,
        }
    }

    pub fn with_file(mut self, file_name: impl Into<String>, file_size: u64) -> Self {
        self.file_name = Some(file_name.into());
        self.file_size = Some(file_size);
        self
    }
}

#[derive(Deserialize)]
struct RawCommit {
    #[serde(rename = "CommitUUID")]
    commit_uuid: Option<Uuid>,
    #[serde(rename = "FileUUID")]
    file_uuid: Option<Uuid>,
    #[serde(rename = "StationUUID")]
    station_uuid: Option<Uuid>,
    #[serde(rename = "Timestamp")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "Comment", default)]
    comment: String,
    #[serde(rename = "FileName")]
    file_name: Option<String>,
    #[serde(rename = "FileSize")]
    file_size: Option<u64>,
}

impl TryFrom<RawCommit> for Commit {
    type Error = String;

    fn try_from(raw: RawCommit) -> Result<Self, Self::Error> {
        let commit_uuid = raw
            .commit_uuid
            .or(raw.file_uuid)
            .ok_or_else(|| "commit carries neither CommitUUID nor FileUUID".to_string())?;
        Ok(Self {
            commit_uuid,
            file_uuid: raw.file_uuid.unwrap_or(commit_uuid),
            station_uuid: StationUuid(raw.station_uuid.unwrap_or_else(Uuid::nil)),
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            comment: raw.comment,
            file_name: raw.file_name,
            file_size: raw.file_size,
        })
    }
}

/// A reachable peer station as known to this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub station_uuid: StationUuid,
    pub station_name: String,
    pub ip_address: String,
    pub port: u16,
    /// Software implementation of the peer; informational only.
    pub provider_name: String,
}

impl PeerInfo {
    pub fn new(station_uuid: StationUuid, addr: SocketAddr) -> Self {
        Self {
            station_uuid,
            station_name: String::new(),
            ip_address: addr.ip().to_string(),
            port: addr.port(),
            provider_name: String::new(),
        }
    }

    /// Resolve the peer's transport address.
    pub fn socket_addr(&self) -> Result<SocketAddr, MvrxError> {
        let ip = self.ip_address.trim();
        if ip.is_empty() {
            return Err(MvrxError::protocol("peer has no address"));
        }
        let ip: IpAddr = ip
            .parse()
            .map_err(|e| MvrxError::protocol(format!("invalid peer address '{ip}': {e}")))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn display_name(&self) -> &str {
        if self.station_name.is_empty() {
            &self.ip_address
        } else {
            &self.station_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_station_uuid_is_not_nil() {
        for _ in 0..64 {
            assert!(!StationUuid::generate().is_nil());
        }
    }

    #[test]
    fn test_nil_station_uuid_rejected() {
        assert!(StationUuid::new(Uuid::nil()).is_err());
        assert!(StationUuid::parse("00000000-0000-0000-0000-000000000000").is_err());
        assert!(StationUuid::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_commit_without_commit_uuid_uses_file_uuid() {
        let json = r#"{"FileUUID":"6e4ca7a0-41a1-4b6f-a7f5-0ec2b5e0f3aa","Comment":"stage left"}"#;
        let commit: Commit = serde_json::from_str(json).unwrap();
        assert_eq!(commit.commit_uuid, commit.file_uuid);
        assert_eq!(commit.comment, "stage left");
        assert!(commit.station_uuid.is_nil());
    }

    #[test]
    fn test_commit_without_any_uuid_rejected() {
        let json = r#"{"Comment":"orphan"}"#;
        assert!(serde_json::from_str::<Commit>(json).is_err());
    }

    #[test]
    fn test_peer_socket_addr() {
        let mut peer = PeerInfo::new(StationUuid::generate(), "10.0.0.7:4567".parse().unwrap());
        assert_eq!(peer.socket_addr().unwrap().port(), 4567);

        peer.ip_address = String::new();
        assert!(peer.socket_addr().is_err());
    }
}
