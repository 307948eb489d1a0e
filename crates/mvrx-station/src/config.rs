//! Station configuration loaded from environment variables.
//!
//! Every setting has a default so a station starts with zero configuration on
//! a show network.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mvrx_net::{ClientConfig, ServerConfig, TransferConfig};
use mvrx_shared::constants::{
    DEFAULT_MAX_FILE_SIZE, DEFAULT_PEER_STALE_SECS, DEFAULT_PROVIDER, DEFAULT_STATION_PORT,
    DEFAULT_TRANSFER_RETENTION_SECS,
};
use mvrx_shared::StationUuid;

#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Env: `STATION_NAME`
    pub station_name: String,

    /// Env: `PROVIDER`
    pub provider: String,

    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:4567`
    pub listen_addr: SocketAddr,

    /// Directory holding the database and the scene artifacts.
    /// Env: `DATA_DIR`
    /// Default: the platform data directory.
    pub data_dir: Option<PathBuf>,

    /// Env: `PEERS_FILE`
    pub peers_file: Option<PathBuf>,

    /// Station from the peers file to join at startup.
    /// Env: `JOIN_STATION`
    pub join_station: Option<StationUuid>,

    /// Env: `CONNECT_TIMEOUT_MS` (0 = transport default)
    pub connect_timeout: Duration,

    /// Env: `MAX_PEERS` (0 = unlimited)
    pub max_peers: usize,

    /// Env: `AUTO_DOWNLOAD` (true/false)
    pub auto_download: bool,

    /// Env: `PEER_STALE_SECS`
    pub peer_stale: Duration,

    /// Env: `TRANSFER_RETENTION_SECS`
    pub transfer_retention: Duration,

    /// Env: `MAX_FILE_SIZE` (bytes)
    pub max_file_size: u64,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station_name: "MVR Station".to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            listen_addr: ([0, 0, 0, 0], DEFAULT_STATION_PORT).into(),
            data_dir: None,
            peers_file: None,
            join_station: None,
            connect_timeout: Duration::from_secs(5),
            max_peers: 0,
            auto_download: true,
            peer_stale: Duration::from_secs(DEFAULT_PEER_STALE_SECS),
            transfer_retention: Duration::from_secs(DEFAULT_TRANSFER_RETENTION_SECS),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl StationConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("STATION_NAME").filter(|v| !v.is_empty()) {
            config.station_name = name;
        }

        if let Some(provider) = lookup("PROVIDER").filter(|v| !v.is_empty()) {
            config.provider = provider;
        }

        if let Some(addr) = lookup("LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default"),
            }
        }

        if let Some(dir) = lookup("DATA_DIR").filter(|v| !v.is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(path) = lookup("PEERS_FILE").filter(|v| !v.is_empty()) {
            config.peers_file = Some(PathBuf::from(path));
        }

        if let Some(station) = lookup("JOIN_STATION").filter(|v| !v.is_empty()) {
            match StationUuid::parse(&station) {
                Ok(uuid) => config.join_station = Some(uuid),
                Err(e) => tracing::warn!(value = %station, error = %e, "Invalid JOIN_STATION, ignoring"),
            }
        }

        if let Some(ms) = parse_number::<u64>(&lookup, "CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = parse_number::<usize>(&lookup, "MAX_PEERS") {
            config.max_peers = n;
        }

        if let Some(val) = lookup("AUTO_DOWNLOAD") {
            config.auto_download = val != "false" && val != "0";
        }

        if let Some(secs) = parse_number::<u64>(&lookup, "PEER_STALE_SECS") {
            config.peer_stale = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_number::<u64>(&lookup, "TRANSFER_RETENTION_SECS") {
            config.transfer_retention = Duration::from_secs(secs);
        }

        if let Some(bytes) = parse_number::<u64>(&lookup, "MAX_FILE_SIZE") {
            config.max_file_size = bytes;
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    pub fn artifact_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("artifacts")
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen_addr,
            max_peers: self.max_peers,
            auto_download: self.auto_download,
        }
    }

    /// Client settings announcing the bound listener port.
    pub fn client_config(&self, listen_port: u16) -> ClientConfig {
        ClientConfig {
            connect_timeout: self.connect_timeout,
            auto_download: self.auto_download,
            listen_port: Some(listen_port),
            ..ClientConfig::default()
        }
    }

    pub fn transfer_config(&self, data_dir: &Path) -> TransferConfig {
        TransferConfig {
            artifact_dir: Self::artifact_dir(data_dir),
            connect_timeout: self.connect_timeout,
            max_file_size: self.max_file_size,
        }
    }
}

fn parse_number<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}
