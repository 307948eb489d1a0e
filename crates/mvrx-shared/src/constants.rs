/// Magic value opening every MVR-xchange TCP packet
pub const PACKET_MAGIC: u32 = 778_682;

/// Packet format version understood by this build
pub const PACKET_VERSION: u32 = 1;

/// Packet header size: magic(4) + version(4) + number(4) + count(4) + type(4) + length(8)
pub const PACKET_HEADER_LEN: usize = 28;

/// Maximum JSON payload size in bytes (4 MiB)
pub const MAX_JSON_PAYLOAD: u64 = 4 * 1024 * 1024;

/// Default maximum scene file size accepted for download (512 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Default TCP port a station listens on
pub const DEFAULT_STATION_PORT: u16 = 4567;

/// Provider string announced to peers
pub const DEFAULT_PROVIDER: &str = "mvrx-station";

/// Extension of scene artifacts on disk
pub const SCENE_EXTENSION: &str = "mvr";

/// Grace period between sending LEAVE and closing the transport (milliseconds)
pub const LEAVE_GRACE_MS: u64 = 300;

/// Default age after which an unseen peer is evicted (seconds)
pub const DEFAULT_PEER_STALE_SECS: u64 = 120;

/// Default retention of finished transfer entries (seconds)
pub const DEFAULT_TRANSFER_RETENTION_SECS: u64 = 60;
