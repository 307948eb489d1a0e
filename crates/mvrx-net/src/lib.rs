// MVR-xchange networking: TCP station server, peer client and file transfers.

pub mod client;
pub mod codec;
pub mod context;
pub mod discovery;
pub mod error;
pub mod events;
pub mod peers;
pub mod server;
pub mod transfer;

pub use client::{Client, ClientConfig, SessionState};
pub use context::StationContext;
pub use discovery::{load_peers_file, parse_peer_line};
pub use error::NetError;
pub use events::{EventBridge, EventStream, HostApplication, StationEvent};
pub use peers::PeerDirectory;
pub use server::{ConnectionState, Server, ServerConfig};
pub use transfer::{FileTransferManager, FileTransferRequest, TransferConfig, TransferHandle, TransferStatus};
