use thiserror::Error;
use uuid::Uuid;

use mvrx_shared::MvrxError;
use mvrx_store::StoreError;

use crate::client::SessionState;

/// Errors produced by the networking layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// The transport could not be opened or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote station answered a JOIN with `OK=false`.
    #[error("Join rejected: {0}")]
    JoinRejected(String),

    /// The operation requires a joined session.
    #[error("Not connected")]
    NotConnected,

    #[error("Operation not valid in state {0:?}")]
    InvalidState(SessionState),

    /// No artifact is stored for the requested UUID.
    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("File transfer failed: {0}")]
    FileTransfer(String),

    /// The peer lacks an address or carries the nil station UUID.
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    #[error(transparent)]
    Protocol(#[from] MvrxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
