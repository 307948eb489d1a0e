//! # mvrx-shared
//!
//! Types shared by every MVR-xchange station crate: station and commit
//! identifiers, the commit/peer data model, the TCP packet codec and the
//! JSON message vocabulary.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::MvrxError;
pub use protocol::{MessageKind, PayloadKind, WireMessage};
pub use types::{Commit, PeerInfo, StationUuid};
