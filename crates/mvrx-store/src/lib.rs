//! # mvrx-store
//!
//! Local state of a station: the persistent [`StationIdentity`], the SQLite
//! [`Database`] holding it together with every accepted commit, and the
//! in-memory [`CommitStore`] that network tasks append to.

pub mod commit_store;
pub mod commits;
pub mod database;
pub mod identity;
pub mod migrations;

mod error;

pub use commit_store::CommitStore;
pub use database::Database;
pub use error::StoreError;
pub use identity::StationIdentity;
