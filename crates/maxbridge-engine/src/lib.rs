//! # maxbridge-engine
//!
//! The bridge engine: the three-way mapping between Max chats, Matrix rooms
//! and ghost identities. Portals route events in both directions, puppets
//! mirror remote profiles, user sessions own the per-user client lifecycle,
//! and the [`Engine`] holds the registries tying them together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod convert;
mod engine;
mod handler;
mod license;
mod portal;
mod puppet;
mod user;

#[cfg(test)]
pub(crate) mod testutil;

use thiserror::Error;

pub use engine::Engine;
pub use handler::MatrixHandler;
pub use license::{LicenseClient, LicenseDecision, LicenseSchedule, LicenseTracker};
pub use portal::Portal;
pub use puppet::Puppet;
pub use user::UserSession;

/// Errors from bridge engine operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Database failure.
    #[error(transparent)]
    Store(#[from] maxbridge_store::StoreError),

    /// Max client failure.
    #[error(transparent)]
    Client(#[from] maxbridge_client::ClientError),

    /// Matrix intent failure.
    #[error(transparent)]
    Intent(#[from] maxbridge_matrix::IntentError),

    /// The user has no usable credentials.
    #[error("User is not logged in")]
    NotLoggedIn,

    /// License verification failed.
    #[error("License verification failed: {0}")]
    License(String),
}
