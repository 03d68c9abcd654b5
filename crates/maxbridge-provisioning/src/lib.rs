//! # maxbridge-provisioning
//!
//! The login orchestrator: a small HTTP + WebSocket API that walks users
//! through the bot-token, phone + SMS and QR flows, owns the short-lived
//! auth sessions, and hands the resulting credentials to the bridge.
//!
//! Two surfaces coexist behind one shared-secret bearer check:
//! - v3 REST: `login/flows`, `login/start/{flow_id}`, `login/step/{login_id}`
//! - v1 compatibility: WebSocket QR login, logout, status

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod access;
mod server;
mod sessions;

pub use access::{BridgeAccess, UserStatus};
pub use server::{router, serve, ProvisioningState};
pub use sessions::{AuthSession, LoginFlow, LoginStep, SessionLookup, SessionStore};
