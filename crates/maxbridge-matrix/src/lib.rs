//! # maxbridge-matrix
//!
//! The Matrix side of the bridge, reduced to the capability the engine
//! consumes: an *intent* — send a message, redact, create a room, set a
//! profile, upload media — scoped either to the bridge bot or to a ghost.
//!
//! [`AppserviceClient`] implements the capability over the client-server
//! API with application-service impersonation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod appservice;
mod intent;

pub use appservice::AppserviceClient;
pub use intent::{
    Intent, IntentError, IntentFactory, MediaInfo, MessageContent, RelatesTo, RoomCreateOptions,
    msgtype,
};
