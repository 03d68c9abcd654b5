//! # maxbridge-client
//!
//! Max Messenger client implementations.
//!
//! Two connection modes are unified behind the [`MaxClient`] trait:
//! - [`BotClient`]: Bot API token over REST with a long-polling update loop
//! - [`UserClient`]: full user account over the framed WebSocket protocol

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bot;
mod error;
pub mod media;
pub mod protocol;
mod traits;
pub mod user;

pub use bot::BotClient;
pub use error::ClientError;
pub use traits::{EventSender, MaxClient};
pub use user::{AuthResult, LoginData, PhoneAuthStart, QrStart, QrStatus, UserClient};
