//! The client capability contract shared by both connection modes.
//!
//! The set of implementations is closed: [`crate::BotClient`] and
//! [`crate::UserClient`]. Code that needs mode-specific data (the user-mode
//! login handshake) keeps the concrete handle from the construction site;
//! everything else dispatches through the trait.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use maxbridge_core::types::{MaxChat, MaxEvent, MaxMessage, MaxUser};

use crate::error::ClientError;

/// Channel on which clients emit normalized events.
pub type EventSender = mpsc::UnboundedSender<MaxEvent>;

/// Capability contract implemented by both client modes.
///
/// Operations the underlying API cannot express (Bot API reactions and read
/// markers) are debug-logged no-ops; callers tolerate that.
#[async_trait]
pub trait MaxClient: Send + Sync {
    /// Connect to Max and start delivering events.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Disconnect and stop delivering events.
    async fn disconnect(&self);

    /// Whether the client is currently connected.
    async fn is_connected(&self) -> bool;

    /// The authenticated identity, once connected.
    async fn profile(&self) -> Option<MaxUser>;

    /// Send a text message, optionally as a reply and with attachments.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<&str>,
        attachments: &[Value],
    ) -> Result<MaxMessage, ClientError>;

    /// Edit a previously sent message.
    async fn edit_message(&self, message_id: &str, text: &str) -> Result<(), ClientError>;

    /// Delete a message.
    async fn delete_message(&self, message_id: &str) -> Result<(), ClientError>;

    /// Get chat information.
    async fn get_chat(&self, chat_id: i64) -> Result<MaxChat, ClientError>;

    /// Get the chat member list.
    async fn get_chat_members(&self, chat_id: i64) -> Result<Vec<MaxUser>, ClientError>;

    /// Get user information.
    async fn get_user_info(&self, user_id: i64) -> Result<MaxUser, ClientError>;

    /// Download media bytes from a Max URL.
    async fn download_media(&self, url: &str) -> Result<Vec<u8>, ClientError>;

    /// Upload media, returning the attachment token.
    async fn upload_media(
        &self,
        data: Vec<u8>,
        filename: &str,
        content_type: &str,
    ) -> Result<String, ClientError>;

    /// Add a reaction to a message. An empty emoji removes the reaction.
    async fn add_reaction(
        &self,
        chat_id: i64,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError>;

    /// Mark a message as read.
    async fn mark_as_read(&self, chat_id: i64, message_id: &str) -> Result<(), ClientError>;
}
