//! The intent capability trait and Matrix event content types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from intent operations.
#[derive(Error, Debug)]
pub enum IntentError {
    /// Error response from the homeserver.
    #[error("Matrix error {errcode}: {error}")]
    Matrix {
        /// Matrix error code (e.g. `M_FORBIDDEN`).
        errcode: String,
        /// Human-readable error.
        error: String,
    },

    /// Network failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Message type constants for `m.room.message` content.
pub mod msgtype {
    /// Plain text.
    pub const TEXT: &str = "m.text";
    /// Notice (bot output).
    pub const NOTICE: &str = "m.notice";
    /// Emote (`/me`).
    pub const EMOTE: &str = "m.emote";
    /// Image.
    pub const IMAGE: &str = "m.image";
    /// File.
    pub const FILE: &str = "m.file";
    /// Video.
    pub const VIDEO: &str = "m.video";
    /// Audio.
    pub const AUDIO: &str = "m.audio";
    /// Location.
    pub const LOCATION: &str = "m.location";
}

/// Media metadata attached to media messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    /// MIME type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    /// Size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// The relation block of an event (`m.relates_to`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelatesTo {
    /// Reply reference.
    #[serde(rename = "m.in_reply_to", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<InReplyTo>,
    /// Relation type (`m.replace`, `m.annotation`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    /// Target event of the relation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Annotation key (the reaction emoji).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A reply reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InReplyTo {
    /// Event being replied to.
    pub event_id: String,
}

/// Content of an `m.room.message` (or `m.sticker`) event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    /// Message type (see [`msgtype`]).
    pub msgtype: String,
    /// Plain-text body.
    pub body: String,
    /// Format of `formatted_body` (`org.matrix.custom.html`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// HTML body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    /// Content URI for media messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Media metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<MediaInfo>,
    /// `geo:` URI for location messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_uri: Option<String>,
    /// Relation to another event.
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<RelatesTo>,
    /// Replacement content for edits.
    #[serde(rename = "m.new_content", skip_serializing_if = "Option::is_none")]
    pub new_content: Option<Box<MessageContent>>,
}

impl MessageContent {
    /// Plain text content.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: msgtype::TEXT.to_string(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Attach an HTML body.
    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.format = Some("org.matrix.custom.html".to_string());
        self.formatted_body = Some(html.into());
        self
    }

    /// Mark this content as a reply to another event.
    pub fn set_reply(&mut self, event_id: impl Into<String>) {
        let relates = self.relates_to.get_or_insert_with(RelatesTo::default);
        relates.in_reply_to = Some(InReplyTo {
            event_id: event_id.into(),
        });
    }

    /// Mark this content as an edit replacing another event.
    ///
    /// The fallback body should already carry the `* ` prefix; the clean
    /// text goes into `m.new_content`.
    pub fn set_edit(&mut self, event_id: impl Into<String>, new_body: impl Into<String>) {
        self.new_content = Some(Box::new(Self {
            msgtype: self.msgtype.clone(),
            body: new_body.into(),
            ..Self::default()
        }));
        self.relates_to = Some(RelatesTo {
            rel_type: Some("m.replace".to_string()),
            event_id: Some(event_id.into()),
            ..RelatesTo::default()
        });
    }
}

/// Options for creating a portal room.
#[derive(Debug, Clone, Default)]
pub struct RoomCreateOptions {
    /// Room name.
    pub name: Option<String>,
    /// Whether this is a direct chat.
    pub is_direct: bool,
    /// Users to invite on creation.
    pub invitees: Vec<String>,
    /// Room topic.
    pub topic: Option<String>,
}

/// A capability handle against the Matrix application-service API, scoped to
/// the bridge bot or to one ghost.
#[async_trait]
pub trait Intent: Send + Sync {
    /// The Matrix user id this intent acts as.
    fn user_id(&self) -> &str;

    /// Ensure the ghost account exists on the homeserver.
    async fn ensure_registered(&self) -> Result<(), IntentError>;

    /// Create a room, returning its room id.
    async fn create_room(&self, options: RoomCreateOptions) -> Result<String, IntentError>;

    /// Send a message event, returning the event id.
    async fn send_message(
        &self,
        room_id: &str,
        content: &MessageContent,
    ) -> Result<String, IntentError>;

    /// Send an arbitrary event type (stickers use `m.sticker`).
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &serde_json::Value,
    ) -> Result<String, IntentError>;

    /// Send a reaction annotation, returning the event id.
    async fn send_reaction(
        &self,
        room_id: &str,
        target_event_id: &str,
        emoji: &str,
    ) -> Result<String, IntentError>;

    /// Redact an event.
    async fn redact(&self, room_id: &str, event_id: &str) -> Result<(), IntentError>;

    /// Set the profile display name.
    async fn set_displayname(&self, name: &str) -> Result<(), IntentError>;

    /// Set the profile avatar.
    async fn set_avatar_url(&self, mxc: &str) -> Result<(), IntentError>;

    /// Upload media, returning the `mxc://` URI.
    async fn upload_media(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, IntentError>;

    /// Download media content by `mxc://` URI.
    async fn download_media(&self, mxc: &str) -> Result<Vec<u8>, IntentError>;

    /// Send a read receipt for an event.
    async fn send_receipt(&self, room_id: &str, event_id: &str) -> Result<(), IntentError>;

    /// Set the typing state in a room.
    async fn set_typing(&self, room_id: &str, typing: bool) -> Result<(), IntentError>;

    /// Update the room name.
    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<(), IntentError>;
}

/// Produces intents: the shared bridge-bot intent and per-ghost intents
/// derived from it.
pub trait IntentFactory: Send + Sync {
    /// The bridge bot's intent.
    fn main(&self) -> std::sync::Arc<dyn Intent>;

    /// The intent acting as the given ghost.
    fn ghost(&self, mxid: &str) -> std::sync::Arc<dyn Intent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_relation_shape() {
        let mut content = MessageContent::text("re");
        content.set_reply("$e1");
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["m.relates_to"]["m.in_reply_to"]["event_id"], "$e1");
    }

    #[test]
    fn edit_relation_shape() {
        let mut content = MessageContent::text("* fixed");
        content.set_edit("$e1", "fixed");
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["m.relates_to"]["rel_type"], "m.replace");
        assert_eq!(value["m.relates_to"]["event_id"], "$e1");
        assert_eq!(value["m.new_content"]["body"], "fixed");
        assert_eq!(value["body"], "* fixed");
    }

    #[test]
    fn optional_fields_omitted() {
        let content = MessageContent::text("hi");
        let encoded = serde_json::to_string(&content).unwrap();
        assert!(!encoded.contains("formatted_body"));
        assert!(!encoded.contains("m.relates_to"));
    }

    #[test]
    fn html_body() {
        let content = MessageContent::text("a\nb").with_html("a<br>b");
        assert_eq!(content.format.as_deref(), Some("org.matrix.custom.html"));
    }
}
