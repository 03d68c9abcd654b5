//! Max Messenger wire types shared by both client modes.
//!
//! The upstream APIs are inconsistent between the Bot REST surface and the
//! user WebSocket surface: attachment fields may be wrapped in a `payload`
//! object, message bodies arrive as either an object or a bare string, and
//! senders as either a user object or a plain integer id. The decoders here
//! absorb those differences so downstream code never branches on client mode.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a bridge user is connected to Max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Bot API token over REST + long-polling.
    Bot,
    /// Full user account over the WebSocket protocol.
    User,
}

impl ConnectionMode {
    /// Get string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::User => "user",
        }
    }

    /// Parse from the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bot" => Some(Self::Bot),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of Max chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// One-on-one conversation.
    #[default]
    Dialog,
    /// Group chat.
    Group,
    /// Broadcast channel.
    Channel,
}

impl ChatType {
    /// Parse a wire name, defaulting to dialog for unknown values.
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value {
            "group" => Self::Group,
            "channel" => Self::Channel,
            _ => Self::Dialog,
        }
    }
}

/// Type of attachment on a Max message.
///
/// `photo` and `image` are aliases: the Bot API spells images `image`, the
/// user API `photo`. Both decode to the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Photo (user API name).
    Photo,
    /// Photo (Bot API name).
    Image,
    /// Generic file.
    File,
    /// Sticker.
    Sticker,
    /// Video file.
    Video,
    /// Voice message.
    Voice,
    /// Audio file.
    Audio,
    /// Shared contact.
    Contact,
    /// Geographic location.
    Location,
}

impl AttachmentKind {
    /// Whether this kind carries photo payloads.
    #[must_use]
    pub const fn is_photo(self) -> bool {
        matches!(self, Self::Photo | Self::Image)
    }

    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "photo" => Some(Self::Photo),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "sticker" => Some(Self::Sticker),
            "video" => Some(Self::Video),
            "voice" => Some(Self::Voice),
            "audio" => Some(Self::Audio),
            "contact" => Some(Self::Contact),
            "location" => Some(Self::Location),
            _ => None,
        }
    }

    /// The wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Image => "image",
            Self::File => "file",
            Self::Sticker => "sticker",
            Self::Video => "video",
            Self::Voice => "voice",
            Self::Audio => "audio",
            Self::Contact => "contact",
            Self::Location => "location",
        }
    }
}

/// Kind of normalized event emitted by a Max client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxEventKind {
    /// New message in a chat.
    MessageCreated,
    /// Message text was edited.
    MessageEdited,
    /// Message was deleted.
    MessageRemoved,
    /// Bot callback button pressed (not bridged).
    MessageCallback,
    /// A user started the bot in a dialog.
    BotStarted,
    /// The bot was added to a chat.
    BotAdded,
    /// The bot was removed from a chat.
    BotRemoved,
    /// A user joined a chat.
    UserAdded,
    /// A user left or was removed from a chat.
    UserRemoved,
    /// The chat title changed.
    ChatTitleChanged,
    /// A reaction was added or removed on a message.
    ReactionChanged,
    /// A peer's read marker moved.
    ReadMarker,
    /// A peer is typing.
    Typing,
}

impl MaxEventKind {
    /// Parse a Bot API `update_type` string.
    #[must_use]
    pub fn from_update_type(value: &str) -> Option<Self> {
        match value {
            "message_created" => Some(Self::MessageCreated),
            "message_edited" => Some(Self::MessageEdited),
            "message_removed" => Some(Self::MessageRemoved),
            "message_callback" => Some(Self::MessageCallback),
            "bot_started" => Some(Self::BotStarted),
            "bot_added" => Some(Self::BotAdded),
            "bot_removed" => Some(Self::BotRemoved),
            "user_added" => Some(Self::UserAdded),
            "user_removed" => Some(Self::UserRemoved),
            "chat_title_changed" => Some(Self::ChatTitleChanged),
            _ => None,
        }
    }
}

/// A Max Messenger user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaxUser {
    /// Numeric user id.
    pub user_id: i64,
    /// Full name.
    #[serde(default)]
    pub name: String,
    /// Optional username handle.
    pub username: Option<String>,
    /// Avatar URL on the Max CDN.
    pub avatar_url: Option<String>,
    /// Whether this account is a bot.
    #[serde(default)]
    pub is_bot: bool,
    /// Last seen timestamp, if exposed.
    pub last_activity_time: Option<i64>,
}

impl MaxUser {
    /// Display name with fallbacks: name, then username, then the id.
    #[must_use]
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        if let Some(username) = &self.username {
            if !username.is_empty() {
                return username.clone();
            }
        }
        self.user_id.to_string()
    }

    /// Decode a user from a raw value.
    ///
    /// The WebSocket protocol sometimes sends a bare integer id where the
    /// REST API sends a full user object; a bare id yields a synthetic user
    /// whose name is the id rendered as a string.
    #[must_use]
    pub fn from_value(raw: &Value) -> Option<Self> {
        if let Some(id) = raw.as_i64() {
            return Some(Self {
                user_id: id,
                name: id.to_string(),
                ..Self::default()
            });
        }
        let obj = raw.as_object()?;
        let user_id = obj
            .get("user_id")
            .or_else(|| obj.get("userId"))
            .or_else(|| obj.get("id"))
            .and_then(Value::as_i64)?;
        Some(Self {
            user_id,
            name: obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            username: obj
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_string),
            avatar_url: obj
                .get("avatar_url")
                .or_else(|| obj.get("baseUrl"))
                .and_then(Value::as_str)
                .map(str::to_string),
            is_bot: obj.get("is_bot").and_then(Value::as_bool).unwrap_or(false),
            last_activity_time: obj.get("last_activity_time").and_then(Value::as_i64),
        })
    }
}

/// One photo size variant returned by the Max API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxPhoto {
    /// Download URL.
    pub url: String,
    /// Attachment token, if reusable.
    pub token: Option<String>,
    /// Width in pixels.
    pub width: Option<i64>,
    /// Height in pixels.
    pub height: Option<i64>,
}

/// An attachment on a Max message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxAttachment {
    /// Attachment kind.
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    /// Photo size variants keyed by size name.
    pub photos: Option<HashMap<String, MaxPhoto>>,
    /// Direct download URL (files, video, audio, stickers).
    pub url: Option<String>,
    /// Numeric file id.
    pub file_id: Option<i64>,
    /// Original filename.
    pub filename: Option<String>,
    /// MIME type.
    pub mime_type: Option<String>,
    /// Size in bytes.
    pub size: Option<i64>,
    /// Sticker id.
    pub sticker_id: Option<String>,
    /// Latitude for location attachments.
    pub latitude: Option<f64>,
    /// Longitude for location attachments.
    pub longitude: Option<f64>,
}

/// Photo size preference order for [`MaxAttachment::best_photo_url`].
const PHOTO_SIZE_ORDER: [&str; 4] = ["original", "large", "medium", "small"];

impl MaxAttachment {
    /// The highest-resolution photo URL, if any.
    ///
    /// Prefers the named sizes in order original, large, medium, small, then
    /// any available size, then the plain `url` field.
    #[must_use]
    pub fn best_photo_url(&self) -> Option<&str> {
        if let Some(photos) = &self.photos {
            for key in PHOTO_SIZE_ORDER {
                if let Some(photo) = photos.get(key) {
                    return Some(&photo.url);
                }
            }
            if let Some(photo) = photos.values().next() {
                return Some(&photo.url);
            }
        }
        self.url.as_deref()
    }

    /// Decode an attachment from a raw value.
    ///
    /// The Bot API wraps attachment data in a `payload` object; its fields
    /// are flattened into the attachment before decoding.
    #[must_use]
    pub fn from_value(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let kind = AttachmentKind::from_wire(obj.get("type")?.as_str()?)?;

        let mut fields = serde_json::Map::new();
        for (key, value) in obj {
            if key != "type" && key != "payload" {
                fields.insert(key.clone(), value.clone());
            }
        }
        if let Some(Value::Object(payload)) = obj.get("payload") {
            for (key, value) in payload {
                fields.insert(key.clone(), value.clone());
            }
        }
        fields.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        serde_json::from_value(Value::Object(fields)).ok()
    }
}

/// A linked (replied-to or forwarded) message reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxLinkedMessage {
    /// Link type: `reply` or `forward`.
    #[serde(rename = "type")]
    pub link_type: String,
    /// Message id of the linked message.
    pub mid: String,
    /// Sender of the linked message.
    pub sender: Option<MaxUser>,
    /// Text of the linked message.
    pub text: Option<String>,
}

/// A Max Messenger message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaxMessage {
    /// Message id (`mid` on the wire).
    pub message_id: String,
    /// Server timestamp in milliseconds.
    pub timestamp: i64,
    /// Sender, if known.
    pub sender: Option<MaxUser>,
    /// Raw recipient descriptor (carries the chat id).
    pub recipient: Option<Value>,
    /// Raw body: `{text, attachments}` or a bare string.
    pub body: Option<Value>,
    /// Reply/forward link.
    pub link: Option<MaxLinkedMessage>,
}

impl MaxMessage {
    /// Text content of the body.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self.body.as_ref()? {
            Value::String(text) => Some(text),
            Value::Object(body) => body.get("text").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Typed attachment list. Undecodable entries are skipped.
    #[must_use]
    pub fn attachments(&self) -> Vec<MaxAttachment> {
        let Some(Value::Object(body)) = self.body.as_ref() else {
            return Vec::new();
        };
        let Some(Value::Array(raw)) = body.get("attachments") else {
            return Vec::new();
        };
        raw.iter().filter_map(MaxAttachment::from_value).collect()
    }

    /// Chat id from the recipient descriptor.
    #[must_use]
    pub fn chat_id(&self) -> Option<i64> {
        let obj = self.recipient.as_ref()?.as_object()?;
        obj.get("chat_id")
            .or_else(|| obj.get("chatId"))
            .and_then(Value::as_i64)
    }

    /// Message id this message replies to, if the link is a reply.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        let link = self.link.as_ref()?;
        (link.link_type == "reply").then_some(link.mid.as_str())
    }

    /// Decode a message from a raw value.
    ///
    /// Accepts the id as `mid`, `id` or `messageId` (at the top level or
    /// inside the body), the sender as an object or a bare integer, and the
    /// body as an object or a bare string.
    #[must_use]
    pub fn from_value(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let body = obj.get("body").cloned();

        let message_id = extract_message_id(raw)
            .or_else(|| body.as_ref().and_then(extract_message_id))
            .unwrap_or_default();

        let link = obj.get("link").and_then(|link| {
            let link_obj = link.as_object()?;
            Some(MaxLinkedMessage {
                link_type: link_obj
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("reply")
                    .to_string(),
                mid: link_obj
                    .get("mid")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                sender: link_obj.get("sender").and_then(MaxUser::from_value),
                text: link_obj
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        });

        Some(Self {
            message_id,
            timestamp: obj.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
            sender: obj.get("sender").and_then(MaxUser::from_value),
            recipient: obj.get("recipient").cloned(),
            body,
            link,
        })
    }
}

/// Extract a message id from a raw value under any of its wire spellings.
#[must_use]
pub fn extract_message_id(raw: &Value) -> Option<String> {
    let obj = raw.as_object()?;
    for key in ["mid", "id", "messageId", "message_id"] {
        match obj.get(key) {
            Some(Value::String(id)) if !id.is_empty() => return Some(id.clone()),
            Some(Value::Number(id)) => return Some(id.to_string()),
            _ => {}
        }
    }
    None
}

/// Extract a chat id from a raw value under either wire spelling.
#[must_use]
pub fn extract_chat_id(raw: &Value) -> Option<i64> {
    let obj = raw.as_object()?;
    obj.get("chatId")
        .or_else(|| obj.get("chat_id"))
        .and_then(Value::as_i64)
}

/// A Max Messenger chat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxChat {
    /// Numeric chat id.
    pub chat_id: i64,
    /// Chat type.
    #[serde(rename = "type", default)]
    pub chat_type: ChatType,
    /// Title, if set.
    pub title: Option<String>,
    /// Raw icon descriptor.
    pub icon: Option<Value>,
    /// Member count.
    #[serde(default)]
    pub members_count: i64,
    /// Owner user id.
    pub owner_id: Option<i64>,
    /// Participant list, when included.
    pub participants: Option<Vec<MaxUser>>,
    /// Whether the chat is publicly joinable.
    #[serde(default)]
    pub is_public: bool,
    /// Timestamp of the last event.
    pub last_event_time: Option<i64>,
    /// Chat description.
    pub description: Option<String>,
    /// For dialogs: the peer this chat is with.
    pub dialog_with_user: Option<MaxUser>,
}

impl MaxChat {
    /// Display title: dialog peer name, then title, then a placeholder.
    #[must_use]
    pub fn display_title(&self) -> String {
        if let Some(peer) = &self.dialog_with_user {
            return peer.display_name();
        }
        self.title
            .clone()
            .unwrap_or_else(|| placeholder_title(self.chat_id))
    }
}

/// The placeholder title used for chats whose real name is not yet known.
#[must_use]
pub fn placeholder_title(chat_id: i64) -> String {
    format!("Chat {chat_id}")
}

/// Whether a persisted portal name is the placeholder for the given chat.
#[must_use]
pub fn is_placeholder_title(name: &str, chat_id: i64) -> bool {
    name.is_empty() || name == placeholder_title(chat_id)
}

/// Parse a chat participants field into a set of user ids.
///
/// The login handshake delivers participants as a map `{userId: lastReadTs}`,
/// as a list of user objects, or as a list of bare ids; all three shapes
/// parse to the same set.
#[must_use]
pub fn parse_participant_ids(raw: &Value) -> Vec<i64> {
    match raw {
        Value::Object(map) => map.keys().filter_map(|key| key.parse().ok()).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.as_i64().or_else(|| {
                    let obj = item.as_object()?;
                    obj.get("user_id")
                        .or_else(|| obj.get("userId"))
                        .or_else(|| obj.get("id"))
                        .and_then(Value::as_i64)
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// A normalized event emitted by either client mode.
#[derive(Debug, Clone, Serialize)]
pub struct MaxEvent {
    /// Event kind.
    pub kind: MaxEventKind,
    /// Chat the event belongs to.
    pub chat_id: i64,
    /// Message payload, when present.
    pub message: Option<MaxMessage>,
    /// User payload (membership and bot events).
    pub user: Option<MaxUser>,
    /// Standalone message id for edits/deletes without a body.
    pub message_id: Option<String>,
    /// New text for edits.
    pub new_text: Option<String>,
    /// Reaction emoji; empty string means removal.
    pub reaction: Option<String>,
    /// Sender id for reactions and read markers.
    pub sender_id: Option<i64>,
    /// Event timestamp in milliseconds.
    pub timestamp: i64,
}

impl MaxEvent {
    /// Create an event with only the required fields set.
    #[must_use]
    pub const fn new(kind: MaxEventKind, chat_id: i64) -> Self {
        Self {
            kind,
            chat_id,
            message: None,
            user: None,
            message_id: None,
            new_text: None,
            reaction: None,
            sender_id: None,
            timestamp: 0,
        }
    }

    /// The message id, whether standalone or inside the message payload.
    #[must_use]
    pub fn any_message_id(&self) -> Option<&str> {
        if let Some(id) = self.message_id.as_deref() {
            if !id.is_empty() {
                return Some(id);
            }
        }
        self.message
            .as_ref()
            .map(|message| message.message_id.as_str())
            .filter(|id| !id.is_empty())
    }
}
