//! In-memory fakes of the intent and client seams for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use maxbridge_client::{ClientError, MaxClient};
use maxbridge_core::types::{MaxChat, MaxMessage, MaxUser};
use maxbridge_matrix::{Intent, IntentError, IntentFactory, MessageContent, RoomCreateOptions};

/// A recorded intent call.
#[derive(Debug, Clone)]
pub enum IntentCall {
    CreateRoom {
        user_id: String,
        name: Option<String>,
        is_direct: bool,
        invitees: Vec<String>,
        room_id: String,
    },
    SendMessage {
        user_id: String,
        room_id: String,
        content: Value,
        event_id: String,
    },
    SendEvent {
        user_id: String,
        room_id: String,
        event_type: String,
        content: Value,
        event_id: String,
    },
    SendReaction {
        user_id: String,
        room_id: String,
        target: String,
        key: String,
        event_id: String,
    },
    Redact {
        user_id: String,
        room_id: String,
        event_id: String,
    },
    SetDisplayname {
        user_id: String,
        name: String,
    },
    SetAvatar {
        user_id: String,
        mxc: String,
    },
    Receipt {
        user_id: String,
        room_id: String,
        event_id: String,
    },
    Typing {
        user_id: String,
        room_id: String,
        typing: bool,
    },
    SetRoomName {
        room_id: String,
        name: String,
    },
}

#[derive(Default)]
struct IntentState {
    counter: AtomicU64,
    calls: Mutex<Vec<IntentCall>>,
    fail_avatar_uploads: AtomicBool,
}

impl IntentState {
    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, call: IntentCall) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Factory producing recording fake intents.
#[derive(Clone, Default)]
pub struct FakeIntentFactory {
    state: Arc<IntentState>,
}

impl FakeIntentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded calls so far, in order.
    pub fn calls(&self) -> Vec<IntentCall> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Make media uploads fail (avatar retry path).
    pub fn fail_uploads(&self) {
        self.state.fail_avatar_uploads.store(true, Ordering::SeqCst);
    }

    /// Room ids created so far.
    pub fn created_rooms(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                IntentCall::CreateRoom { room_id, .. } => Some(room_id),
                _ => None,
            })
            .collect()
    }
}

impl IntentFactory for FakeIntentFactory {
    fn main(&self) -> Arc<dyn Intent> {
        Arc::new(FakeIntent {
            state: Arc::clone(&self.state),
            user_id: "@maxbot:example.com".to_string(),
        })
    }

    fn ghost(&self, mxid: &str) -> Arc<dyn Intent> {
        Arc::new(FakeIntent {
            state: Arc::clone(&self.state),
            user_id: mxid.to_string(),
        })
    }
}

struct FakeIntent {
    state: Arc<IntentState>,
    user_id: String,
}

#[async_trait]
impl Intent for FakeIntent {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn ensure_registered(&self) -> Result<(), IntentError> {
        Ok(())
    }

    async fn create_room(&self, options: RoomCreateOptions) -> Result<String, IntentError> {
        let room_id = format!("!room{}:example.com", self.state.next());
        self.state.record(IntentCall::CreateRoom {
            user_id: self.user_id.clone(),
            name: options.name,
            is_direct: options.is_direct,
            invitees: options.invitees,
            room_id: room_id.clone(),
        });
        Ok(room_id)
    }

    async fn send_message(
        &self,
        room_id: &str,
        content: &MessageContent,
    ) -> Result<String, IntentError> {
        let event_id = format!("$e{}", self.state.next());
        self.state.record(IntentCall::SendMessage {
            user_id: self.user_id.clone(),
            room_id: room_id.to_string(),
            content: serde_json::to_value(content).unwrap(),
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, IntentError> {
        let event_id = format!("$e{}", self.state.next());
        self.state.record(IntentCall::SendEvent {
            user_id: self.user_id.clone(),
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            content: content.clone(),
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn send_reaction(
        &self,
        room_id: &str,
        target_event_id: &str,
        emoji: &str,
    ) -> Result<String, IntentError> {
        let event_id = format!("$e{}", self.state.next());
        self.state.record(IntentCall::SendReaction {
            user_id: self.user_id.clone(),
            room_id: room_id.to_string(),
            target: target_event_id.to_string(),
            key: emoji.to_string(),
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn redact(&self, room_id: &str, event_id: &str) -> Result<(), IntentError> {
        self.state.record(IntentCall::Redact {
            user_id: self.user_id.clone(),
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        });
        Ok(())
    }

    async fn set_displayname(&self, name: &str) -> Result<(), IntentError> {
        self.state.record(IntentCall::SetDisplayname {
            user_id: self.user_id.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn set_avatar_url(&self, mxc: &str) -> Result<(), IntentError> {
        self.state.record(IntentCall::SetAvatar {
            user_id: self.user_id.clone(),
            mxc: mxc.to_string(),
        });
        Ok(())
    }

    async fn upload_media(
        &self,
        _data: Vec<u8>,
        _content_type: &str,
        _filename: &str,
    ) -> Result<String, IntentError> {
        if self.state.fail_avatar_uploads.load(Ordering::SeqCst) {
            return Err(IntentError::Transport("upload disabled".to_string()));
        }
        Ok(format!("mxc://example.com/{}", self.state.next()))
    }

    async fn download_media(&self, _mxc: &str) -> Result<Vec<u8>, IntentError> {
        Ok(b"matrix-media".to_vec())
    }

    async fn send_receipt(&self, room_id: &str, event_id: &str) -> Result<(), IntentError> {
        self.state.record(IntentCall::Receipt {
            user_id: self.user_id.clone(),
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        });
        Ok(())
    }

    async fn set_typing(&self, room_id: &str, typing: bool) -> Result<(), IntentError> {
        self.state.record(IntentCall::Typing {
            user_id: self.user_id.clone(),
            room_id: room_id.to_string(),
            typing,
        });
        Ok(())
    }

    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<(), IntentError> {
        self.state.record(IntentCall::SetRoomName {
            room_id: room_id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }
}

/// A recorded Max client call.
#[derive(Debug, Clone)]
pub enum ClientCall {
    SendMessage {
        chat_id: i64,
        text: String,
        reply_to: Option<String>,
        attachments: Vec<Value>,
        message_id: String,
    },
    EditMessage {
        message_id: String,
        text: String,
    },
    DeleteMessage {
        message_id: String,
    },
    AddReaction {
        chat_id: i64,
        message_id: String,
        emoji: String,
    },
    MarkAsRead {
        chat_id: i64,
        message_id: String,
    },
}

#[derive(Default)]
struct ClientState {
    counter: AtomicU64,
    calls: Mutex<Vec<ClientCall>>,
    fail_downloads: AtomicBool,
    chats: Mutex<HashMap<i64, MaxChat>>,
    me: Mutex<Option<MaxUser>>,
}

/// Recording fake of the Max client capability.
#[derive(Clone, Default)]
pub struct FakeClient {
    state: Arc<ClientState>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn fail_downloads(&self) {
        self.state.fail_downloads.store(true, Ordering::SeqCst);
    }

    pub fn put_chat(&self, chat: MaxChat) {
        self.state.chats.lock().unwrap().insert(chat.chat_id, chat);
    }

    pub fn set_me(&self, me: MaxUser) {
        *self.state.me.lock().unwrap() = Some(me);
    }
}

#[async_trait]
impl MaxClient for FakeClient {
    async fn connect(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn is_connected(&self) -> bool {
        true
    }

    async fn profile(&self) -> Option<MaxUser> {
        self.state.me.lock().unwrap().clone()
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<&str>,
        attachments: &[Value],
    ) -> Result<MaxMessage, ClientError> {
        let message_id = format!("max{}", self.state.counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.state.calls.lock().unwrap().push(ClientCall::SendMessage {
            chat_id,
            text: text.to_string(),
            reply_to: reply_to.map(str::to_string),
            attachments: attachments.to_vec(),
            message_id: message_id.clone(),
        });
        Ok(MaxMessage {
            message_id,
            timestamp: 1,
            body: Some(serde_json::json!({"text": text})),
            ..MaxMessage::default()
        })
    }

    async fn edit_message(&self, message_id: &str, text: &str) -> Result<(), ClientError> {
        self.state.calls.lock().unwrap().push(ClientCall::EditMessage {
            message_id: message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ClientError> {
        self.state.calls.lock().unwrap().push(ClientCall::DeleteMessage {
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    async fn get_chat(&self, chat_id: i64) -> Result<MaxChat, ClientError> {
        self.state
            .chats
            .lock()
            .unwrap()
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("chat {chat_id}")))
    }

    async fn get_chat_members(&self, _chat_id: i64) -> Result<Vec<MaxUser>, ClientError> {
        Ok(Vec::new())
    }

    async fn get_user_info(&self, user_id: i64) -> Result<MaxUser, ClientError> {
        Ok(MaxUser {
            user_id,
            name: user_id.to_string(),
            ..MaxUser::default()
        })
    }

    async fn download_media(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        if self.state.fail_downloads.load(Ordering::SeqCst) {
            return Err(ClientError::Transport(format!("download disabled: {url}")));
        }
        Ok(b"max-media".to_vec())
    }

    async fn upload_media(
        &self,
        _data: Vec<u8>,
        _filename: &str,
        _content_type: &str,
    ) -> Result<String, ClientError> {
        Ok(format!(
            "upload-token-{}",
            self.state.counter.fetch_add(1, Ordering::SeqCst) + 1
        ))
    }

    async fn add_reaction(
        &self,
        chat_id: i64,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        self.state.calls.lock().unwrap().push(ClientCall::AddReaction {
            chat_id,
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        });
        Ok(())
    }

    async fn mark_as_read(&self, chat_id: i64, message_id: &str) -> Result<(), ClientError> {
        self.state.calls.lock().unwrap().push(ClientCall::MarkAsRead {
            chat_id,
            message_id: message_id.to_string(),
        });
        Ok(())
    }
}
