//! User sessions: the per-Matrix-user lifecycle around one Max client.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use maxbridge_client::{BotClient, LoginData, MaxClient, UserClient};
use maxbridge_core::types::{
    ChatType, ConnectionMode, MaxChat, MaxEvent, MaxEventKind, MaxUser, parse_participant_ids,
};
use maxbridge_store::{MessageRow, UserRow};

use crate::engine::Engine;
use crate::BridgeError;

/// A Matrix user's bridge session.
pub struct UserSession {
    /// The Matrix user id.
    pub mxid: String,
    state: RwLock<SessionState>,
    client: RwLock<Option<SessionClient>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct SessionState {
    max_user_id: Option<i64>,
    max_token: Option<String>,
    connection_mode: Option<ConnectionMode>,
    bot_token: Option<String>,
}

struct SessionClient {
    client: Arc<dyn MaxClient>,
    user_client: Option<Arc<UserClient>>,
}

impl UserSession {
    pub(crate) fn from_row(mxid: String, row: Option<UserRow>) -> Self {
        let state = row.map_or_else(SessionState::default, |row| SessionState {
            max_user_id: row.max_user_id,
            max_token: row.max_token,
            connection_mode: row
                .connection_mode
                .as_deref()
                .and_then(ConnectionMode::parse),
            bot_token: row.bot_token,
        });
        Self {
            mxid,
            state: RwLock::new(state),
            client: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Whether this user has credentials for either mode.
    pub async fn is_logged_in(&self) -> bool {
        let state = self.state.read().await;
        state.bot_token.is_some() || state.max_token.is_some()
    }

    /// The user's Max numeric id, once known.
    pub async fn max_user_id(&self) -> Option<i64> {
        self.state.read().await.max_user_id
    }

    /// The configured connection mode.
    pub async fn connection_mode(&self) -> Option<ConnectionMode> {
        self.state.read().await.connection_mode
    }

    /// Whether the session runs through the Bot API.
    pub async fn is_bot_mode(&self) -> bool {
        self.connection_mode().await == Some(ConnectionMode::Bot)
    }

    /// The live client handle, if connected.
    pub async fn client(&self) -> Option<Arc<dyn MaxClient>> {
        self.client
            .read()
            .await
            .as_ref()
            .map(|session| Arc::clone(&session.client))
    }

    /// Whether a live client is connected.
    pub async fn is_connected(&self) -> bool {
        match self.client().await {
            Some(client) => client.is_connected().await,
            None => false,
        }
    }

    async fn save(&self, engine: &Engine) -> Result<(), BridgeError> {
        let state = self.state.read().await;
        UserRow {
            mxid: self.mxid.clone(),
            max_user_id: state.max_user_id,
            max_token: state.max_token.clone(),
            connection_mode: state.connection_mode.map(|mode| mode.as_str().to_string()),
            bot_token: state.bot_token.clone(),
        }
        .upsert(engine.store())
        .await?;
        Ok(())
    }

    /// Connect to Max with the stored credentials and start event delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotLoggedIn`] without credentials and
    /// propagates client connect failures.
    pub async fn connect(
        self: &Arc<Self>,
        engine: &Arc<Engine>,
    ) -> Result<(), BridgeError> {
        if self.client.read().await.is_some() {
            self.disconnect().await;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = engine.config();
        let state = self.state.read().await;
        let session_client = match (state.connection_mode, &state.bot_token, &state.max_token) {
            (Some(ConnectionMode::Bot), Some(bot_token), _) => SessionClient {
                client: Arc::new(BotClient::new(
                    bot_token.clone(),
                    config.max.api_url.clone(),
                    config.max.polling_timeout,
                    events_tx,
                )),
                user_client: None,
            },
            (Some(ConnectionMode::User), _, Some(max_token)) => {
                let user_client = Arc::new(UserClient::new(
                    config.max.ws_url.clone(),
                    format!("{}/uploads", config.max.api_url),
                    Some(max_token.clone()),
                    events_tx,
                ));
                SessionClient {
                    client: user_client.clone(),
                    user_client: Some(user_client),
                }
            }
            _ => {
                tracing::warn!(mxid = %self.mxid, "no valid credentials to connect with");
                return Err(BridgeError::NotLoggedIn);
            }
        };
        drop(state);

        session_client.client.connect().await?;
        tracing::info!(mxid = %self.mxid, "connected to Max");

        let user_client = session_client.user_client.clone();
        let client = Arc::clone(&session_client.client);
        *self.client.write().await = Some(session_client);

        // Event dispatch task: source order in, portal routing out.
        let dispatcher = {
            let session = Arc::clone(self);
            let engine = Arc::clone(engine);
            tokio::spawn(async move {
                let mut events_rx = events_rx;
                while let Some(event) = events_rx.recv().await {
                    session.on_max_event(&engine, event).await;
                }
            })
        };
        self.tasks.lock().await.push(dispatcher);

        // Stash our own Max id from the profile on first connect.
        if self.state.read().await.max_user_id.is_none() {
            if let Some(profile) = client.profile().await {
                self.state.write().await.max_user_id = Some(profile.user_id);
                tracing::info!(mxid = %self.mxid, max_user_id = profile.user_id, "stored own user id");
            }
        }

        if let Some(user_client) = user_client {
            // The server rotates the login token on every handshake.
            if let Some(login) = user_client.login_data().await {
                if let Some(token) = &login.token {
                    self.state.write().await.max_token = Some(token.clone());
                }
                let session = Arc::clone(self);
                let engine_for_sync = Arc::clone(engine);
                let sync_login = login.clone();
                let sync = tokio::spawn(async move {
                    session.sync_chats(&engine_for_sync, &sync_login).await;
                    session.sync_contacts(&engine_for_sync, &sync_login).await;
                });
                self.tasks.lock().await.push(sync);
            }
        }

        self.save(engine).await?;
        Ok(())
    }

    /// Disconnect and stop event delivery.
    pub async fn disconnect(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(session) = self.client.write().await.take() {
            session.client.disconnect().await;
        }
    }

    /// Store a bot token and connect in bot mode.
    ///
    /// # Errors
    ///
    /// Returns error if the token is rejected; credentials stay persisted
    /// for a retry.
    pub async fn login_bot(
        self: &Arc<Self>,
        engine: &Arc<Engine>,
        token: &str,
    ) -> Result<(), BridgeError> {
        {
            let mut state = self.state.write().await;
            state.bot_token = Some(token.to_string());
            state.connection_mode = Some(ConnectionMode::Bot);
        }
        self.save(engine).await?;
        self.connect(engine).await
    }

    /// Store a user-mode login token and connect.
    ///
    /// # Errors
    ///
    /// Returns error if the token is rejected; credentials stay persisted
    /// for a retry.
    pub async fn login_user(
        self: &Arc<Self>,
        engine: &Arc<Engine>,
        token: &str,
        max_user_id: i64,
    ) -> Result<(), BridgeError> {
        {
            let mut state = self.state.write().await;
            state.max_token = Some(token.to_string());
            state.connection_mode = Some(ConnectionMode::User);
            if max_user_id != 0 {
                state.max_user_id = Some(max_user_id);
            }
        }
        self.save(engine).await?;
        self.connect(engine).await
    }

    /// Disconnect and clear all credentials.
    ///
    /// # Errors
    ///
    /// Returns error on persistence failure.
    pub async fn logout(&self, engine: &Engine) -> Result<(), BridgeError> {
        self.disconnect().await;
        {
            let mut state = self.state.write().await;
            state.max_token = None;
            state.bot_token = None;
            state.max_user_id = None;
            state.connection_mode = None;
        }
        self.save(engine).await
    }

    /// Route one normalized Max event to its portal.
    ///
    /// Handler failures are logged and never unwind above this dispatcher.
    pub async fn on_max_event(self: &Arc<Self>, engine: &Arc<Engine>, event: MaxEvent) {
        let kind = event.kind;
        let chat_id = event.chat_id;
        if let Err(error) = self.dispatch_event(engine, event).await {
            tracing::error!(?kind, chat_id, %error, "failed to handle Max event");
        }
    }

    async fn dispatch_event(
        self: &Arc<Self>,
        engine: &Arc<Engine>,
        event: MaxEvent,
    ) -> Result<(), BridgeError> {
        match event.kind {
            MaxEventKind::BotStarted => {
                if let Some(user) = &event.user {
                    let puppet = engine.get_or_create_puppet(user.user_id).await?;
                    puppet.update_info(engine, user).await?;
                }
                // Make sure the portal exists for the messages that follow.
                engine.get_or_create_portal(event.chat_id).await?;
                Ok(())
            }
            MaxEventKind::MessageCreated => {
                let Some(message) = &event.message else {
                    return Ok(());
                };
                if !message.message_id.is_empty() {
                    let existing = MessageRow::get_by_max_id(
                        engine.store(),
                        event.chat_id,
                        &message.message_id,
                    )
                    .await?;
                    if existing.is_some() {
                        // Upstream echo of a message this bridge sent.
                        tracing::debug!(mid = %message.message_id, "dropping echoed message");
                        return Ok(());
                    }
                }
                let portal = engine.get_or_create_portal(event.chat_id).await?;
                portal.handle_max_message(engine, self, message).await
            }
            MaxEventKind::MessageEdited => {
                let Some(message_id) = event.any_message_id().map(str::to_string) else {
                    return Ok(());
                };
                let new_text = event
                    .new_text
                    .clone()
                    .or_else(|| {
                        event
                            .message
                            .as_ref()
                            .and_then(|message| message.text().map(str::to_string))
                    })
                    .unwrap_or_default();
                let portal = engine.get_or_create_portal(event.chat_id).await?;
                portal.handle_max_edit(engine, &message_id, &new_text).await
            }
            MaxEventKind::MessageRemoved => {
                let Some(message_id) = event.any_message_id().map(str::to_string) else {
                    return Ok(());
                };
                let portal = engine.get_or_create_portal(event.chat_id).await?;
                portal.handle_max_delete(engine, &message_id).await
            }
            MaxEventKind::ReactionChanged => {
                let (Some(sender_id), Some(message_id)) =
                    (event.sender_id, event.any_message_id().map(str::to_string))
                else {
                    return Ok(());
                };
                let emoji = event.reaction.clone().unwrap_or_default();
                let portal = engine.get_or_create_portal(event.chat_id).await?;
                portal
                    .handle_max_reaction(engine, sender_id, &message_id, &emoji)
                    .await
            }
            MaxEventKind::ReadMarker => {
                let (Some(sender_id), Some(message_id)) =
                    (event.sender_id, event.any_message_id())
                else {
                    return Ok(());
                };
                let portal = engine.get_or_create_portal(event.chat_id).await?;
                portal.handle_max_read(engine, sender_id, message_id).await;
                Ok(())
            }
            MaxEventKind::Typing => {
                let Some(sender_id) = event.sender_id else {
                    return Ok(());
                };
                let portal = engine.get_or_create_portal(event.chat_id).await?;
                portal.handle_max_typing(engine, sender_id).await;
                Ok(())
            }
            MaxEventKind::MessageCallback
            | MaxEventKind::BotAdded
            | MaxEventKind::BotRemoved
            | MaxEventKind::UserAdded
            | MaxEventKind::UserRemoved
            | MaxEventKind::ChatTitleChanged => {
                tracing::debug!(kind = ?event.kind, "event kind not bridged");
                Ok(())
            }
        }
    }

    /// Mirror the login handshake's chat list into portals.
    ///
    /// Dialogs get a synthetic peer resolved through the contacts map;
    /// already-materialized portals whose stored name is still the
    /// placeholder are renamed.
    pub async fn sync_chats(self: &Arc<Self>, engine: &Arc<Engine>, login: &LoginData) {
        let my_id = self.max_user_id().await;
        for raw in &login.chats {
            let Some(chat_id) = chat_id_of(raw) else {
                continue;
            };
            let chat_type = raw
                .get("type")
                .and_then(Value::as_str)
                .map_or(ChatType::Dialog, ChatType::from_wire);

            let mut chat = MaxChat {
                chat_id,
                chat_type,
                title: raw
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..MaxChat::default()
            };

            if chat_type == ChatType::Dialog {
                let peer = raw
                    .get("participants")
                    .map(parse_participant_ids)
                    .unwrap_or_default()
                    .into_iter()
                    .find(|id| Some(*id) != my_id);
                if let Some(peer_id) = peer {
                    let peer_user = login.contacts.get(&peer_id).cloned().unwrap_or(MaxUser {
                        user_id: peer_id,
                        name: peer_id.to_string(),
                        ..MaxUser::default()
                    });
                    chat.dialog_with_user = Some(peer_user);
                }
            }

            let portal = match engine.get_or_create_portal(chat_id).await {
                Ok(portal) => portal,
                Err(error) => {
                    tracing::warn!(chat_id, %error, "failed to load portal during sync");
                    continue;
                }
            };
            let result = if portal.mxid().await.is_none() {
                portal
                    .create_matrix_room(engine, self, Some(&chat))
                    .await
                    .map(|_| ())
            } else {
                portal.update_name(engine, &chat.display_title()).await
            };
            if let Err(error) = result {
                tracing::warn!(chat_id, %error, "chat sync failed for portal");
            }
        }
    }

    /// Refresh every non-self puppet from the contacts map.
    pub async fn sync_contacts(self: &Arc<Self>, engine: &Arc<Engine>, login: &LoginData) {
        let my_id = self.max_user_id().await;
        for (user_id, contact) in &login.contacts {
            if Some(*user_id) == my_id {
                continue;
            }
            match engine.get_or_create_puppet(*user_id).await {
                Ok(puppet) => {
                    if let Err(error) = puppet.update_info(engine, contact).await {
                        tracing::warn!(user_id, %error, "contact sync failed");
                    }
                }
                Err(error) => tracing::warn!(user_id, %error, "failed to load puppet"),
            }
        }
    }

    /// Test hook: install a client and credentials without connecting.
    #[cfg(test)]
    pub(crate) async fn attach_for_test(
        &self,
        client: Arc<dyn MaxClient>,
        max_user_id: Option<i64>,
    ) {
        {
            let mut state = self.state.write().await;
            state.max_token = Some("test-token".to_string());
            state.connection_mode = Some(ConnectionMode::User);
            state.max_user_id = max_user_id;
        }
        *self.client.write().await = Some(SessionClient {
            client,
            user_client: None,
        });
    }
}

fn chat_id_of(raw: &Value) -> Option<i64> {
    let obj = raw.as_object()?;
    obj.get("id")
        .or_else(|| obj.get("chatId"))
        .or_else(|| obj.get("chat_id"))
        .and_then(Value::as_i64)
}
