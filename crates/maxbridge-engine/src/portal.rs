//! Portals: the per-chat binding between one Max chat and one Matrix room.
//!
//! A portal starts as a shadow (known in the store, no room), materializes
//! its room under a per-portal lock on first upstream traffic, and then
//! routes events in both directions while keeping the correlation tables
//! up to date.

use tokio::sync::{Mutex, RwLock};

use maxbridge_core::types::{is_placeholder_title, ChatType, MaxChat, MaxMessage};
use maxbridge_matrix::{MessageContent, RoomCreateOptions};
use maxbridge_store::{MessageRow, PortalRow, ReactionRow};

use crate::convert;
use crate::engine::Engine;
use crate::user::UserSession;
use crate::BridgeError;

/// A bridged chat.
pub struct Portal {
    max_chat_id: i64,
    state: RwLock<PortalState>,
    create_lock: Mutex<()>,
}

#[derive(Default)]
struct PortalState {
    mxid: Option<String>,
    name: Option<String>,
    encrypted: bool,
    relay_user_id: Option<String>,
}

impl Portal {
    pub(crate) fn from_row(max_chat_id: i64, row: Option<PortalRow>) -> Self {
        let state = row.map_or_else(PortalState::default, |row| PortalState {
            mxid: row.mxid,
            name: row.name,
            encrypted: row.encrypted,
            relay_user_id: row.relay_user_id,
        });
        Self {
            max_chat_id,
            state: RwLock::new(state),
            create_lock: Mutex::new(()),
        }
    }

    /// The Max chat this portal bridges.
    #[must_use]
    pub const fn max_chat_id(&self) -> i64 {
        self.max_chat_id
    }

    /// The Matrix room id, if materialized.
    pub async fn mxid(&self) -> Option<String> {
        self.state.read().await.mxid.clone()
    }

    /// The persisted display name.
    pub async fn name(&self) -> Option<String> {
        self.state.read().await.name.clone()
    }

    async fn save(&self, engine: &Engine) -> Result<(), BridgeError> {
        let state = self.state.read().await;
        PortalRow {
            max_chat_id: self.max_chat_id,
            mxid: state.mxid.clone(),
            name: state.name.clone(),
            encrypted: state.encrypted,
            relay_user_id: state.relay_user_id.clone(),
        }
        .upsert(engine.store())
        .await?;
        Ok(())
    }

    /// Create the Matrix room for this portal if it does not exist yet.
    ///
    /// Guarded by the per-portal lock so concurrent upstream and downstream
    /// triggers cannot produce two rooms; once assigned, the room id never
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns error if room creation or persistence fails.
    pub async fn create_matrix_room(
        &self,
        engine: &Engine,
        source: &UserSession,
        info: Option<&MaxChat>,
    ) -> Result<String, BridgeError> {
        if let Some(room_id) = self.mxid().await {
            return Ok(room_id);
        }

        let _guard = self.create_lock.lock().await;
        // Re-check after acquiring: the previous holder may have created it.
        if let Some(room_id) = self.mxid().await {
            return Ok(room_id);
        }

        if let Some(info) = info {
            self.state.write().await.name = Some(info.display_title());
        }
        let (name, is_direct) = {
            let state = self.state.read().await;
            (
                state.name.clone(),
                info.is_some_and(|info| info.chat_type == ChatType::Dialog),
            )
        };

        let room_id = engine
            .main_intent()
            .create_room(RoomCreateOptions {
                name,
                is_direct,
                invitees: vec![source.mxid.clone()],
                topic: None,
            })
            .await?;

        self.state.write().await.mxid = Some(room_id.clone());
        engine.register_portal_room(&room_id, self.max_chat_id).await;
        self.save(engine).await?;
        tracing::info!(
            chat_id = self.max_chat_id,
            room_id = %room_id,
            "created matrix room"
        );
        Ok(room_id)
    }

    /// Rename the portal when the persisted name is still the placeholder.
    ///
    /// # Errors
    ///
    /// Returns error on persistence failure.
    pub async fn update_name(&self, engine: &Engine, name: &str) -> Result<(), BridgeError> {
        let (current, room_id) = {
            let state = self.state.read().await;
            (state.name.clone(), state.mxid.clone())
        };
        let stale = current
            .as_deref()
            .is_none_or(|current| is_placeholder_title(current, self.max_chat_id));
        if !stale || name.is_empty() || current.as_deref() == Some(name) {
            return Ok(());
        }
        self.state.write().await.name = Some(name.to_string());
        if let Some(room_id) = room_id {
            if let Err(error) = engine.main_intent().set_room_name(&room_id, name).await {
                tracing::warn!(%error, "failed to rename room");
            }
        }
        self.save(engine).await
    }

    // ── Max → Matrix ────────────────────────────────────────────

    /// Relay an incoming Max message into the Matrix room.
    ///
    /// # Errors
    ///
    /// Returns error on send or persistence failure.
    pub async fn handle_max_message(
        &self,
        engine: &Engine,
        source: &UserSession,
        message: &MaxMessage,
    ) -> Result<(), BridgeError> {
        let Some(client) = source.client().await else {
            return Err(BridgeError::NotLoggedIn);
        };

        let room_id = match self.mxid().await {
            Some(room_id) => room_id,
            None => {
                // Materialize on first contact; chat info is best-effort.
                let info = match client.get_chat(self.max_chat_id).await {
                    Ok(info) => Some(info),
                    Err(error) => {
                        tracing::debug!(%error, "could not fetch chat info");
                        None
                    }
                };
                self.create_matrix_room(engine, source, info.as_ref())
                    .await?
            }
        };

        let intent = match &message.sender {
            Some(sender) => {
                let puppet = engine.get_or_create_puppet(sender.user_id).await?;
                if let Err(error) = puppet.update_info(engine, sender).await {
                    tracing::warn!(%error, "failed to update puppet profile");
                }
                puppet.intent()
            }
            None => engine.main_intent(),
        };

        let mut events = convert::max_to_matrix(message, client.as_ref(), intent.as_ref()).await;
        if events.is_empty() {
            return Ok(());
        }

        // Reply correlation: attach the relation to the first event.
        if let Some(reply_to) = message.reply_to() {
            if let Some(target) =
                MessageRow::get_by_max_id(engine.store(), self.max_chat_id, reply_to).await?
            {
                events[0].1["m.relates_to"] =
                    serde_json::json!({"m.in_reply_to": {"event_id": target.mxid}});
            }
        }

        let mut first_event_id: Option<String> = None;
        for (event_type, content) in &events {
            let event_id = intent.send_event(&room_id, event_type, content).await?;
            first_event_id.get_or_insert(event_id);
        }

        if let (Some(event_id), false) = (first_event_id, message.message_id.is_empty()) {
            MessageRow {
                max_chat_id: self.max_chat_id,
                max_msg_id: message.message_id.clone(),
                mxid: event_id,
                mx_room: room_id,
                timestamp: (message.timestamp != 0).then_some(message.timestamp),
            }
            .insert(engine.store())
            .await?;
        }
        Ok(())
    }

    /// Relay a Max edit as a Matrix replacement event.
    ///
    /// # Errors
    ///
    /// Returns error on send failure.
    pub async fn handle_max_edit(
        &self,
        engine: &Engine,
        message_id: &str,
        new_text: &str,
    ) -> Result<(), BridgeError> {
        let Some(room_id) = self.mxid().await else {
            return Ok(());
        };
        let Some(target) =
            MessageRow::get_by_max_id(engine.store(), self.max_chat_id, message_id).await?
        else {
            tracing::debug!(message_id, "edit for unmapped message");
            return Ok(());
        };
        let mut content = MessageContent::text(format!("* {new_text}"));
        content.set_edit(target.mxid, new_text);
        engine.main_intent().send_message(&room_id, &content).await?;
        Ok(())
    }

    /// Relay a Max deletion as a Matrix redaction.
    ///
    /// # Errors
    ///
    /// Returns error on redaction failure.
    pub async fn handle_max_delete(
        &self,
        engine: &Engine,
        message_id: &str,
    ) -> Result<(), BridgeError> {
        let Some(target) =
            MessageRow::get_by_max_id(engine.store(), self.max_chat_id, message_id).await?
        else {
            tracing::debug!(message_id, "delete for unmapped message");
            return Ok(());
        };
        engine
            .main_intent()
            .redact(&target.mx_room, &target.mxid)
            .await?;
        Ok(())
    }

    /// Relay a Max reaction change as a ghost-sent annotation.
    ///
    /// An empty emoji removes the sender's previous reaction. Max allows at
    /// most one reaction per user per message, so a new emoji replaces the
    /// old annotation.
    ///
    /// # Errors
    ///
    /// Returns error on send or persistence failure.
    pub async fn handle_max_reaction(
        &self,
        engine: &Engine,
        sender_id: i64,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), BridgeError> {
        let Some(target) =
            MessageRow::get_by_max_id(engine.store(), self.max_chat_id, message_id).await?
        else {
            tracing::debug!(message_id, "reaction for unmapped message");
            return Ok(());
        };
        let puppet = engine.get_or_create_puppet(sender_id).await?;
        let intent = puppet.intent();

        if let Some(existing) =
            ReactionRow::get_by_max_ids(engine.store(), self.max_chat_id, message_id, sender_id)
                .await?
        {
            if let Err(error) = intent.redact(&target.mx_room, &existing.mxid).await {
                tracing::debug!(%error, "failed to redact replaced reaction");
            }
            ReactionRow::delete_by_mxid(engine.store(), &existing.mxid).await?;
        }

        if emoji.is_empty() {
            return Ok(());
        }

        let event_id = intent
            .send_reaction(&target.mx_room, &target.mxid, emoji)
            .await?;
        ReactionRow {
            mxid: event_id,
            max_chat_id: self.max_chat_id,
            max_msg_id: message_id.to_string(),
            max_sender_id: sender_id,
            reaction: emoji.to_string(),
        }
        .upsert(engine.store())
        .await?;
        Ok(())
    }

    /// Relay a peer read marker as a ghost read receipt.
    pub async fn handle_max_read(&self, engine: &Engine, sender_id: i64, message_id: &str) {
        let Ok(Some(target)) =
            MessageRow::get_by_max_id(engine.store(), self.max_chat_id, message_id).await
        else {
            return;
        };
        let Ok(puppet) = engine.get_or_create_puppet(sender_id).await else {
            return;
        };
        if let Err(error) = puppet
            .intent()
            .send_receipt(&target.mx_room, &target.mxid)
            .await
        {
            tracing::debug!(%error, "failed to send read receipt");
        }
    }

    /// Relay a peer typing notification through the ghost.
    pub async fn handle_max_typing(&self, engine: &Engine, sender_id: i64) {
        let Some(room_id) = self.mxid().await else {
            return;
        };
        let Ok(puppet) = engine.get_or_create_puppet(sender_id).await else {
            return;
        };
        if let Err(error) = puppet.intent().set_typing(&room_id, true).await {
            tracing::debug!(%error, "failed to send typing notification");
        }
    }

    // ── Matrix → Max ────────────────────────────────────────────

    /// Relay a Matrix message into the Max chat.
    ///
    /// Replacement relations become edits; reply relations are resolved
    /// through the correlation table.
    ///
    /// # Errors
    ///
    /// Returns error on send or persistence failure.
    pub async fn handle_matrix_message(
        &self,
        engine: &Engine,
        sender: &UserSession,
        event_id: &str,
        content: &MessageContent,
    ) -> Result<(), BridgeError> {
        if !sender.is_logged_in().await {
            tracing::debug!(mxid = %sender.mxid, "sender is not logged in");
            return Ok(());
        }
        let Some(client) = sender.client().await else {
            tracing::debug!(mxid = %sender.mxid, "sender has no live client");
            return Ok(());
        };
        let Some(room_id) = self.mxid().await else {
            return Ok(());
        };

        let mut reply_to = None;
        if let Some(relates) = &content.relates_to {
            // An m.replace relation is an edit of an existing Max message,
            // not a new send.
            if relates.rel_type.as_deref() == Some("m.replace") {
                if let Some(target_event) = &relates.event_id {
                    let Some(target) =
                        MessageRow::get_by_mxid(engine.store(), target_event).await?
                    else {
                        tracing::debug!(%target_event, "edit of unmapped event");
                        return Ok(());
                    };
                    let new_text = content.new_content.as_ref().map_or_else(
                        || content.body.clone(),
                        |new_content| {
                            convert::html_to_text(
                                &new_content.body,
                                new_content.formatted_body.as_deref(),
                            )
                        },
                    );
                    client.edit_message(&target.max_msg_id, &new_text).await?;
                    return Ok(());
                }
            }
            if let Some(in_reply_to) = &relates.in_reply_to {
                reply_to = MessageRow::get_by_mxid(engine.store(), &in_reply_to.event_id)
                    .await?
                    .map(|row| row.max_msg_id);
            }
        }

        let bot_api = sender.is_bot_mode().await;
        let outgoing = convert::matrix_to_max(
            content,
            client.as_ref(),
            engine.main_intent().as_ref(),
            bot_api,
        )
        .await;
        if outgoing.text.is_empty() && outgoing.attachments.is_empty() {
            return Ok(());
        }

        let sent = client
            .send_message(
                self.max_chat_id,
                &outgoing.text,
                reply_to.as_deref(),
                &outgoing.attachments,
            )
            .await?;

        if !sent.message_id.is_empty() {
            MessageRow {
                max_chat_id: self.max_chat_id,
                max_msg_id: sent.message_id.clone(),
                mxid: event_id.to_string(),
                mx_room: room_id,
                timestamp: (sent.timestamp != 0).then_some(sent.timestamp),
            }
            .insert(engine.store())
            .await?;
        }
        Ok(())
    }

    /// Relay a Matrix redaction: reaction removal or message deletion.
    ///
    /// # Errors
    ///
    /// Returns error on client or persistence failure.
    pub async fn handle_matrix_redaction(
        &self,
        engine: &Engine,
        sender: &UserSession,
        redacted_event_id: &str,
    ) -> Result<(), BridgeError> {
        let Some(client) = sender.client().await else {
            return Ok(());
        };

        if let Some(reaction) = ReactionRow::get_by_mxid(engine.store(), redacted_event_id).await? {
            // Reaction removal: react with the empty string upstream.
            client
                .add_reaction(reaction.max_chat_id, &reaction.max_msg_id, "")
                .await?;
            ReactionRow::delete_by_mxid(engine.store(), redacted_event_id).await?;
            return Ok(());
        }

        if let Some(target) = MessageRow::get_by_mxid(engine.store(), redacted_event_id).await? {
            client.delete_message(&target.max_msg_id).await?;
        }
        Ok(())
    }

    /// Relay a Matrix reaction to Max.
    ///
    /// # Errors
    ///
    /// Returns error on client or persistence failure.
    pub async fn handle_matrix_reaction(
        &self,
        engine: &Engine,
        sender: &UserSession,
        event_id: &str,
        target_event_id: &str,
        emoji: &str,
    ) -> Result<(), BridgeError> {
        let Some(client) = sender.client().await else {
            return Ok(());
        };
        let Some(target) = MessageRow::get_by_mxid(engine.store(), target_event_id).await? else {
            tracing::debug!(target_event_id, "reaction on unmapped event");
            return Ok(());
        };
        client
            .add_reaction(self.max_chat_id, &target.max_msg_id, emoji)
            .await?;
        ReactionRow {
            mxid: event_id.to_string(),
            max_chat_id: self.max_chat_id,
            max_msg_id: target.max_msg_id,
            max_sender_id: sender.max_user_id().await.unwrap_or_default(),
            reaction: emoji.to_string(),
        }
        .upsert(engine.store())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ClientCall, FakeClient, FakeIntentFactory, IntentCall};
    use std::sync::Arc;
    use maxbridge_core::Config;
    use maxbridge_core::types::MaxUser;
    use maxbridge_store::Store;
    use serde_json::json;

    struct Fixture {
        engine: Arc<Engine>,
        intents: FakeIntentFactory,
        client: FakeClient,
        alice: Arc<UserSession>,
    }

    async fn fixture() -> Fixture {
        let mut config = Config::default();
        config.homeserver.domain = "example.com".to_string();
        let store = Store::in_memory().await.unwrap();
        let intents = FakeIntentFactory::new();
        let engine = Engine::new(config, store, Arc::new(intents.clone()));

        let alice = engine.get_or_create_user("@alice:example.com").await.unwrap();
        let client = FakeClient::new();
        alice
            .attach_for_test(Arc::new(client.clone()), Some(100))
            .await;

        Fixture {
            engine,
            intents,
            client,
            alice,
        }
    }

    fn dialog_chat(chat_id: i64, peer: &str, peer_id: i64) -> MaxChat {
        MaxChat {
            chat_id,
            chat_type: ChatType::Dialog,
            dialog_with_user: Some(MaxUser {
                user_id: peer_id,
                name: peer.to_string(),
                ..MaxUser::default()
            }),
            ..MaxChat::default()
        }
    }

    fn incoming(mid: &str, sender_id: i64, text: &str) -> MaxMessage {
        MaxMessage::from_value(&json!({
            "mid": mid,
            "timestamp": 1000,
            "sender": {"user_id": sender_id, "name": "Bob"},
            "body": {"text": text},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn upstream_dm_materialization() {
        let fx = fixture().await;
        fx.client.put_chat(dialog_chat(42, "Bob", 200));

        let portal = fx.engine.get_or_create_portal(42).await.unwrap();
        portal
            .handle_max_message(&fx.engine, &fx.alice, &incoming("m1", 200, "hi"))
            .await
            .unwrap();

        // Exactly one room, direct, named after the peer, inviting Alice.
        let rooms = fx.intents.created_rooms();
        assert_eq!(rooms.len(), 1);
        let creates: Vec<IntentCall> = fx
            .intents
            .calls()
            .into_iter()
            .filter(|call| matches!(call, IntentCall::CreateRoom { .. }))
            .collect();
        let IntentCall::CreateRoom {
            name,
            is_direct,
            invitees,
            ..
        } = &creates[0]
        else {
            panic!("expected create");
        };
        assert_eq!(name.as_deref(), Some("Bob"));
        assert!(*is_direct);
        assert_eq!(invitees, &vec!["@alice:example.com".to_string()]);

        // Ghost-authored text event.
        let sends: Vec<IntentCall> = fx
            .intents
            .calls()
            .into_iter()
            .filter(|call| matches!(call, IntentCall::SendEvent { .. }))
            .collect();
        let IntentCall::SendEvent {
            user_id, content, ..
        } = &sends[0]
        else {
            panic!("expected send");
        };
        assert_eq!(user_id, "@max_200:example.com");
        assert_eq!(content["body"], "hi");

        // Correlation row inserted.
        let row = MessageRow::get_by_max_id(fx.engine.store(), 42, "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.mx_room, rooms[0]);
    }

    #[tokio::test]
    async fn room_id_never_changes() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(5).await.unwrap();
        let first = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        let second = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.intents.created_rooms().len(), 1);
    }

    #[tokio::test]
    async fn reply_correlation() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room.clone(),
            timestamp: None,
        }
        .insert(fx.engine.store())
        .await
        .unwrap();

        let reply = MaxMessage::from_value(&json!({
            "mid": "b",
            "sender": {"user_id": 200, "name": "Bob"},
            "body": {"text": "re"},
            "link": {"type": "reply", "mid": "a"},
        }))
        .unwrap();
        portal
            .handle_max_message(&fx.engine, &fx.alice, &reply)
            .await
            .unwrap();

        let send = fx
            .intents
            .calls()
            .into_iter()
            .find_map(|call| match call {
                IntentCall::SendEvent { content, .. } => Some(content),
                _ => None,
            })
            .unwrap();
        assert_eq!(send["m.relates_to"]["m.in_reply_to"]["event_id"], "$e1");

        let row = MessageRow::get_by_max_id(fx.engine.store(), 7, "b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.mx_room, room);
    }

    #[tokio::test]
    async fn upstream_edit_sends_replacement() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room,
            timestamp: None,
        }
        .insert(fx.engine.store())
        .await
        .unwrap();

        portal
            .handle_max_edit(&fx.engine, "a", "fixed")
            .await
            .unwrap();

        let content = fx
            .intents
            .calls()
            .into_iter()
            .find_map(|call| match call {
                IntentCall::SendMessage { content, .. } => Some(content),
                _ => None,
            })
            .unwrap();
        assert_eq!(content["body"], "* fixed");
        assert_eq!(content["m.relates_to"]["rel_type"], "m.replace");
        assert_eq!(content["m.relates_to"]["event_id"], "$e1");
        assert_eq!(content["m.new_content"]["body"], "fixed");
    }

    #[tokio::test]
    async fn upstream_delete_redacts() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room.clone(),
            timestamp: None,
        }
        .insert(fx.engine.store())
        .await
        .unwrap();

        portal.handle_max_delete(&fx.engine, "a").await.unwrap();
        assert!(fx.intents.calls().iter().any(|call| matches!(
            call,
            IntentCall::Redact { room_id, event_id, .. }
                if room_id == &room && event_id == "$e1"
        )));
    }

    #[tokio::test]
    async fn unmapped_edit_and_delete_dropped() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        portal
            .handle_max_edit(&fx.engine, "ghost", "x")
            .await
            .unwrap();
        portal.handle_max_delete(&fx.engine, "ghost").await.unwrap();
        assert!(!fx.intents.calls().iter().any(|call| matches!(
            call,
            IntentCall::SendMessage { .. } | IntentCall::Redact { .. }
        )));
    }

    #[tokio::test]
    async fn downstream_edit_does_not_insert() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room,
            timestamp: None,
        }
        .insert(fx.engine.store())
        .await
        .unwrap();

        let mut content = MessageContent::text("* fixed");
        content.set_edit("$e1", "fixed");
        portal
            .handle_matrix_message(&fx.engine, &fx.alice, "$e2", &content)
            .await
            .unwrap();

        assert!(fx.client.calls().iter().any(|call| matches!(
            call,
            ClientCall::EditMessage { message_id, text }
                if message_id == "a" && text == "fixed"
        )));
        assert_eq!(
            MessageRow::count_by_chat(fx.engine.store(), 7).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn downstream_send_records_correlation() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();

        portal
            .handle_matrix_message(&fx.engine, &fx.alice, "$e5", &MessageContent::text("hello"))
            .await
            .unwrap();

        let sent_mid = fx
            .client
            .calls()
            .into_iter()
            .find_map(|call| match call {
                ClientCall::SendMessage { message_id, .. } => Some(message_id),
                _ => None,
            })
            .unwrap();
        let row = MessageRow::get_by_max_id(fx.engine.store(), 7, &sent_mid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.mxid, "$e5");
    }

    #[tokio::test]
    async fn downstream_reply_resolved_through_table() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room,
            timestamp: None,
        }
        .insert(fx.engine.store())
        .await
        .unwrap();

        let mut content = MessageContent::text("re");
        content.set_reply("$e1");
        portal
            .handle_matrix_message(&fx.engine, &fx.alice, "$e6", &content)
            .await
            .unwrap();

        assert!(fx.client.calls().iter().any(|call| matches!(
            call,
            ClientCall::SendMessage { reply_to, .. } if reply_to.as_deref() == Some("a")
        )));
    }

    #[tokio::test]
    async fn matrix_reaction_roundtrip_leaves_no_rows() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room,
            timestamp: None,
        }
        .insert(fx.engine.store())
        .await
        .unwrap();

        portal
            .handle_matrix_reaction(&fx.engine, &fx.alice, "$r1", "$e1", "👍")
            .await
            .unwrap();
        assert!(
            ReactionRow::get_by_mxid(fx.engine.store(), "$r1")
                .await
                .unwrap()
                .is_some()
        );

        portal
            .handle_matrix_redaction(&fx.engine, &fx.alice, "$r1")
            .await
            .unwrap();
        assert!(
            ReactionRow::get_by_mxid(fx.engine.store(), "$r1")
                .await
                .unwrap()
                .is_none()
        );
        assert!(fx.client.calls().iter().any(|call| matches!(
            call,
            ClientCall::AddReaction { emoji, .. } if emoji.is_empty()
        )));
    }

    #[tokio::test]
    async fn max_reaction_add_then_remove_leaves_no_rows() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room,
            timestamp: None,
        }
        .insert(fx.engine.store())
        .await
        .unwrap();

        portal
            .handle_max_reaction(&fx.engine, 200, "a", "👍")
            .await
            .unwrap();
        assert!(
            ReactionRow::get_by_max_ids(fx.engine.store(), 7, "a", 200)
                .await
                .unwrap()
                .is_some()
        );

        portal
            .handle_max_reaction(&fx.engine, 200, "a", "")
            .await
            .unwrap();
        assert!(
            ReactionRow::get_by_max_ids(fx.engine.store(), 7, "a", 200)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn read_marker_becomes_ghost_receipt() {
        let fx = fixture().await;
        let portal = fx.engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&fx.engine, &fx.alice, None)
            .await
            .unwrap();
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room,
            timestamp: None,
        }
        .insert(fx.engine.store())
        .await
        .unwrap();

        portal.handle_max_read(&fx.engine, 200, "a").await;
        assert!(fx.intents.calls().iter().any(|call| matches!(
            call,
            IntentCall::Receipt { user_id, event_id, .. }
                if user_id == "@max_200:example.com" && event_id == "$e1"
        )));
    }
}
