//! Matrix-side event dispatch.
//!
//! The application-service transaction layer hands parsed events to this
//! handler, which applies the ghost-sender guard and routes to the portal
//! owning the room.

use std::sync::Arc;

use maxbridge_matrix::MessageContent;

use crate::engine::Engine;

/// Dispatches Matrix events into the bridge.
pub struct MatrixHandler {
    engine: Arc<Engine>,
}

impl MatrixHandler {
    /// Create a handler over the engine.
    #[must_use]
    pub const fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Whether an event from this sender must be ignored.
    ///
    /// Any sender whose localpart matches the ghost template is the bridge
    /// talking to itself.
    fn is_own_echo(&self, sender: &str) -> bool {
        self.engine.is_ghost(sender)
    }

    /// Whether the sender passes the configured permission map.
    ///
    /// An empty map means no access control; otherwise the sender needs an
    /// entry for their mxid, their domain, or `*`.
    fn is_permitted(&self, sender: &str) -> bool {
        let config = self.engine.config();
        if config.bridge.permissions.is_empty() {
            return true;
        }
        config
            .permission_for(sender)
            .is_some_and(|level| !level.is_empty())
    }

    /// Handle an `m.room.message` event.
    pub async fn handle_message(
        &self,
        room_id: &str,
        sender: &str,
        event_id: &str,
        content: MessageContent,
    ) {
        if self.is_own_echo(sender) {
            return;
        }
        if !self.is_permitted(sender) {
            tracing::debug!(sender, "sender has no bridge permission");
            return;
        }
        let Ok(Some(portal)) = self.engine.portal_by_room(room_id).await else {
            return;
        };
        let Ok(user) = self.engine.get_or_create_user(sender).await else {
            return;
        };
        if !user.is_logged_in().await {
            return;
        }
        if let Err(error) = portal
            .handle_matrix_message(&self.engine, &user, event_id, &content)
            .await
        {
            tracing::error!(room_id, sender, %error, "failed to bridge matrix message");
        }
    }

    /// Handle an `m.reaction` event.
    pub async fn handle_reaction(
        &self,
        room_id: &str,
        sender: &str,
        event_id: &str,
        target_event_id: &str,
        emoji: &str,
    ) {
        if self.is_own_echo(sender) || !self.is_permitted(sender) {
            return;
        }
        let Ok(Some(portal)) = self.engine.portal_by_room(room_id).await else {
            return;
        };
        let Ok(user) = self.engine.get_or_create_user(sender).await else {
            return;
        };
        if !user.is_logged_in().await {
            return;
        }
        if let Err(error) = portal
            .handle_matrix_reaction(&self.engine, &user, event_id, target_event_id, emoji)
            .await
        {
            tracing::error!(room_id, sender, %error, "failed to bridge reaction");
        }
    }

    /// Handle an `m.room.redaction` event.
    pub async fn handle_redaction(&self, room_id: &str, sender: &str, redacted_event_id: &str) {
        if self.is_own_echo(sender) || !self.is_permitted(sender) {
            return;
        }
        let Ok(Some(portal)) = self.engine.portal_by_room(room_id).await else {
            return;
        };
        let Ok(user) = self.engine.get_or_create_user(sender).await else {
            return;
        };
        if !user.is_logged_in().await {
            return;
        }
        if let Err(error) = portal
            .handle_matrix_redaction(&self.engine, &user, redacted_event_id)
            .await
        {
            tracing::error!(room_id, sender, %error, "failed to bridge redaction");
        }
    }

    /// Handle a read receipt from a Matrix user.
    pub async fn handle_receipt(&self, room_id: &str, sender: &str, event_id: &str) {
        if self.is_own_echo(sender) {
            return;
        }
        let Ok(Some(portal)) = self.engine.portal_by_room(room_id).await else {
            return;
        };
        let Ok(Some(user)) = self.engine.get_user(sender).await else {
            return;
        };
        let Some(client) = user.client().await else {
            return;
        };
        let Ok(Some(row)) =
            maxbridge_store::MessageRow::get_by_mxid(self.engine.store(), event_id).await
        else {
            return;
        };
        if let Err(error) = client
            .mark_as_read(portal.max_chat_id(), &row.max_msg_id)
            .await
        {
            tracing::debug!(%error, "failed to forward read marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ClientCall, FakeClient, FakeIntentFactory};
    use maxbridge_core::Config;
    use maxbridge_store::{MessageRow, Store};

    async fn fixture() -> (MatrixHandler, Arc<Engine>, FakeClient, String) {
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

        let portal = engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&engine, &alice, None)
            .await
            .unwrap();

        let handler = MatrixHandler::new(Arc::clone(&engine));
        (handler, engine, client, room)
    }

    #[tokio::test]
    async fn ghost_senders_are_dropped() {
        let (handler, _engine, client, room) = fixture().await;
        handler
            .handle_message(
                &room,
                "@max_200:example.com",
                "$g1",
                MessageContent::text("echo"),
            )
            .await;
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn logged_in_sender_is_bridged() {
        let (handler, _engine, client, room) = fixture().await;
        handler
            .handle_message(
                &room,
                "@alice:example.com",
                "$m1",
                MessageContent::text("hi"),
            )
            .await;
        assert!(client.calls().iter().any(|call| matches!(
            call,
            ClientCall::SendMessage { text, .. } if text == "hi"
        )));
    }

    #[tokio::test]
    async fn unknown_room_is_ignored() {
        let (handler, _engine, client, _room) = fixture().await;
        handler
            .handle_message(
                "!elsewhere:example.com",
                "@alice:example.com",
                "$m2",
                MessageContent::text("hi"),
            )
            .await;
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn logged_out_sender_is_ignored() {
        let (handler, engine, client, room) = fixture().await;
        let carol = engine.get_or_create_user("@carol:example.com").await.unwrap();
        assert!(!carol.is_logged_in().await);
        handler
            .handle_message(&room, "@carol:example.com", "$m3", MessageContent::text("x"))
            .await;
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn permission_map_gates_senders() {
        let mut config = Config::default();
        config.homeserver.domain = "example.com".to_string();
        config
            .bridge
            .permissions
            .insert("example.com".to_string(), "user".to_string());
        let store = Store::in_memory().await.unwrap();
        let intents = FakeIntentFactory::new();
        let engine = Engine::new(config, store, Arc::new(intents));

        let alice = engine.get_or_create_user("@alice:example.com").await.unwrap();
        let client = FakeClient::new();
        alice
            .attach_for_test(Arc::new(client.clone()), Some(100))
            .await;
        let portal = engine.get_or_create_portal(7).await.unwrap();
        let room = portal
            .create_matrix_room(&engine, &alice, None)
            .await
            .unwrap();

        let handler = MatrixHandler::new(Arc::clone(&engine));

        // A stranger domain has no permission entry.
        let eve = engine.get_or_create_user("@eve:other.org").await.unwrap();
        let eve_client = FakeClient::new();
        eve.attach_for_test(Arc::new(eve_client.clone()), Some(999))
            .await;
        handler
            .handle_message(&room, "@eve:other.org", "$x1", MessageContent::text("nope"))
            .await;
        assert!(eve_client.calls().is_empty());

        handler
            .handle_message(&room, "@alice:example.com", "$x2", MessageContent::text("ok"))
            .await;
        assert!(!client.calls().is_empty());
    }

    #[tokio::test]
    async fn receipt_forwarded_as_mark_read() {
        let (handler, engine, client, room) = fixture().await;
        MessageRow {
            max_chat_id: 7,
            max_msg_id: "a".to_string(),
            mxid: "$e1".to_string(),
            mx_room: room.clone(),
            timestamp: None,
        }
        .insert(engine.store())
        .await
        .unwrap();

        handler
            .handle_receipt(&room, "@alice:example.com", "$e1")
            .await;
        assert!(client.calls().iter().any(|call| matches!(
            call,
            ClientCall::MarkAsRead { chat_id, message_id } if *chat_id == 7 && message_id == "a"
        )));
    }
}
