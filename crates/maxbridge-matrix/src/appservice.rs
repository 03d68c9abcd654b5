//! Application-service implementation of the intent capability.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::intent::{
    Intent, IntentError, IntentFactory, MessageContent, RoomCreateOptions,
};

/// Client for the Matrix client-server API with application-service
/// impersonation.
///
/// One instance is shared by every intent; ghost intents add a `user_id`
/// query parameter to act as their ghost.
pub struct AppserviceClient {
    shared: Arc<Shared>,
}

struct Shared {
    http: Client,
    base_url: String,
    as_token: String,
    bot_mxid: String,
}

impl AppserviceClient {
    /// Create a new application-service client.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        as_token: impl Into<String>,
        bot_mxid: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                http: Client::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                as_token: as_token.into(),
                bot_mxid: bot_mxid.into(),
            }),
        }
    }
}

impl IntentFactory for AppserviceClient {
    fn main(&self) -> Arc<dyn Intent> {
        Arc::new(AppserviceIntent {
            shared: Arc::clone(&self.shared),
            user_id: self.shared.bot_mxid.clone(),
            impersonate: false,
            registered: AtomicBool::new(true),
        })
    }

    fn ghost(&self, mxid: &str) -> Arc<dyn Intent> {
        Arc::new(AppserviceIntent {
            shared: Arc::clone(&self.shared),
            user_id: mxid.to_string(),
            impersonate: true,
            registered: AtomicBool::new(false),
        })
    }
}

/// An intent scoped to one Matrix user.
struct AppserviceIntent {
    shared: Arc<Shared>,
    user_id: String,
    impersonate: bool,
    registered: AtomicBool,
}

impl AppserviceIntent {
    fn client_url(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{path}", self.shared.base_url)
    }

    /// Generate a transaction id for idempotent sends.
    fn txn_id() -> String {
        format!("maxbridge_{}", uuid::Uuid::new_v4())
    }

    /// Call a client-server API endpoint as this intent's user.
    async fn call(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, IntentError> {
        let mut request = self
            .shared
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.shared.as_token));
        if self.impersonate {
            request = request.query(&[("user_id", &self.user_id)]);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IntentError::Transport(e.to_string()))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| IntentError::Decode(e.to_string()))?;
        if !status.is_success() {
            return Err(IntentError::Matrix {
                errcode: body
                    .get("errcode")
                    .and_then(Value::as_str)
                    .unwrap_or("M_UNKNOWN")
                    .to_string(),
                error: body
                    .get("error")
                    .and_then(Value::as_str)
                    .map_or_else(|| body.to_string(), str::to_string),
            });
        }
        Ok(body)
    }

    async fn put_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, IntentError> {
        let url = self.client_url(&format!(
            "/rooms/{}/send/{event_type}/{}",
            urlencoding::encode(room_id),
            Self::txn_id(),
        ));
        let response = self.call(reqwest::Method::PUT, &url, Some(content)).await?;
        response
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IntentError::Decode("no event_id in send response".to_string()))
    }
}

#[async_trait]
impl Intent for AppserviceIntent {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn ensure_registered(&self) -> Result<(), IntentError> {
        if self.registered.load(Ordering::SeqCst) {
            return Ok(());
        }
        let localpart = self
            .user_id
            .strip_prefix('@')
            .and_then(|rest| rest.split(':').next())
            .unwrap_or(&self.user_id);
        let url = self.client_url("/register");
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart,
        });
        match self.call(reqwest::Method::POST, &url, Some(&body)).await {
            Ok(_) => {}
            // Already registered is success for our purposes.
            Err(IntentError::Matrix { errcode, .. }) if errcode == "M_USER_IN_USE" => {}
            Err(error) => return Err(error),
        }
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_room(&self, options: RoomCreateOptions) -> Result<String, IntentError> {
        let mut body = json!({
            "is_direct": options.is_direct,
            "invite": options.invitees,
            "preset": "private_chat",
        });
        if let Some(name) = options.name {
            body["name"] = Value::String(name);
        }
        if let Some(topic) = options.topic {
            body["topic"] = Value::String(topic);
        }
        let url = self.client_url("/createRoom");
        let response = self.call(reqwest::Method::POST, &url, Some(&body)).await?;
        response
            .get("room_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IntentError::Decode("no room_id in create response".to_string()))
    }

    async fn send_message(
        &self,
        room_id: &str,
        content: &MessageContent,
    ) -> Result<String, IntentError> {
        self.ensure_registered().await?;
        let content =
            serde_json::to_value(content).map_err(|e| IntentError::Decode(e.to_string()))?;
        self.put_event(room_id, "m.room.message", &content).await
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, IntentError> {
        self.ensure_registered().await?;
        self.put_event(room_id, event_type, content).await
    }

    async fn send_reaction(
        &self,
        room_id: &str,
        target_event_id: &str,
        emoji: &str,
    ) -> Result<String, IntentError> {
        self.ensure_registered().await?;
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": target_event_id,
                "key": emoji,
            }
        });
        self.put_event(room_id, "m.reaction", &content).await
    }

    async fn redact(&self, room_id: &str, event_id: &str) -> Result<(), IntentError> {
        let url = self.client_url(&format!(
            "/rooms/{}/redact/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_id),
            Self::txn_id(),
        ));
        self.call(reqwest::Method::PUT, &url, Some(&json!({})))
            .await?;
        Ok(())
    }

    async fn set_displayname(&self, name: &str) -> Result<(), IntentError> {
        self.ensure_registered().await?;
        let url = self.client_url(&format!(
            "/profile/{}/displayname",
            urlencoding::encode(&self.user_id)
        ));
        self.call(
            reqwest::Method::PUT,
            &url,
            Some(&json!({"displayname": name})),
        )
        .await?;
        Ok(())
    }

    async fn set_avatar_url(&self, mxc: &str) -> Result<(), IntentError> {
        self.ensure_registered().await?;
        let url = self.client_url(&format!(
            "/profile/{}/avatar_url",
            urlencoding::encode(&self.user_id)
        ));
        self.call(reqwest::Method::PUT, &url, Some(&json!({"avatar_url": mxc})))
            .await?;
        Ok(())
    }

    async fn upload_media(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, IntentError> {
        let url = format!(
            "{}/_matrix/media/v3/upload?filename={}",
            self.shared.base_url,
            urlencoding::encode(filename),
        );
        let response = self
            .shared
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.shared.as_token))
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| IntentError::Transport(e.to_string()))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| IntentError::Decode(e.to_string()))?;
        if !status.is_success() {
            return Err(IntentError::Matrix {
                errcode: body
                    .get("errcode")
                    .and_then(Value::as_str)
                    .unwrap_or("M_UNKNOWN")
                    .to_string(),
                error: body.to_string(),
            });
        }
        body.get("content_uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IntentError::Decode("no content_uri in upload response".to_string()))
    }

    async fn download_media(&self, mxc: &str) -> Result<Vec<u8>, IntentError> {
        let path = mxc
            .strip_prefix("mxc://")
            .ok_or_else(|| IntentError::Decode(format!("not an mxc URI: {mxc}")))?;
        let url = format!("{}/_matrix/media/v3/download/{path}", self.shared.base_url);
        let response = self
            .shared
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.shared.as_token))
            .send()
            .await
            .map_err(|e| IntentError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(IntentError::Transport(format!(
                "media download failed: HTTP {}",
                response.status()
            )));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| IntentError::Transport(e.to_string()))?
            .to_vec())
    }

    async fn send_receipt(&self, room_id: &str, event_id: &str) -> Result<(), IntentError> {
        self.ensure_registered().await?;
        let url = self.client_url(&format!(
            "/rooms/{}/receipt/m.read/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_id),
        ));
        self.call(reqwest::Method::POST, &url, Some(&json!({})))
            .await?;
        Ok(())
    }

    async fn set_typing(&self, room_id: &str, typing: bool) -> Result<(), IntentError> {
        self.ensure_registered().await?;
        let url = self.client_url(&format!(
            "/rooms/{}/typing/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(&self.user_id),
        ));
        let body = if typing {
            json!({"typing": true, "timeout": 30_000})
        } else {
            json!({"typing": false})
        };
        self.call(reqwest::Method::PUT, &url, Some(&body)).await?;
        Ok(())
    }

    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<(), IntentError> {
        let url = self.client_url(&format!(
            "/rooms/{}/state/m.room.name",
            urlencoding::encode(room_id)
        ));
        self.call(reqwest::Method::PUT, &url, Some(&json!({"name": name})))
            .await?;
        Ok(())
    }
}
