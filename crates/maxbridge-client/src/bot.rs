//! Max Bot API client: REST endpoints plus a long-polling update loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use maxbridge_core::types::{
    MaxChat, MaxEvent, MaxEventKind, MaxMessage, MaxUser, extract_chat_id, extract_message_id,
};

use crate::error::ClientError;
use crate::media::upload_type_for;
use crate::traits::{EventSender, MaxClient};

/// Sleep before retrying the long-poll after a non-rate-limit failure.
const POLL_RETRY: Duration = Duration::from_secs(5);

/// Max Bot API client.
///
/// Authenticates with a bot token in the `Authorization` header and receives
/// updates through `GET /updates` long-polling. Updates are at-least-once:
/// the marker only advances after a successful decode, so consumers must
/// tolerate duplicates.
#[derive(Clone)]
pub struct BotClient {
    inner: Arc<BotInner>,
}

struct BotInner {
    http: reqwest::Client,
    token: String,
    api_url: String,
    polling_timeout: u64,
    events: EventSender,
    running: AtomicBool,
    me: RwLock<Option<MaxUser>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl BotClient {
    /// Create a new Bot API client.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        api_url: impl Into<String>,
        polling_timeout: u64,
        events: EventSender,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(polling_timeout + 30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            inner: Arc::new(BotInner {
                http,
                token: token.into(),
                api_url: api_url.into().trim_end_matches('/').to_string(),
                polling_timeout,
                events,
                running: AtomicBool::new(false),
                me: RwLock::new(None),
                poll_task: Mutex::new(None),
            }),
        }
    }
}

impl BotInner {
    /// Make an API request and return the decoded JSON body.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let url = format!("{}{path}", self.api_url);
        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", &self.token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = response.status();

        match status.as_u16() {
            401 => return Err(ClientError::Auth("invalid bot token".to_string())),
            404 => return Err(ClientError::NotFound(path.to_string())),
            429 => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(5);
                return Err(ClientError::RateLimited { retry_after });
            }
            _ => {}
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        if status.as_u16() >= 400 {
            return Err(ClientError::Upstream {
                code: body
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                message: body
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| body.to_string(), str::to_string),
            });
        }
        Ok(body)
    }

    /// Continuously poll `/updates`, dispatching decoded events.
    ///
    /// Rate limits sleep `Retry-After`; any other failure sleeps five seconds
    /// and retries. Only an auth failure or cancellation ends the loop.
    async fn poll_loop(self: Arc<Self>) {
        tracing::debug!(timeout = self.polling_timeout, "starting long-poll loop");
        let mut marker: Option<i64> = None;
        while self.running.load(Ordering::SeqCst) {
            let mut query = vec![("timeout", self.polling_timeout.to_string())];
            if let Some(marker) = marker {
                query.push(("marker", marker.to_string()));
            }
            match self
                .request(reqwest::Method::GET, "/updates", &query, None)
                .await
            {
                Ok(response) => {
                    if let Some(next) = response.get("marker").and_then(Value::as_i64) {
                        marker = Some(next);
                    }
                    if let Some(updates) = response.get("updates").and_then(Value::as_array) {
                        for raw in updates {
                            self.handle_raw_update(raw);
                        }
                    }
                }
                Err(ClientError::RateLimited { retry_after }) => {
                    tracing::warn!(retry_after, "long-poll rate limited");
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                }
                Err(error @ ClientError::Auth(_)) => {
                    tracing::error!(%error, "bot token rejected, stopping poll loop");
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
                Err(error) => {
                    tracing::warn!(%error, "long-poll failed, retrying in 5s");
                    tokio::time::sleep(POLL_RETRY).await;
                }
            }
        }
    }

    /// Decode one raw update and emit it as a [`MaxEvent`].
    fn handle_raw_update(&self, raw: &Value) {
        tracing::debug!(update = %raw, "raw update");
        let Some(update_type) = raw.get("update_type").and_then(Value::as_str) else {
            return;
        };
        let Some(kind) = MaxEventKind::from_update_type(update_type) else {
            tracing::debug!(update_type, "unknown update type");
            return;
        };

        let message = raw.get("message").and_then(MaxMessage::from_value);
        let chat_id = extract_chat_id(raw)
            .or_else(|| message.as_ref().and_then(MaxMessage::chat_id))
            .unwrap_or(0);

        let mut event = MaxEvent::new(kind, chat_id);
        event.user = raw.get("user").and_then(MaxUser::from_value);
        event.message_id = extract_message_id(raw);
        event.new_text = message
            .as_ref()
            .and_then(|message| message.text().map(str::to_string));
        event.timestamp = raw.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
        event.message = message;

        if self.events.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}

#[async_trait]
impl MaxClient for BotClient {
    async fn connect(&self) -> Result<(), ClientError> {
        let response = self
            .inner
            .request(reqwest::Method::GET, "/me", &[], None)
            .await?;
        let mut me = MaxUser::from_value(&response)
            .ok_or_else(|| ClientError::Decode("invalid /me response".to_string()))?;
        me.is_bot = true;
        tracing::info!(name = %me.name, user_id = me.user_id, "authenticated as bot");
        *self.inner.me.write().await = Some(me);

        self.inner.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(Arc::clone(&self.inner).poll_loop());
        *self.inner.poll_task.lock().await = Some(task);
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.poll_task.lock().await.take() {
            task.abort();
        }
    }

    async fn is_connected(&self) -> bool {
        if !self.inner.running.load(Ordering::SeqCst) {
            return false;
        }
        self.inner
            .poll_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn profile(&self) -> Option<MaxUser> {
        self.inner.me.read().await.clone()
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<&str>,
        attachments: &[Value],
    ) -> Result<MaxMessage, ClientError> {
        let mut body = json!({"text": text});
        if !attachments.is_empty() {
            body["attachments"] = Value::Array(attachments.to_vec());
        }
        if let Some(reply_to) = reply_to {
            body["link"] = json!({"type": "reply", "mid": reply_to});
        }
        let response = self
            .inner
            .request(
                reqwest::Method::POST,
                "/messages",
                &[("chat_id", chat_id.to_string())],
                Some(&body),
            )
            .await?;
        // The sent message may be wrapped under a "message" key.
        let raw = response.get("message").unwrap_or(&response);
        MaxMessage::from_value(raw)
            .ok_or_else(|| ClientError::Decode("invalid send response".to_string()))
    }

    async fn edit_message(&self, message_id: &str, text: &str) -> Result<(), ClientError> {
        self.inner
            .request(
                reqwest::Method::PUT,
                "/messages",
                &[("message_id", message_id.to_string())],
                Some(&json!({"text": text})),
            )
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ClientError> {
        self.inner
            .request(
                reqwest::Method::DELETE,
                "/messages",
                &[("message_id", message_id.to_string())],
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_chat(&self, chat_id: i64) -> Result<MaxChat, ClientError> {
        let response = self
            .inner
            .request(reqwest::Method::GET, &format!("/chats/{chat_id}"), &[], None)
            .await?;
        serde_json::from_value(response).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn get_chat_members(&self, chat_id: i64) -> Result<Vec<MaxUser>, ClientError> {
        let response = self
            .inner
            .request(
                reqwest::Method::GET,
                &format!("/chats/{chat_id}/members"),
                &[],
                None,
            )
            .await?;
        let members = response
            .get("members")
            .and_then(Value::as_array)
            .map(|members| members.iter().filter_map(MaxUser::from_value).collect())
            .unwrap_or_default();
        Ok(members)
    }

    async fn get_user_info(&self, user_id: i64) -> Result<MaxUser, ClientError> {
        // The Bot API has no user lookup endpoint; return the id-only stub.
        tracing::debug!(user_id, "get_user_info not supported by the Bot API");
        Ok(MaxUser {
            user_id,
            name: user_id.to_string(),
            ..MaxUser::default()
        })
    }

    async fn download_media(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .inner
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "download failed: HTTP {}",
                response.status()
            )));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .to_vec())
    }

    async fn upload_media(
        &self,
        data: Vec<u8>,
        filename: &str,
        content_type: &str,
    ) -> Result<String, ClientError> {
        // Step 1: obtain the upload URL for the media class.
        let response = self
            .inner
            .request(
                reqwest::Method::POST,
                "/uploads",
                &[("type", upload_type_for(content_type).to_string())],
                None,
            )
            .await?;
        let upload_url = response
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("no upload URL returned".to_string()))?;

        // Step 2: multipart-post the bytes to it.
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let upload = self
            .inner
            .http
            .post(upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !upload.status().is_success() {
            return Err(ClientError::Transport(format!(
                "upload failed: HTTP {}",
                upload.status()
            )));
        }
        let result: Value = upload
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        result
            .get("token")
            .or_else(|| result.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Decode("no token in upload response".to_string()))
    }

    async fn add_reaction(
        &self,
        _chat_id: i64,
        _message_id: &str,
        _emoji: &str,
    ) -> Result<(), ClientError> {
        tracing::debug!("add_reaction not supported by the Bot API");
        Ok(())
    }

    async fn mark_as_read(&self, _chat_id: i64, _message_id: &str) -> Result<(), ClientError> {
        tracing::debug!("mark_as_read not supported by the Bot API");
        Ok(())
    }
}
