//! Max user client over the framed WebSocket protocol.
//!
//! One client owns one WebSocket. The listener task demultiplexes responses
//! into a seq-keyed pending table and turns server-originated frames into
//! normalized events. The send path is serialized by a mutex so sequence
//! allocation, pending-table insertion and the frame write appear atomic to
//! concurrent callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use maxbridge_core::types::{
    MaxChat, MaxEvent, MaxEventKind, MaxMessage, MaxUser, extract_chat_id, extract_message_id,
};

use crate::error::ClientError;
use crate::protocol::{
    Cmd, Frame, decode_error_payload, login_by_token_payload, opcode, session_init_payload,
};
use crate::traits::{EventSender, MaxClient};

/// Origin header the server requires; connections without it get a 403.
const WS_ORIGIN: &str = "https://web.max.ru";
/// Desktop browser user agent the server expects.
const WS_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Default timeout waiting for a response frame.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Keepalive interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How many recent chats to request in the login handshake.
const LOGIN_CHATS_COUNT: u32 = 40;
/// Overall QR flow deadline.
const QR_TIMEOUT: Duration = Duration::from_secs(120);
/// Delay between QR polls.
const QR_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Delay before retrying a failed QR poll.
const QR_POLL_RETRY: Duration = Duration::from_secs(2);

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type PendingSlot = oneshot::Sender<Result<Value, ClientError>>;

/// Data returned by the `LOGIN_BY_TOKEN` handshake.
#[derive(Debug, Clone, Default)]
pub struct LoginData {
    /// Refreshed login token, when the server rotated it.
    pub token: Option<String>,
    /// The viewer's own profile.
    pub profile: Option<MaxUser>,
    /// Raw descriptors of the most recent chats.
    pub chats: Vec<Value>,
    /// Contact book keyed by user id.
    pub contacts: HashMap<i64, MaxUser>,
}

/// First response of the phone auth flow.
#[derive(Debug, Clone)]
pub struct PhoneAuthStart {
    /// Opaque flow token to echo in `CHECK_CODE`.
    pub flow_token: String,
    /// Length of the SMS code, when the server announces it.
    pub code_length: Option<u64>,
}

/// Terminal result of an auth flow.
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// The long-lived login token to persist.
    pub token: String,
    /// The authenticated profile, when included.
    pub profile: Option<MaxUser>,
}

/// Response of `QR_GENERATE`.
#[derive(Debug, Clone)]
pub struct QrStart {
    /// Track id to poll with.
    pub track_id: String,
    /// Link to render as a QR code.
    pub qr_link: String,
    /// Expiry timestamp in milliseconds.
    pub expires_at: Option<i64>,
    /// Server-suggested polling interval in milliseconds.
    pub polling_interval: Option<u64>,
}

/// Response of `QR_POLL`.
#[derive(Debug, Clone)]
pub struct QrStatus {
    /// Whether the QR was scanned and login can be confirmed.
    pub login_available: bool,
    /// Expiry timestamp in milliseconds.
    pub expires_at: Option<i64>,
}

impl QrStatus {
    /// Whether the code expired relative to the given time.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|expires| expires < now_ms)
    }
}

/// Max user client.
#[derive(Clone)]
pub struct UserClient {
    inner: Arc<UserInner>,
}

struct UserInner {
    ws_url: String,
    upload_url: String,
    http: reqwest::Client,
    events: EventSender,
    auth_token: RwLock<Option<String>>,
    device_id: RwLock<String>,
    me: RwLock<Option<MaxUser>>,
    login_data: RwLock<Option<LoginData>>,
    send: Mutex<SendState>,
    pending: Mutex<HashMap<u64, PendingSlot>>,
    connected: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct SendState {
    writer: Option<WsWriter>,
    seq: u64,
}

impl UserClient {
    /// Create a new user client.
    ///
    /// `auth_token` may be `None` for clients that will run a provisioning
    /// auth flow before connecting.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(
        ws_url: impl Into<String>,
        upload_url: impl Into<String>,
        auth_token: Option<String>,
        events: EventSender,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            inner: Arc::new(UserInner {
                ws_url: ws_url.into(),
                upload_url: upload_url.into(),
                http,
                events,
                auth_token: RwLock::new(auth_token),
                device_id: RwLock::new(uuid::Uuid::new_v4().to_string()),
                me: RwLock::new(None),
                login_data: RwLock::new(None),
                send: Mutex::new(SendState::default()),
                pending: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The currently stored login token.
    pub async fn auth_token(&self) -> Option<String> {
        self.inner.auth_token.read().await.clone()
    }

    /// Replace the stored login token.
    pub async fn set_auth_token(&self, token: Option<String>) {
        *self.inner.auth_token.write().await = token;
    }

    /// Data from the last successful login handshake.
    pub async fn login_data(&self) -> Option<LoginData> {
        self.inner.login_data.read().await.clone()
    }

    /// Open the socket and run `INIT_SESSION` without logging in.
    ///
    /// Provisioning flows use this to drive phone/QR authentication on a
    /// client that has no token yet.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be opened or the handshake fails.
    pub async fn connect_for_auth(&self) -> Result<(), ClientError> {
        self.inner.clone().open_socket().await
    }

    /// Start the phone + SMS auth flow.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the phone number.
    pub async fn start_phone_auth(
        &self,
        phone: &str,
        language: &str,
    ) -> Result<PhoneAuthStart, ClientError> {
        self.phone_auth_request(phone, language, "START_AUTH").await
    }

    /// Ask the server to re-send the SMS code.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the request.
    pub async fn resend_phone_code(
        &self,
        phone: &str,
        language: &str,
    ) -> Result<PhoneAuthStart, ClientError> {
        self.phone_auth_request(phone, language, "RESEND").await
    }

    async fn phone_auth_request(
        &self,
        phone: &str,
        language: &str,
        auth_type: &str,
    ) -> Result<PhoneAuthStart, ClientError> {
        self.ensure_socket().await?;
        let payload = self
            .inner
            .send_and_wait(
                opcode::START_PHONE_AUTH,
                json!({"phone": phone, "type": auth_type, "language": language}),
                REQUEST_TIMEOUT,
            )
            .await?;
        let flow_token = payload
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("no flow token in auth response".to_string()))?
            .to_string();
        Ok(PhoneAuthStart {
            flow_token,
            code_length: payload.get("codeLength").and_then(Value::as_u64),
        })
    }

    /// Submit the SMS verification code and obtain the login token.
    ///
    /// # Errors
    ///
    /// Returns error if the code is rejected.
    pub async fn check_code(&self, flow_token: &str, code: &str) -> Result<AuthResult, ClientError> {
        let payload = self
            .inner
            .send_and_wait(
                opcode::CHECK_CODE,
                json!({
                    "token": flow_token,
                    "verifyCode": code,
                    "authTokenType": "CHECK_CODE",
                }),
                REQUEST_TIMEOUT,
            )
            .await?;
        let result = parse_auth_result(&payload)?;
        self.set_auth_token(Some(result.token.clone())).await;
        Ok(result)
    }

    /// Generate a QR login code.
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot start a QR flow.
    pub async fn generate_qr(&self) -> Result<QrStart, ClientError> {
        self.ensure_socket().await?;
        let payload = self
            .inner
            .send_and_wait(opcode::QR_GENERATE, json!({}), REQUEST_TIMEOUT)
            .await?;
        Ok(QrStart {
            track_id: payload
                .get("trackId")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::Decode("no trackId in QR response".to_string()))?
                .to_string(),
            qr_link: payload
                .get("qrLink")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            expires_at: payload.get("expiresAt").and_then(Value::as_i64),
            polling_interval: payload.get("pollingInterval").and_then(Value::as_u64),
        })
    }

    /// Poll a QR login once.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    pub async fn poll_qr(&self, track_id: &str) -> Result<QrStatus, ClientError> {
        let payload = self
            .inner
            .send_and_wait(
                opcode::QR_POLL,
                json!({"trackId": track_id}),
                REQUEST_TIMEOUT,
            )
            .await?;
        let status = payload.get("status").unwrap_or(&Value::Null);
        Ok(QrStatus {
            login_available: status
                .get("loginAvailable")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            expires_at: status.get("expiresAt").and_then(Value::as_i64),
        })
    }

    /// Confirm a scanned QR login and obtain the login token.
    ///
    /// # Errors
    ///
    /// Returns error if the login cannot be confirmed.
    pub async fn confirm_qr(&self, track_id: &str) -> Result<AuthResult, ClientError> {
        let payload = self
            .inner
            .send_and_wait(
                opcode::QR_CONFIRM,
                json!({"trackId": track_id}),
                REQUEST_TIMEOUT,
            )
            .await?;
        let result = parse_auth_result(&payload)?;
        self.set_auth_token(Some(result.token.clone())).await;
        Ok(result)
    }

    /// Poll a QR login until it completes, expires, or times out.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Auth`] when the code expires and
    /// [`ClientError::Timeout`] at the overall deadline.
    pub async fn wait_for_qr(&self, track_id: &str) -> Result<AuthResult, ClientError> {
        let deadline = tokio::time::Instant::now() + QR_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout("QR login".to_string()));
            }
            match self.poll_qr(track_id).await {
                Ok(status) if status.login_available => return self.confirm_qr(track_id).await,
                Ok(status) if status.is_expired(now_ms()) => {
                    return Err(ClientError::Auth("QR code expired".to_string()));
                }
                Ok(_) => tokio::time::sleep(QR_POLL_INTERVAL).await,
                Err(error @ (ClientError::Auth(_) | ClientError::Upstream { .. })) => {
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(%error, "QR poll failed, retrying");
                    tokio::time::sleep(QR_POLL_RETRY).await;
                }
            }
        }
    }

    /// Clear credentials and regenerate the device id.
    pub async fn logout(&self) {
        self.disconnect().await;
        self.set_auth_token(None).await;
        *self.inner.device_id.write().await = uuid::Uuid::new_v4().to_string();
    }

    async fn ensure_socket(&self) -> Result<(), ClientError> {
        let has_writer = self.inner.send.lock().await.writer.is_some();
        if has_writer {
            return Ok(());
        }
        self.inner.clone().open_socket().await
    }
}

impl UserInner {
    /// Open the WebSocket, start the listener, and run `INIT_SESSION`.
    ///
    /// The listener starts before the first request: responses arrive
    /// asynchronously and must already be demultiplexed.
    async fn open_socket(self: Arc<Self>) -> Result<(), ClientError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "Origin",
            WS_ORIGIN
                .parse()
                .map_err(|_| ClientError::Transport("invalid origin header".to_string()))?,
        );
        headers.insert(
            "User-Agent",
            WS_USER_AGENT
                .parse()
                .map_err(|_| ClientError::Transport("invalid user agent header".to_string()))?,
        );

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (writer, reader) = stream.split();

        {
            let mut send = self.send.lock().await;
            send.writer = Some(writer);
            send.seq = 0;
        }

        let listener = tokio::spawn(Arc::clone(&self).listen_loop(reader));
        self.tasks.lock().await.push(listener);

        let device_id = self.device_id.read().await.clone();
        match self
            .send_and_wait(
                opcode::INIT_SESSION,
                session_init_payload(&device_id),
                REQUEST_TIMEOUT,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                // Leave no half-open socket behind on handshake failure.
                self.teardown().await;
                Err(error)
            }
        }
    }

    /// Allocate a seq, register the pending slot, and write the frame.
    async fn send_request(
        &self,
        op: u16,
        payload: Value,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, ClientError>>), ClientError> {
        let mut send = self.send.lock().await;
        send.seq += 1;
        let seq = send.seq;
        let writer = send.writer.as_mut().ok_or(ClientError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let frame = Frame::request(seq, op, payload);
        let text =
            serde_json::to_string(&frame).map_err(|e| ClientError::Decode(e.to_string()))?;
        if let Err(error) = writer.send(WsMessage::Text(text)).await {
            self.pending.lock().await.remove(&seq);
            return Err(ClientError::Transport(error.to_string()));
        }
        Ok((seq, rx))
    }

    /// Send a request and await its response.
    async fn send_and_wait(
        &self,
        op: u16,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let (seq, rx) = self.send_request(op, payload).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                Err(ClientError::Timeout(format!("opcode {op}")))
            }
        }
    }

    /// Answer a server-originated request.
    async fn respond(&self, seq: u64, op: u16, payload: Value) -> Result<(), ClientError> {
        let mut send = self.send.lock().await;
        let writer = send.writer.as_mut().ok_or(ClientError::NotConnected)?;
        let frame = Frame::response(seq, op, payload);
        let text =
            serde_json::to_string(&frame).map_err(|e| ClientError::Decode(e.to_string()))?;
        writer
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn remove_pending(&self, seq: u64) -> Option<PendingSlot> {
        self.pending.lock().await.remove(&seq)
    }

    /// Read frames until the socket closes.
    async fn listen_loop(self: Arc<Self>, mut reader: WsReader) {
        while let Some(message) = reader.next().await {
            match message {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => self.handle_frame(frame).await,
                    Err(error) => {
                        tracing::warn!(%error, "undecodable frame, continuing");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Ok(WsMessage::Close(_)) => {
                    tracing::info!("websocket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, "websocket read error");
                    break;
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.cancel_pending().await;
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame.command() {
            Some(Cmd::Response | Cmd::Ack) => {
                if let Some(slot) = self.remove_pending(frame.seq).await {
                    let _ = slot.send(Ok(frame.payload.unwrap_or(Value::Null)));
                } else {
                    tracing::debug!(seq = frame.seq, "response with no pending request");
                }
            }
            Some(Cmd::Error) => {
                let (code, message) = decode_error_payload(frame.payload.as_ref());
                if let Some(slot) = self.remove_pending(frame.seq).await {
                    let _ = slot.send(Err(ClientError::Upstream { code, message }));
                } else {
                    tracing::warn!(%code, %message, "unsolicited error frame");
                }
            }
            Some(Cmd::Request) => self.handle_server_request(frame).await,
            None => tracing::debug!(cmd = frame.cmd, "frame with unknown cmd"),
        }
    }

    /// Handle a request the server initiated.
    async fn handle_server_request(&self, frame: Frame) {
        let payload = frame.payload.unwrap_or(Value::Null);
        match frame.opcode {
            opcode::HEARTBEAT => {
                if let Err(error) = self.respond(frame.seq, opcode::HEARTBEAT, json!({})).await {
                    tracing::debug!(%error, "failed to echo heartbeat");
                }
            }
            opcode::INCOMING_MESSAGE => {
                // Ack before dispatching so a handler failure cannot stall
                // the server's delivery cursor.
                let message_id = extract_message_id(&payload)
                    .or_else(|| payload.get("message").and_then(extract_message_id));
                let chat_id = incoming_chat_id(&payload);
                let ack = json!({"chatId": chat_id, "messageId": message_id});
                if let Err(error) = self.respond(frame.seq, frame.opcode, ack).await {
                    tracing::debug!(%error, "failed to ack incoming message");
                }
                if let Some(event) = decode_incoming_message(&payload) {
                    self.emit(event);
                }
            }
            opcode::INCOMING_EDIT => {
                let message = payload
                    .get("message")
                    .and_then(MaxMessage::from_value)
                    .or_else(|| MaxMessage::from_value(&payload));
                let mut event =
                    MaxEvent::new(MaxEventKind::MessageEdited, incoming_chat_id(&payload));
                event.message_id = extract_message_id(&payload)
                    .or_else(|| message.as_ref().map(|m| m.message_id.clone()));
                event.new_text = payload
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| {
                        message
                            .as_ref()
                            .and_then(|m| m.text().map(str::to_string))
                    });
                event.message = message;
                self.emit(event);
            }
            opcode::INCOMING_DELETE => {
                let mut event =
                    MaxEvent::new(MaxEventKind::MessageRemoved, incoming_chat_id(&payload));
                event.message_id = extract_message_id(&payload)
                    .or_else(|| payload.get("message").and_then(extract_message_id));
                self.emit(event);
            }
            opcode::INCOMING_READ => {
                let mut event = MaxEvent::new(MaxEventKind::ReadMarker, incoming_chat_id(&payload));
                event.sender_id = incoming_sender_id(&payload);
                event.message_id = extract_message_id(&payload);
                self.emit(event);
            }
            opcode::INCOMING_TYPING => {
                let mut event = MaxEvent::new(MaxEventKind::Typing, incoming_chat_id(&payload));
                event.sender_id = incoming_sender_id(&payload);
                self.emit(event);
            }
            other => tracing::debug!(opcode = other, "unhandled server request"),
        }
    }

    fn emit(&self, event: MaxEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }

    /// Keepalive: heartbeat every 30 seconds.
    async fn keepalive_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if !self.connected.load(Ordering::SeqCst) {
                break;
            }
            if let Err(error) = self
                .send_and_wait(
                    opcode::HEARTBEAT,
                    json!({"interactive": true}),
                    Duration::from_secs(10),
                )
                .await
            {
                tracing::debug!(%error, "heartbeat failed");
            }
        }
    }

    /// Close the socket, stop tasks, and cancel every pending slot.
    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(mut writer) = self.send.lock().await.writer.take() {
            let _ = writer.close().await;
        }
        self.cancel_pending().await;
    }

    async fn cancel_pending(&self) {
        let slots: Vec<PendingSlot> = self
            .pending
            .lock()
            .await
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            let _ = slot.send(Err(ClientError::NotConnected));
        }
    }
}

/// Chat id from an incoming frame payload: top level preferred, then nested
/// inside the message.
fn incoming_chat_id(payload: &Value) -> i64 {
    extract_chat_id(payload)
        .or_else(|| payload.get("message").and_then(extract_chat_id))
        .or_else(|| {
            payload
                .get("message")
                .and_then(MaxMessage::from_value)
                .and_then(|message| message.chat_id())
        })
        .unwrap_or(0)
}

fn incoming_sender_id(payload: &Value) -> Option<i64> {
    payload
        .get("userId")
        .or_else(|| payload.get("user_id"))
        .or_else(|| payload.get("sender"))
        .and_then(Value::as_i64)
}

/// Decode an `INCOMING_MESSAGE` payload into a normalized event.
///
/// Frames carrying a `reaction` field describe a reaction change rather than
/// a new message.
fn decode_incoming_message(payload: &Value) -> Option<MaxEvent> {
    let chat_id = incoming_chat_id(payload);

    if let Some(reaction) = payload.get("reaction") {
        let emoji = match reaction {
            Value::String(emoji) => emoji.clone(),
            Value::Object(fields) => fields
                .get("reaction")
                .or_else(|| fields.get("emoji"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };
        let mut event = MaxEvent::new(MaxEventKind::ReactionChanged, chat_id);
        event.reaction = Some(emoji);
        event.sender_id = incoming_sender_id(payload).or_else(|| {
            payload
                .get("message")
                .and_then(|message| message.get("sender"))
                .and_then(MaxUser::from_value)
                .map(|user| user.user_id)
        });
        event.message_id = extract_message_id(payload)
            .or_else(|| payload.get("message").and_then(extract_message_id));
        return Some(event);
    }

    let raw = payload.get("message").unwrap_or(payload);
    let message = MaxMessage::from_value(raw)?;
    let mut event = MaxEvent::new(MaxEventKind::MessageCreated, chat_id);
    event.timestamp = message.timestamp;
    event.message = Some(message);
    Some(event)
}

/// Parse the terminal payload of an auth flow.
fn parse_auth_result(payload: &Value) -> Result<AuthResult, ClientError> {
    let token = payload
        .pointer("/tokenAttrs/LOGIN/token")
        .or_else(|| payload.get("token"))
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Auth("no login token in auth response".to_string()))?
        .to_string();
    Ok(AuthResult {
        token,
        profile: payload.get("profile").and_then(MaxUser::from_value),
    })
}

/// Parse the `LOGIN_BY_TOKEN` response.
fn parse_login_data(payload: &Value) -> LoginData {
    let token = payload
        .pointer("/tokenAttrs/LOGIN/token")
        .or_else(|| payload.get("token"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let profile = payload
        .get("profile")
        .or_else(|| payload.get("viewer"))
        .and_then(MaxUser::from_value);
    let chats = payload
        .get("chats")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut contacts = HashMap::new();
    match payload.get("contacts") {
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let Some(user) = MaxUser::from_value(entry) {
                    contacts.insert(user.user_id, user);
                }
            }
        }
        Some(Value::Object(entries)) => {
            for value in entries.values() {
                if let Some(user) = MaxUser::from_value(value) {
                    contacts.insert(user.user_id, user);
                }
            }
        }
        _ => {}
    }

    LoginData {
        token,
        profile,
        chats,
        contacts,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl MaxClient for UserClient {
    async fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected().await {
            self.disconnect().await;
        }
        let Some(token) = self.auth_token().await else {
            return Err(ClientError::Auth(
                "no saved login token; complete a provisioning flow first".to_string(),
            ));
        };

        self.inner.clone().open_socket().await?;

        let response = match self
            .inner
            .send_and_wait(
                opcode::LOGIN_BY_TOKEN,
                login_by_token_payload(&token, LOGIN_CHATS_COUNT),
                REQUEST_TIMEOUT,
            )
            .await
        {
            Ok(response) => response,
            Err(error) => {
                self.inner.teardown().await;
                return Err(match error {
                    ClientError::Upstream { code, message } => {
                        ClientError::Auth(format!("token login failed: {code}: {message}"))
                    }
                    other => other,
                });
            }
        };

        let login = parse_login_data(&response);
        if let Some(refreshed) = &login.token {
            // The server rotates the token on every login; persistence is the
            // session layer's job after it reads login_data.
            self.set_auth_token(Some(refreshed.clone())).await;
        }
        if let Some(profile) = &login.profile {
            tracing::info!(
                name = %profile.name,
                user_id = profile.user_id,
                "authenticated as user"
            );
        }
        *self.inner.me.write().await = login.profile.clone();
        *self.inner.login_data.write().await = Some(login);

        self.inner.connected.store(true, Ordering::SeqCst);
        let keepalive = tokio::spawn(Arc::clone(&self.inner).keepalive_loop());
        self.inner.tasks.lock().await.push(keepalive);
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.teardown().await;
    }

    async fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
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
        let mut payload = json!({"chatId": chat_id, "text": text});
        if let Some(reply_to) = reply_to {
            payload["replyTo"] = Value::String(reply_to.to_string());
        }
        if !attachments.is_empty() {
            payload["attachments"] = Value::Array(attachments.to_vec());
        }
        let response = self
            .inner
            .send_and_wait(opcode::SEND_MESSAGE, payload, REQUEST_TIMEOUT)
            .await?;

        // The response carries the server-assigned id; the body is echoed
        // locally so the caller can record the correlation before the server
        // re-broadcasts the message.
        let message_id = extract_message_id(&response)
            .or_else(|| response.get("message").and_then(extract_message_id))
            .unwrap_or_default();
        Ok(MaxMessage {
            message_id,
            timestamp: response
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_ms),
            body: Some(json!({"text": text})),
            ..MaxMessage::default()
        })
    }

    async fn edit_message(&self, message_id: &str, text: &str) -> Result<(), ClientError> {
        self.inner
            .send_and_wait(
                opcode::EDIT_MESSAGE,
                json!({"messageId": message_id, "text": text}),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ClientError> {
        self.inner
            .send_and_wait(
                opcode::DELETE_MESSAGE,
                json!({"messageId": message_id}),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn get_chat(&self, chat_id: i64) -> Result<MaxChat, ClientError> {
        let response = self
            .inner
            .send_and_wait(opcode::CHAT_INFO, json!({"chatId": chat_id}), REQUEST_TIMEOUT)
            .await?;
        let raw = response.get("chat").unwrap_or(&response);
        serde_json::from_value(raw.clone()).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn get_chat_members(&self, chat_id: i64) -> Result<Vec<MaxUser>, ClientError> {
        let response = self
            .inner
            .send_and_wait(
                opcode::CHAT_INFO,
                json!({"chatId": chat_id, "includeMembers": true}),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(response
            .get("members")
            .and_then(Value::as_array)
            .map(|members| members.iter().filter_map(MaxUser::from_value).collect())
            .unwrap_or_default())
    }

    async fn get_user_info(&self, user_id: i64) -> Result<MaxUser, ClientError> {
        // Contacts from the login handshake are the richest source.
        if let Some(login) = self.inner.login_data.read().await.as_ref() {
            if let Some(user) = login.contacts.get(&user_id) {
                return Ok(user.clone());
            }
        }
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
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .inner
            .http
            .post(&self.inner.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "upload failed: HTTP {}",
                response.status()
            )));
        }
        let result: Value = response
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
        chat_id: i64,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        // An empty emoji removes the caller's reaction.
        self.inner
            .send_and_wait(
                opcode::REACT,
                json!({"chatId": chat_id, "messageId": message_id, "reaction": emoji}),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn mark_as_read(&self, chat_id: i64, message_id: &str) -> Result<(), ClientError> {
        self.inner
            .send_and_wait(
                opcode::MARK_READ,
                json!({"chatId": chat_id, "messageId": message_id}),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_client() -> (UserClient, mpsc::UnboundedReceiver<MaxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            UserClient::new(
                "wss://example.invalid/websocket",
                "https://example.invalid/uploads",
                Some("token".to_string()),
                tx,
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn response_completes_pending_slot() {
        let (client, _rx) = test_client();
        let (tx, rx) = oneshot::channel();
        client.inner.pending.lock().await.insert(5, tx);

        client
            .inner
            .handle_frame(Frame {
                ver: 11,
                cmd: Cmd::Response.as_wire(),
                seq: 5,
                opcode: opcode::SEND_MESSAGE,
                payload: Some(json!({"mid": "m1"})),
            })
            .await;

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["mid"], "m1");
    }

    #[tokio::test]
    async fn error_frame_fails_pending_slot() {
        let (client, _rx) = test_client();
        let (tx, rx) = oneshot::channel();
        client.inner.pending.lock().await.insert(2, tx);

        client
            .inner
            .handle_frame(Frame {
                ver: 11,
                cmd: Cmd::Error.as_wire(),
                seq: 2,
                opcode: opcode::LOGIN_BY_TOKEN,
                payload: Some(json!({"error": "login.token", "message": "expired"})),
            })
            .await;

        match rx.await.unwrap() {
            Err(ClientError::Upstream { code, message }) => {
                assert_eq!(code, "login.token");
                assert_eq!(message, "expired");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn incoming_message_dispatched() {
        let (client, mut rx) = test_client();
        client
            .inner
            .handle_frame(Frame {
                ver: 11,
                cmd: Cmd::Request.as_wire(),
                seq: 9,
                opcode: opcode::INCOMING_MESSAGE,
                payload: Some(json!({
                    "chatId": 42,
                    "message": {"mid": "m1", "sender": 200, "body": "hi"},
                })),
            })
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, MaxEventKind::MessageCreated);
        assert_eq!(event.chat_id, 42);
        let message = event.message.unwrap();
        assert_eq!(message.text(), Some("hi"));
        assert_eq!(message.sender.unwrap().user_id, 200);
    }

    #[tokio::test]
    async fn incoming_reaction_frame() {
        let (client, mut rx) = test_client();
        client
            .inner
            .handle_frame(Frame {
                ver: 11,
                cmd: Cmd::Request.as_wire(),
                seq: 10,
                opcode: opcode::INCOMING_MESSAGE,
                payload: Some(json!({
                    "chatId": 7,
                    "mid": "m2",
                    "userId": 200,
                    "reaction": "👍",
                })),
            })
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, MaxEventKind::ReactionChanged);
        assert_eq!(event.reaction.as_deref(), Some("👍"));
        assert_eq!(event.sender_id, Some(200));
        assert_eq!(event.message_id.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn nested_chat_id_fallback() {
        let payload = json!({"message": {"mid": "m3", "chatId": 13, "body": "x"}});
        let event = decode_incoming_message(&payload).unwrap();
        assert_eq!(event.chat_id, 13);
    }

    #[tokio::test]
    async fn incoming_delete_extracts_id() {
        let (client, mut rx) = test_client();
        client
            .inner
            .handle_frame(Frame {
                ver: 11,
                cmd: Cmd::Request.as_wire(),
                seq: 11,
                opcode: opcode::INCOMING_DELETE,
                payload: Some(json!({"chatId": 3, "messageId": "dead"})),
            })
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, MaxEventKind::MessageRemoved);
        assert_eq!(event.message_id.as_deref(), Some("dead"));
    }

    #[test]
    fn login_data_parsing() {
        let payload = json!({
            "tokenAttrs": {"LOGIN": {"token": "fresh"}},
            "profile": {"user_id": 100, "name": "Alice"},
            "chats": [{"id": 42, "type": "dialog"}],
            "contacts": [
                {"user_id": 200, "name": "Bob"},
                {"user_id": 300, "name": "Carol"}
            ],
        });
        let login = parse_login_data(&payload);
        assert_eq!(login.token.as_deref(), Some("fresh"));
        assert_eq!(login.profile.unwrap().user_id, 100);
        assert_eq!(login.chats.len(), 1);
        assert_eq!(login.contacts.get(&200).unwrap().name, "Bob");
    }

    #[test]
    fn contacts_as_map() {
        let payload = json!({
            "contacts": {"200": {"user_id": 200, "name": "Bob"}},
        });
        let login = parse_login_data(&payload);
        assert_eq!(login.contacts.len(), 1);
    }

    #[test]
    fn auth_result_token_locations() {
        let nested = json!({"tokenAttrs": {"LOGIN": {"token": "t1"}}});
        assert_eq!(parse_auth_result(&nested).unwrap().token, "t1");
        let flat = json!({"token": "t2"});
        assert_eq!(parse_auth_result(&flat).unwrap().token, "t2");
        assert!(parse_auth_result(&json!({})).is_err());
    }

    #[test]
    fn qr_status_expiry() {
        let status = QrStatus {
            login_available: false,
            expires_at: Some(1_000),
        };
        assert!(status.is_expired(2_000));
        assert!(!status.is_expired(500));
    }

    #[tokio::test]
    async fn send_without_socket_is_not_connected() {
        let (client, _rx) = test_client();
        let result = client
            .inner
            .send_and_wait(opcode::SEND_MESSAGE, json!({}), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn seq_allocation_is_strictly_monotone() {
        let (client, _rx) = test_client();
        // Each attempt consumes a fresh sequence number, even when the
        // write itself cannot happen.
        for _ in 0..3 {
            let _ = client
                .inner
                .send_request(opcode::HEARTBEAT, json!({}))
                .await;
        }
        assert_eq!(client.inner.send.lock().await.seq, 3);
    }
}
