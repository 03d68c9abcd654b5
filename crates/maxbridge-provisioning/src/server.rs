//! The provisioning HTTP surface.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::SinkExt;
use maxbridge_client::MaxClient;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::access::BridgeAccess;
use crate::sessions::{AuthSession, LoginFlow, LoginStep, SessionLookup, SessionStore};

/// Overall QR flow timeout surfaced to clients, in seconds.
const QR_TIMEOUT_SECS: u64 = 120;
/// Subprotocol of the v1 WebSocket login endpoint.
const V1_AUTH_SUBPROTOCOL: &str = "net.maunium.max.auth";

/// Shared state of the provisioning server.
#[derive(Clone)]
pub struct ProvisioningState {
    /// The bridge seam.
    pub access: Arc<dyn BridgeAccess>,
    /// In-flight login sessions.
    pub sessions: SessionStore,
    /// Shared secret expected in the Authorization header.
    pub shared_secret: String,
}

/// Build the provisioning router.
#[must_use]
pub fn router(state: ProvisioningState) -> Router {
    Router::new()
        .route("/v3/login/flows", get(v3_flows))
        .route("/v3/login/start/{flow_id}", post(v3_start))
        .route("/v3/login/step/{login_id}", post(v3_step))
        .route("/v1/user/{mxid}/login/qr", get(v1_qr_ws))
        .route("/v1/user/{mxid}/login/send_password", post(v1_send_password))
        .route("/v1/user/{mxid}/logout", post(v1_logout))
        .route("/v1/user/{mxid}/status", get(v1_status))
        .with_state(state)
}

/// Serve the provisioning API and run the session sweeper.
///
/// # Errors
///
/// Returns error if the listener cannot be bound.
pub async fn serve(
    state: ProvisioningState,
    listen: &str,
    prefix: &str,
) -> Result<(), std::io::Error> {
    tokio::spawn(state.sessions.clone().run_sweeper());
    let app = Router::new()
        .nest(prefix.trim_end_matches('/'), router(state))
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(listen, prefix, "provisioning API listening");
    axum::serve(listener, app).await
}

/// Verify the shared secret, tolerating an optional `Bearer ` prefix.
fn check_auth(headers: &HeaderMap, secret: &str) -> Result<(), Response> {
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let token = supplied.strip_prefix("Bearer ").unwrap_or(supplied).trim();
    if token.is_empty() || token != secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "Invalid authorization",
        ));
    }
    Ok(())
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({"error": message}))).into_response()
}

fn json_ok(value: Value) -> Response {
    axum::Json(value).into_response()
}

fn parse_body(bytes: &Bytes) -> Value {
    if bytes.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(bytes).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }
}

fn user_input_response(login_id: &str, field: Value) -> Response {
    json_ok(json!({
        "login_id": login_id,
        "type": "user_input",
        "user_input": {"fields": [field]},
    }))
}

fn complete_response() -> Response {
    json_ok(json!({"type": "complete", "success": true}))
}

fn waiting_response(login_id: &str) -> Response {
    json_ok(json!({
        "login_id": login_id,
        "type": "display_and_wait",
        "status": "waiting",
    }))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── v3 REST ─────────────────────────────────────────────────────

async fn v3_flows(State(state): State<ProvisioningState>, headers: HeaderMap) -> Response {
    if let Err(response) = check_auth(&headers, &state.shared_secret) {
        return response;
    }
    json_ok(json!({
        "flows": [
            {
                "id": "bot_token",
                "name": "Bot Token",
                "description": "Connect using a Max Bot API token from @metabot",
            },
            {
                "id": "phone",
                "name": "Phone + SMS",
                "description": "Login with phone number and SMS verification code",
            },
            {
                "id": "qr",
                "name": "QR Code",
                "description": "Scan QR code with Max mobile app",
            },
        ]
    }))
}

async fn v3_start(
    State(state): State<ProvisioningState>,
    Path(flow_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&headers, &state.shared_secret) {
        return response;
    }
    let user_id = params.get("user_id").cloned().unwrap_or_default();

    match flow_id.as_str() {
        "bot_token" => {
            let session = AuthSession::new(user_id, LoginFlow::BotToken, LoginStep::TokenInput);
            let login_id = session.login_id.clone();
            state.sessions.put(session).await;
            user_input_response(
                &login_id,
                json!({
                    "id": "token",
                    "type": "password",
                    "name": "Bot Token",
                    "description": "Get your bot token from @metabot in Max",
                }),
            )
        }
        "phone" => {
            let session = AuthSession::new(user_id, LoginFlow::Phone, LoginStep::PhoneInput);
            let login_id = session.login_id.clone();
            state.sessions.put(session).await;
            user_input_response(
                &login_id,
                json!({
                    "id": "phone",
                    "type": "phone",
                    "name": "Phone Number",
                    "description": "Enter your phone number with country code (e.g. +79001234567)",
                }),
            )
        }
        "qr" => {
            let client = state.access.new_auth_client();
            let qr = match client.connect_for_auth().await {
                Ok(()) => client.generate_qr().await,
                Err(error) => Err(error),
            };
            let qr = match qr {
                Ok(qr) => qr,
                Err(error) => {
                    tracing::error!(%error, "failed to start QR auth");
                    client.disconnect().await;
                    return json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("Failed to start QR auth: {error}"),
                    );
                }
            };

            let mut session = AuthSession::new(user_id, LoginFlow::Qr, LoginStep::QrScan);
            session.client = Some(client);
            session.qr = Some(qr.clone());
            let login_id = session.login_id.clone();
            state.sessions.put(session).await;
            json_ok(json!({
                "login_id": login_id,
                "type": "display_and_wait",
                "display_and_wait": {
                    "type": "qr",
                    "data": qr.qr_link,
                    "timeout": QR_TIMEOUT_SECS,
                },
            }))
        }
        other => json_error(StatusCode::BAD_REQUEST, &format!("Unknown flow: {other}")),
    }
}

async fn v3_step(
    State(state): State<ProvisioningState>,
    Path(login_id): Path<String>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Response {
    if let Err(response) = check_auth(&headers, &state.shared_secret) {
        return response;
    }
    let session = match state.sessions.fetch(&login_id).await {
        SessionLookup::Found(session) => session,
        SessionLookup::Expired => return json_error(StatusCode::GONE, "Login session expired"),
        SessionLookup::Missing => {
            return json_error(StatusCode::NOT_FOUND, "Invalid login session");
        }
    };
    let body = parse_body(&bytes);

    match (session.flow, session.step) {
        (LoginFlow::BotToken, LoginStep::TokenInput) => {
            let token = body.get("token").and_then(Value::as_str).unwrap_or("").trim();
            if token.is_empty() {
                return json_error(StatusCode::BAD_REQUEST, "Token is required");
            }
            if let Err(error) = state.access.login_bot(&session.user_id, token).await {
                return json_error(
                    StatusCode::UNAUTHORIZED,
                    &format!("Login failed: {error}"),
                );
            }
            state.sessions.remove(&login_id).await;
            complete_response()
        }

        (LoginFlow::Phone, LoginStep::PhoneInput) => {
            let phone = body.get("phone").and_then(Value::as_str).unwrap_or("").trim();
            if phone.is_empty() {
                return json_error(StatusCode::BAD_REQUEST, "Phone number is required");
            }
            let client = state.access.new_auth_client();
            let started = match client.connect_for_auth().await {
                Ok(()) => client.start_phone_auth(phone, "ru").await,
                Err(error) => Err(error),
            };
            let started = match started {
                Ok(started) => started,
                Err(error) => {
                    client.disconnect().await;
                    return json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("Failed to start auth: {error}"),
                    );
                }
            };
            let mut session = session;
            session.step = LoginStep::CodeInput;
            session.client = Some(client);
            session.flow_token = Some(started.flow_token);
            state.sessions.put(session).await;
            user_input_response(
                &login_id,
                json!({
                    "id": "code",
                    "type": "text",
                    "name": "SMS Code",
                    "description": "Enter the verification code sent to your phone",
                }),
            )
        }

        (LoginFlow::Phone, LoginStep::CodeInput) => {
            let code = body.get("code").and_then(Value::as_str).unwrap_or("").trim();
            if code.is_empty() {
                return json_error(StatusCode::BAD_REQUEST, "Code is required");
            }
            let (Some(client), Some(flow_token)) = (&session.client, &session.flow_token) else {
                return json_error(StatusCode::GONE, "Session expired");
            };
            let result = match client.check_code(flow_token, code).await {
                Ok(result) => result,
                Err(error) => {
                    return json_error(
                        StatusCode::UNAUTHORIZED,
                        &format!("Code verification failed: {error}"),
                    );
                }
            };
            let max_user_id = result.profile.map_or(0, |profile| profile.user_id);
            if let Err(error) = state
                .access
                .login_user(&session.user_id, &result.token, max_user_id)
                .await
            {
                return json_error(
                    StatusCode::UNAUTHORIZED,
                    &format!("Login failed: {error}"),
                );
            }
            client.disconnect().await;
            state.sessions.remove(&login_id).await;
            complete_response()
        }

        (LoginFlow::Qr, LoginStep::QrScan) => {
            let (Some(client), Some(qr)) = (&session.client, &session.qr) else {
                return json_error(StatusCode::GONE, "Session expired");
            };
            match client.poll_qr(&qr.track_id).await {
                Ok(status) if status.login_available => {
                    let result = match client.confirm_qr(&qr.track_id).await {
                        Ok(result) => result,
                        Err(error) => {
                            return json_error(
                                StatusCode::UNAUTHORIZED,
                                &format!("QR login failed: {error}"),
                            );
                        }
                    };
                    let max_user_id = result.profile.map_or(0, |profile| profile.user_id);
                    if let Err(error) = state
                        .access
                        .login_user(&session.user_id, &result.token, max_user_id)
                        .await
                    {
                        return json_error(
                            StatusCode::UNAUTHORIZED,
                            &format!("Login failed: {error}"),
                        );
                    }
                    client.disconnect().await;
                    state.sessions.remove(&login_id).await;
                    complete_response()
                }
                Ok(status) if status.is_expired(now_ms()) => {
                    client.disconnect().await;
                    state.sessions.remove(&login_id).await;
                    json_error(StatusCode::GONE, "QR code expired")
                }
                Ok(_) => waiting_response(&login_id),
                Err(error) => {
                    tracing::debug!(%error, "QR poll failed, still waiting");
                    waiting_response(&login_id)
                }
            }
        }

        _ => json_error(StatusCode::BAD_REQUEST, "Invalid session state"),
    }
}

// ── v1 compatibility ────────────────────────────────────────────

async fn v1_qr_ws(
    State(state): State<ProvisioningState>,
    Path(mxid): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.protocols([V1_AUTH_SUBPROTOCOL])
        .on_upgrade(move |socket| v1_qr_flow(socket, state, mxid))
}

/// Single-shot WebSocket QR login: emit `{code, timeout}`, then
/// `{success, error?}` when the flow settles.
async fn v1_qr_flow(mut socket: WebSocket, state: ProvisioningState, mxid: String) {
    tracing::info!(%mxid, "v1 QR login started");
    let client = state.access.new_auth_client();

    let outcome = async {
        client
            .connect_for_auth()
            .await
            .map_err(|error| error.to_string())?;
        let qr = client
            .generate_qr()
            .await
            .map_err(|error| error.to_string())?;
        socket
            .send(WsMessage::Text(
                json!({"code": qr.qr_link, "timeout": QR_TIMEOUT_SECS})
                    .to_string()
                    .into(),
            ))
            .await
            .map_err(|error| error.to_string())?;

        let result = client
            .wait_for_qr(&qr.track_id)
            .await
            .map_err(|error| error.to_string())?;
        let max_user_id = result.profile.as_ref().map_or(0, |profile| profile.user_id);
        state
            .access
            .login_user(&mxid, &result.token, max_user_id)
            .await
    }
    .await;

    let reply = match outcome {
        Ok(()) => json!({"success": true}),
        Err(error) => {
            tracing::warn!(%mxid, %error, "v1 QR login failed");
            json!({"success": false, "error": error})
        }
    };
    let _ = socket.send(WsMessage::Text(reply.to_string().into())).await;
    let _ = socket.close().await;
    client.disconnect().await;
}

async fn v1_send_password(
    State(state): State<ProvisioningState>,
    Path(_mxid): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&headers, &state.shared_secret) {
        return response;
    }
    json_error(
        StatusCode::NOT_IMPLEMENTED,
        "2FA not supported for Max bridge",
    )
}

async fn v1_logout(
    State(state): State<ProvisioningState>,
    Path(mxid): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&headers, &state.shared_secret) {
        return response;
    }
    if let Err(error) = state.access.logout(&mxid).await {
        tracing::warn!(%mxid, %error, "logout failed");
    }
    json_ok(json!({"success": true}))
}

async fn v1_status(
    State(state): State<ProvisioningState>,
    Path(mxid): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&headers, &state.shared_secret) {
        return response;
    }
    let status = state.access.status(&mxid).await;
    json_ok(serde_json::to_value(status).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::UserStatus;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use maxbridge_client::UserClient;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeAccess {
        logins: Mutex<Vec<(String, String)>>,
        reject_logins: bool,
    }

    #[async_trait]
    impl BridgeAccess for FakeAccess {
        async fn login_bot(&self, mxid: &str, token: &str) -> Result<(), String> {
            if self.reject_logins {
                return Err("invalid token".to_string());
            }
            self.logins
                .lock()
                .unwrap()
                .push((mxid.to_string(), token.to_string()));
            Ok(())
        }

        async fn login_user(
            &self,
            mxid: &str,
            token: &str,
            _max_user_id: i64,
        ) -> Result<(), String> {
            self.logins
                .lock()
                .unwrap()
                .push((mxid.to_string(), token.to_string()));
            Ok(())
        }

        async fn logout(&self, _mxid: &str) -> Result<(), String> {
            Ok(())
        }

        async fn status(&self, _mxid: &str) -> UserStatus {
            UserStatus {
                status: "not_logged_in".to_string(),
                mode: None,
                max_user_id: None,
            }
        }

        fn new_auth_client(&self) -> Arc<UserClient> {
            let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
            Arc::new(UserClient::new(
                "ws://127.0.0.1:9",
                "http://127.0.0.1:9/uploads",
                None,
                tx,
            ))
        }
    }

    fn test_state(access: FakeAccess) -> (ProvisioningState, Arc<FakeAccess>) {
        let access = Arc::new(access);
        (
            ProvisioningState {
                access: access.clone(),
                sessions: SessionStore::new(),
                shared_secret: "hunter2".to_string(),
            },
            access,
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn authed(request: Request<Body>) -> Request<Body> {
        let (mut parts, body) = request.into_parts();
        parts
            .headers
            .insert("Authorization", "Bearer hunter2".parse().unwrap());
        Request::from_parts(parts, body)
    }

    #[tokio::test]
    async fn flows_require_shared_secret() {
        let (state, _) = test_state(FakeAccess::default());
        let app = router(state);

        let denied = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v3/login/flows")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(authed(
                Request::builder()
                    .uri("/v3/login/flows")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        let body = body_json(allowed).await;
        let ids: Vec<&str> = body["flows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|flow| flow["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["bot_token", "phone", "qr"]);
    }

    #[tokio::test]
    async fn raw_secret_without_bearer_prefix_accepted() {
        let (state, _) = test_state(FakeAccess::default());
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v3/login/flows")
                    .header("Authorization", "hunter2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bot_token_flow_completes() {
        let (state, access) = test_state(FakeAccess::default());
        let app = router(state);

        let start = app
            .clone()
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri("/v3/login/start/bot_token?user_id=@alice:example.com")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(start.status(), StatusCode::OK);
        let start_body = body_json(start).await;
        assert_eq!(start_body["type"], "user_input");
        assert_eq!(start_body["user_input"]["fields"][0]["id"], "token");
        let login_id = start_body["login_id"].as_str().unwrap().to_string();

        let step = app
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v3/login/step/{login_id}"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"token": "T"}"#))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(step.status(), StatusCode::OK);
        let step_body = body_json(step).await;
        assert_eq!(step_body["type"], "complete");
        assert_eq!(step_body["success"], true);

        let logins = access.logins.lock().unwrap().clone();
        assert_eq!(
            logins,
            vec![("@alice:example.com".to_string(), "T".to_string())]
        );
    }

    #[tokio::test]
    async fn rejected_token_returns_401_and_keeps_session() {
        let (state, _) = test_state(FakeAccess {
            reject_logins: true,
            ..FakeAccess::default()
        });
        let sessions = state.sessions.clone();
        let app = router(state);

        let start = app
            .clone()
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri("/v3/login/start/bot_token?user_id=@alice:example.com")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        let login_id = body_json(start).await["login_id"]
            .as_str()
            .unwrap()
            .to_string();

        let step = app
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v3/login/step/{login_id}"))
                    .body(Body::from(r#"{"token": "bad"}"#))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(step.status(), StatusCode::UNAUTHORIZED);
        assert!(matches!(
            sessions.fetch(&login_id).await,
            SessionLookup::Found(_)
        ));
    }

    #[tokio::test]
    async fn missing_token_is_bad_request() {
        let (state, _) = test_state(FakeAccess::default());
        let sessions = state.sessions.clone();
        let session =
            AuthSession::new("@alice:example.com", LoginFlow::BotToken, LoginStep::TokenInput);
        let login_id = session.login_id.clone();
        sessions.put(session).await;

        let response = router(state)
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v3/login/step/{login_id}"))
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_session_is_404_and_expired_is_410() {
        let (state, _) = test_state(FakeAccess::default());
        let sessions = state.sessions.clone();
        let app = router(state);

        let missing = app
            .clone()
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri("/v3/login/step/no-such-login")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let mut stale =
            AuthSession::new("@alice:example.com", LoginFlow::BotToken, LoginStep::TokenInput);
        let stale_id = stale.login_id.clone();
        stale.backdate(crate::sessions::SESSION_TTL * 2);
        sessions.put(stale).await;

        let expired = app
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v3/login/step/{stale_id}"))
                    .body(Body::from(r#"{"token": "T"}"#))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(expired.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn unknown_flow_is_bad_request() {
        let (state, _) = test_state(FakeAccess::default());
        let response = router(state)
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri("/v3/login/start/carrier_pigeon")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn send_password_is_unimplemented() {
        let (state, _) = test_state(FakeAccess::default());
        let response = router(state)
            .oneshot(authed(
                Request::builder()
                    .method("POST")
                    .uri("/v1/user/@alice:example.com/login/send_password")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn status_endpoint_reports_state() {
        let (state, _) = test_state(FakeAccess::default());
        let response = router(state)
            .oneshot(authed(
                Request::builder()
                    .uri("/v1/user/@alice:example.com/status")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "not_logged_in");
    }
}
