//! Short-lived auth sessions for in-flight login flows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use maxbridge_client::{MaxClient, QrStart, UserClient};

/// How long an unfinished login session stays valid.
pub const SESSION_TTL: Duration = Duration::from_secs(300);

/// Which login flow a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFlow {
    /// Bot API token.
    BotToken,
    /// Phone number + SMS code.
    Phone,
    /// QR code scanned by the mobile app.
    Qr,
}

/// Which step the session is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    /// Waiting for the bot token.
    TokenInput,
    /// Waiting for the phone number.
    PhoneInput,
    /// Waiting for the SMS code.
    CodeInput,
    /// Waiting for the QR scan.
    QrScan,
}

/// One in-flight login.
#[derive(Clone)]
pub struct AuthSession {
    /// Generated login id.
    pub login_id: String,
    /// The flow being run.
    pub flow: LoginFlow,
    /// The step being waited on.
    pub step: LoginStep,
    /// The Matrix user logging in.
    pub user_id: String,
    /// Partially-connected user client (phone and QR flows).
    pub client: Option<Arc<UserClient>>,
    /// Opaque flow token from upstream (phone flow).
    pub flow_token: Option<String>,
    /// QR descriptor (QR flow).
    pub qr: Option<QrStart>,
    created: Instant,
}

impl AuthSession {
    /// Create a session at the given step.
    #[must_use]
    pub fn new(user_id: impl Into<String>, flow: LoginFlow, step: LoginStep) -> Self {
        Self {
            login_id: uuid::Uuid::new_v4().to_string(),
            flow,
            step,
            user_id: user_id.into(),
            client: None,
            flow_token: None,
            qr: None,
            created: Instant::now(),
        }
    }

    /// Whether the session exceeded its TTL.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.created.elapsed() > SESSION_TTL
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, age: Duration) {
        self.created = Instant::now() - age;
    }
}

/// Result of a session lookup.
pub enum SessionLookup {
    /// Live session.
    Found(AuthSession),
    /// The session existed but exceeded its TTL.
    Expired,
    /// No such session.
    Missing,
}

/// In-memory session table.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, AuthSession>>>,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session.
    pub async fn put(&self, session: AuthSession) {
        self.inner
            .lock()
            .await
            .insert(session.login_id.clone(), session);
    }

    /// Look up a session, expiring it if stale.
    pub async fn fetch(&self, login_id: &str) -> SessionLookup {
        let mut sessions = self.inner.lock().await;
        match sessions.get(login_id) {
            Some(session) if session.is_expired() => {
                let session = sessions.remove(login_id);
                drop(sessions);
                if let Some(session) = session {
                    teardown(session).await;
                }
                SessionLookup::Expired
            }
            Some(session) => SessionLookup::Found(session.clone()),
            None => SessionLookup::Missing,
        }
    }

    /// Remove a session (on completion).
    pub async fn remove(&self, login_id: &str) -> Option<AuthSession> {
        self.inner.lock().await.remove(login_id)
    }

    /// Drop every expired session, closing any attached client.
    pub async fn sweep(&self) {
        let expired: Vec<AuthSession> = {
            let mut sessions = self.inner.lock().await;
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.is_expired())
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect()
        };
        for session in expired {
            tracing::debug!(login_id = %session.login_id, "expiring auth session");
            teardown(session).await;
        }
    }

    /// Run the TTL sweeper until cancelled.
    pub async fn run_sweeper(self) {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.sweep().await;
        }
    }
}

/// Close the partially-connected client a dying session may hold.
async fn teardown(session: AuthSession) {
    if let Some(client) = session.client {
        client.disconnect().await;
    }
}
