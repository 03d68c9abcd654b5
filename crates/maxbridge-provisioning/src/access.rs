//! The seam between the provisioning API and the bridge engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use maxbridge_client::UserClient;

/// Bridge status of one Matrix user, as reported by `v1/.../status`.
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    /// `connected`, `disconnected`, or `not_logged_in`.
    pub status: String,
    /// Connection mode, when logged in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// The user's Max id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_user_id: Option<i64>,
}

/// What provisioning needs from the bridge.
///
/// Implemented by the bridge binary over the engine; faked in tests.
#[async_trait]
pub trait BridgeAccess: Send + Sync {
    /// Store a bot token for the user and connect. An `Err` means the
    /// credentials were rejected.
    async fn login_bot(&self, mxid: &str, token: &str) -> Result<(), String>;

    /// Store a user-mode token and connect.
    async fn login_user(&self, mxid: &str, token: &str, max_user_id: i64) -> Result<(), String>;

    /// Disconnect the user and clear credentials.
    async fn logout(&self, mxid: &str) -> Result<(), String>;

    /// Current bridge status for the user.
    async fn status(&self, mxid: &str) -> UserStatus;

    /// A fresh, unauthenticated user client for driving a phone or QR
    /// auth flow.
    fn new_auth_client(&self) -> Arc<UserClient>;
}
