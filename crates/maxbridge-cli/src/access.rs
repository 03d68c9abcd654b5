//! Provisioning's view of the engine.

use std::sync::Arc;

use async_trait::async_trait;

use maxbridge_client::UserClient;
use maxbridge_engine::Engine;
use maxbridge_provisioning::{BridgeAccess, UserStatus};

/// Adapter exposing the engine to the provisioning API.
pub struct EngineAccess {
    engine: Arc<Engine>,
}

impl EngineAccess {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl BridgeAccess for EngineAccess {
    async fn login_bot(&self, mxid: &str, token: &str) -> Result<(), String> {
        let user = self
            .engine
            .get_or_create_user(mxid)
            .await
            .map_err(|error| error.to_string())?;
        user.login_bot(&self.engine, token)
            .await
            .map_err(|error| error.to_string())
    }

    async fn login_user(&self, mxid: &str, token: &str, max_user_id: i64) -> Result<(), String> {
        let user = self
            .engine
            .get_or_create_user(mxid)
            .await
            .map_err(|error| error.to_string())?;
        user.login_user(&self.engine, token, max_user_id)
            .await
            .map_err(|error| error.to_string())
    }

    async fn logout(&self, mxid: &str) -> Result<(), String> {
        match self.engine.get_user(mxid).await {
            Ok(Some(user)) => user
                .logout(&self.engine)
                .await
                .map_err(|error| error.to_string()),
            Ok(None) => Ok(()),
            Err(error) => Err(error.to_string()),
        }
    }

    async fn status(&self, mxid: &str) -> UserStatus {
        let user = match self.engine.get_user(mxid).await {
            Ok(Some(user)) => user,
            _ => {
                return UserStatus {
                    status: "not_logged_in".to_string(),
                    mode: None,
                    max_user_id: None,
                };
            }
        };
        if !user.is_logged_in().await {
            return UserStatus {
                status: "not_logged_in".to_string(),
                mode: None,
                max_user_id: None,
            };
        }
        let status = if user.is_connected().await {
            "connected"
        } else {
            "disconnected"
        };
        UserStatus {
            status: status.to_string(),
            mode: user
                .connection_mode()
                .await
                .map(|mode| mode.as_str().to_string()),
            max_user_id: user.max_user_id().await,
        }
    }

    fn new_auth_client(&self) -> Arc<UserClient> {
        let config = self.engine.config();
        // Auth clients emit no bridgeable events; the receiver is dropped.
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(UserClient::new(
            config.max.ws_url.clone(),
            format!("{}/uploads", config.max.api_url),
            None,
            events_tx,
        ))
    }
}
