//! Puppets: ghost Matrix identities mirroring remote Max users.

use std::sync::Arc;

use tokio::sync::RwLock;

use maxbridge_core::types::MaxUser;
use maxbridge_matrix::Intent;
use maxbridge_store::PuppetRow;

use crate::engine::Engine;
use crate::BridgeError;

/// A ghost identity for one Max user.
pub struct Puppet {
    max_user_id: i64,
    mxid: String,
    intent: Arc<dyn Intent>,
    state: RwLock<PuppetState>,
}

#[derive(Default)]
struct PuppetState {
    name: Option<String>,
    username: Option<String>,
    avatar_mxc: Option<String>,
    name_set: bool,
    avatar_set: bool,
    is_registered: bool,
}

impl Puppet {
    pub(crate) fn from_row(
        max_user_id: i64,
        mxid: String,
        intent: Arc<dyn Intent>,
        row: Option<PuppetRow>,
    ) -> Self {
        let state = row.map_or_else(PuppetState::default, |row| PuppetState {
            name: row.name,
            username: row.username,
            avatar_mxc: row.avatar_mxc,
            name_set: row.name_set,
            avatar_set: row.avatar_set,
            is_registered: row.is_registered,
        });
        Self {
            max_user_id,
            mxid,
            intent,
            state: RwLock::new(state),
        }
    }

    /// The Max user this puppet mirrors.
    #[must_use]
    pub const fn max_user_id(&self) -> i64 {
        self.max_user_id
    }

    /// The ghost's Matrix user id.
    #[must_use]
    pub fn mxid(&self) -> &str {
        &self.mxid
    }

    /// The intent acting as this ghost.
    #[must_use]
    pub fn intent(&self) -> Arc<dyn Intent> {
        Arc::clone(&self.intent)
    }

    /// Last profile data pushed to the homeserver (name, avatar flags).
    pub async fn profile_flags(&self) -> (bool, bool) {
        let state = self.state.read().await;
        (state.name_set, state.avatar_set)
    }

    /// Sync the ghost's profile from an incoming Max user record.
    ///
    /// Only changed fields produce homeserver calls; avatar fetch failures
    /// leave the flag unset so the next sighting retries.
    ///
    /// # Errors
    ///
    /// Returns error on database failure; profile-API failures are logged
    /// and tolerated.
    pub async fn update_info(&self, engine: &Engine, info: &MaxUser) -> Result<(), BridgeError> {
        let mut changed = false;
        {
            let mut state = self.state.write().await;
            if !info.name.is_empty() && Some(&info.name) != state.name.as_ref() {
                state.name = Some(info.name.clone());
                changed = true;
            }
            if let Some(username) = &info.username {
                if Some(username) != state.username.as_ref() {
                    state.username = Some(username.clone());
                    changed = true;
                }
            }
        }

        if !self.state.read().await.is_registered {
            match self.intent.ensure_registered().await {
                Ok(()) => {
                    self.state.write().await.is_registered = true;
                    changed = true;
                }
                Err(error) => tracing::warn!(mxid = %self.mxid, %error, "ghost registration failed"),
            }
        }

        let name_set = self.state.read().await.name_set;
        if changed || !name_set {
            let displayname = {
                let state = self.state.read().await;
                let id_fallback = self.max_user_id.to_string();
                engine.config().puppet_displayname(
                    state.name.as_deref().unwrap_or(&id_fallback),
                    state.username.as_deref().unwrap_or_default(),
                    self.max_user_id,
                )
            };
            match self.intent.set_displayname(&displayname).await {
                Ok(()) => {
                    let mut state = self.state.write().await;
                    if !state.name_set {
                        state.name_set = true;
                        changed = true;
                    }
                }
                Err(error) => {
                    tracing::warn!(mxid = %self.mxid, %error, "failed to set displayname");
                }
            }
        }

        let avatar_set = self.state.read().await.avatar_set;
        if let Some(avatar_url) = &info.avatar_url {
            if !avatar_set {
                match self.sync_avatar(engine, avatar_url).await {
                    Ok(mxc) => {
                        let mut state = self.state.write().await;
                        state.avatar_mxc = Some(mxc);
                        state.avatar_set = true;
                        changed = true;
                    }
                    Err(error) => {
                        tracing::warn!(mxid = %self.mxid, %error, "failed to sync avatar");
                    }
                }
            }
        }

        if changed {
            self.save(engine).await?;
        }
        Ok(())
    }

    /// Fetch the avatar from Max and push it to the homeserver.
    async fn sync_avatar(&self, engine: &Engine, avatar_url: &str) -> Result<String, BridgeError> {
        let response = engine
            .http()
            .get(avatar_url)
            .send()
            .await
            .map_err(|e| maxbridge_client::ClientError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(maxbridge_client::ClientError::Transport(format!(
                "avatar fetch failed: HTTP {}",
                response.status()
            ))
            .into());
        }
        let mime = response
            .headers()
            .get("Content-Type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let data = response
            .bytes()
            .await
            .map_err(|e| maxbridge_client::ClientError::Transport(e.to_string()))?
            .to_vec();
        let mxc = self.intent.upload_media(data, &mime, "avatar").await?;
        self.intent.set_avatar_url(&mxc).await?;
        tracing::info!(mxid = %self.mxid, %mxc, "avatar updated");
        Ok(mxc)
    }

    async fn save(&self, engine: &Engine) -> Result<(), BridgeError> {
        let state = self.state.read().await;
        PuppetRow {
            max_user_id: self.max_user_id,
            name: state.name.clone(),
            username: state.username.clone(),
            avatar_mxc: state.avatar_mxc.clone(),
            name_set: state.name_set,
            avatar_set: state.avatar_set,
            is_registered: state.is_registered,
        }
        .upsert(engine.store())
        .await?;
        Ok(())
    }
}
