//! The bridge-scoped registries tying users, portals and puppets together.
//!
//! Components never own each other: they take handles into these registries
//! and pass the engine along explicitly. Cold start rehydrates from the
//! store on first reference.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use maxbridge_core::Config;
use maxbridge_matrix::{Intent, IntentFactory};
use maxbridge_store::{PortalRow, PuppetRow, Store, UserRow};

use crate::portal::Portal;
use crate::puppet::Puppet;
use crate::user::UserSession;
use crate::BridgeError;

/// The bridge engine.
pub struct Engine {
    config: Config,
    store: Store,
    intents: Arc<dyn IntentFactory>,
    http: reqwest::Client,
    users: RwLock<HashMap<String, Arc<UserSession>>>,
    portals: RwLock<HashMap<i64, Arc<Portal>>>,
    portal_rooms: RwLock<HashMap<String, i64>>,
    puppets: RwLock<HashMap<i64, Arc<Puppet>>>,
}

impl Engine {
    /// Create the engine.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(config: Config, store: Store, intents: Arc<dyn IntentFactory>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            intents,
            http: reqwest::Client::new(),
            users: RwLock::new(HashMap::new()),
            portals: RwLock::new(HashMap::new()),
            portal_rooms: RwLock::new(HashMap::new()),
            puppets: RwLock::new(HashMap::new()),
        })
    }

    /// Bridge configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The shared store handle.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Shared HTTP client (avatar fetches).
    #[must_use]
    pub const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// The bridge bot's intent.
    #[must_use]
    pub fn main_intent(&self) -> Arc<dyn Intent> {
        self.intents.main()
    }

    /// An intent acting as the given ghost.
    #[must_use]
    pub fn ghost_intent(&self, mxid: &str) -> Arc<dyn Intent> {
        self.intents.ghost(mxid)
    }

    /// Whether the mxid belongs to a bridge ghost (echo guard).
    #[must_use]
    pub fn is_ghost(&self, mxid: &str) -> bool {
        self.config.is_ghost_mxid(mxid)
    }

    /// Get or lazily create the session for a Matrix user.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_or_create_user(&self, mxid: &str) -> Result<Arc<UserSession>, BridgeError> {
        if let Some(user) = self.users.read().await.get(mxid) {
            return Ok(Arc::clone(user));
        }
        let row = UserRow::get_by_mxid(&self.store, mxid).await?;
        let user = Arc::new(UserSession::from_row(mxid.to_string(), row));
        self.users
            .write()
            .await
            .insert(mxid.to_string(), Arc::clone(&user));
        Ok(user)
    }

    /// Look up a session without creating one.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_user(&self, mxid: &str) -> Result<Option<Arc<UserSession>>, BridgeError> {
        if let Some(user) = self.users.read().await.get(mxid) {
            return Ok(Some(Arc::clone(user)));
        }
        let Some(row) = UserRow::get_by_mxid(&self.store, mxid).await? else {
            return Ok(None);
        };
        let user = Arc::new(UserSession::from_row(mxid.to_string(), Some(row)));
        self.users
            .write()
            .await
            .insert(mxid.to_string(), Arc::clone(&user));
        Ok(Some(user))
    }

    /// Get or lazily create the portal for a Max chat.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_or_create_portal(&self, chat_id: i64) -> Result<Arc<Portal>, BridgeError> {
        if let Some(portal) = self.portals.read().await.get(&chat_id) {
            return Ok(Arc::clone(portal));
        }
        let row = PortalRow::get_by_chat_id(&self.store, chat_id).await?;
        let portal = Arc::new(Portal::from_row(chat_id, row));
        let mut portals = self.portals.write().await;
        // Another task may have raced us here; keep the first instance so
        // the per-portal lock stays unique.
        let portal = portals
            .entry(chat_id)
            .or_insert_with(|| Arc::clone(&portal))
            .clone();
        drop(portals);
        if let Some(room_id) = portal.mxid().await {
            self.portal_rooms.write().await.insert(room_id, chat_id);
        }
        Ok(portal)
    }

    /// Look up a portal by its Matrix room id.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn portal_by_room(&self, room_id: &str) -> Result<Option<Arc<Portal>>, BridgeError> {
        if let Some(chat_id) = self.portal_rooms.read().await.get(room_id).copied() {
            return Ok(self.portals.read().await.get(&chat_id).cloned());
        }
        let Some(row) = PortalRow::get_by_mxid(&self.store, room_id).await? else {
            return Ok(None);
        };
        let chat_id = row.max_chat_id;
        let portal = self.get_or_create_portal(chat_id).await?;
        self.portal_rooms
            .write()
            .await
            .insert(room_id.to_string(), chat_id);
        Ok(Some(portal))
    }

    /// Record the room binding of a freshly materialized portal.
    pub(crate) async fn register_portal_room(&self, room_id: &str, chat_id: i64) {
        self.portal_rooms
            .write()
            .await
            .insert(room_id.to_string(), chat_id);
    }

    /// Get or lazily create the puppet for a Max user.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn get_or_create_puppet(&self, user_id: i64) -> Result<Arc<Puppet>, BridgeError> {
        if let Some(puppet) = self.puppets.read().await.get(&user_id) {
            return Ok(Arc::clone(puppet));
        }
        let row = PuppetRow::get_by_user_id(&self.store, user_id).await?;
        let mxid = self.config.ghost_mxid(user_id);
        let intent = self.intents.ghost(&mxid);
        let puppet = Arc::new(Puppet::from_row(user_id, mxid, intent, row));
        self.puppets
            .write()
            .await
            .insert(user_id, Arc::clone(&puppet));
        Ok(puppet)
    }

    /// Look up a puppet by its ghost mxid, if the mxid is one.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    pub async fn puppet_by_mxid(&self, mxid: &str) -> Result<Option<Arc<Puppet>>, BridgeError> {
        let Some(user_id) = self.config.parse_ghost_mxid(mxid) else {
            return Ok(None);
        };
        Ok(Some(self.get_or_create_puppet(user_id).await?))
    }

    /// Reconnect every user with stored credentials.
    ///
    /// # Errors
    ///
    /// Returns error on database failure; individual connect failures are
    /// logged and skipped.
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        let rows = UserRow::all_logged_in(&self.store).await?;
        tracing::info!(count = rows.len(), "reconnecting logged-in users");
        for row in rows {
            let user = self.get_or_create_user(&row.mxid).await?;
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = user.connect(&engine).await {
                    tracing::error!(mxid = %user.mxid, %error, "failed to reconnect user");
                }
            });
        }
        Ok(())
    }

    /// Disconnect every live session.
    pub async fn stop(&self) {
        let users: Vec<Arc<UserSession>> = self.users.read().await.values().cloned().collect();
        for user in users {
            user.disconnect().await;
        }
    }
}
