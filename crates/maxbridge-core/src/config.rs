//! Bridge configuration loading and validation.
//!
//! Supports JSON5 format. Config location defaults to
//! `~/.maxbridge/config.json` and can be overridden on the command line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionMode;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Homeserver connection settings.
    #[serde(default)]
    pub homeserver: HomeserverConfig,

    /// Application-service registration settings.
    #[serde(default)]
    pub appservice: AppserviceConfig,

    /// Max connection settings.
    #[serde(default)]
    pub max: MaxConfig,

    /// Bridge behavior settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// MergeChat license settings.
    #[serde(default)]
    pub mergechat: MergechatConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path (`~/.maxbridge/config.json`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".maxbridge")
            .join("config.json")
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error on an invalid username template or missing homeserver
    /// settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.bridge.username_template.contains("{userid}") {
            return Err(ConfigError::Validation(
                "bridge.username_template must contain {userid}".to_string(),
            ));
        }
        if self.homeserver.domain.is_empty() {
            return Err(ConfigError::Validation(
                "homeserver.domain is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Permission string for a Matrix user id.
    ///
    /// Lookup order: exact mxid, then the mxid's domain, then `*`.
    #[must_use]
    pub fn permission_for(&self, mxid: &str) -> Option<&str> {
        let permissions = &self.bridge.permissions;
        if let Some(level) = permissions.get(mxid) {
            return Some(level);
        }
        if let Some((_, domain)) = mxid.split_once(':') {
            if let Some(level) = permissions.get(domain) {
                return Some(level);
            }
        }
        permissions.get("*").map(String::as_str)
    }

    /// The ghost localpart for a Max user id, from the username template.
    #[must_use]
    pub fn ghost_localpart(&self, max_user_id: i64) -> String {
        self.bridge
            .username_template
            .replace("{userid}", &max_user_id.to_string())
    }

    /// The full ghost mxid for a Max user id.
    #[must_use]
    pub fn ghost_mxid(&self, max_user_id: i64) -> String {
        format!(
            "@{}:{}",
            self.ghost_localpart(max_user_id),
            self.homeserver.domain
        )
    }

    /// Extract the Max user id from a ghost mxid, if it is one.
    ///
    /// Any mxid whose localpart starts with the template prefix is treated
    /// as bridge-owned; this is the echo-loop guard.
    #[must_use]
    pub fn parse_ghost_mxid(&self, mxid: &str) -> Option<i64> {
        let localpart = mxid.strip_prefix('@')?.split(':').next()?;
        let (prefix, suffix) = self
            .bridge
            .username_template
            .split_once("{userid}")
            .unwrap_or((self.bridge.username_template.as_str(), ""));
        let id_part = localpart.strip_prefix(prefix)?;
        let id_part = id_part.strip_suffix(suffix).unwrap_or(id_part);
        id_part.parse().ok()
    }

    /// Whether the mxid belongs to a bridge ghost.
    #[must_use]
    pub fn is_ghost_mxid(&self, mxid: &str) -> bool {
        let Some(localpart) = mxid.strip_prefix('@').and_then(|rest| rest.split(':').next())
        else {
            return false;
        };
        let prefix = self
            .bridge
            .username_template
            .split("{userid}")
            .next()
            .unwrap_or_default();
        !prefix.is_empty() && localpart.starts_with(prefix)
    }

    /// Render a puppet display name from the displayname template.
    #[must_use]
    pub fn puppet_displayname(&self, name: &str, username: &str, id: i64) -> String {
        self.bridge
            .displayname_template
            .replace("{displayname}", name)
            .replace("{username}", username)
            .replace("{id}", &id.to_string())
    }
}

/// Homeserver connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeserverConfig {
    /// Client-server API base URL.
    #[serde(default = "default_homeserver_address")]
    pub address: String,

    /// Server name used in user ids.
    #[serde(default)]
    pub domain: String,
}

impl Default for HomeserverConfig {
    fn default() -> Self {
        Self {
            address: default_homeserver_address(),
            domain: String::new(),
        }
    }
}

fn default_homeserver_address() -> String {
    "http://localhost:8008".to_string()
}

/// Application-service registration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppserviceConfig {
    /// Token the bridge uses against the homeserver.
    #[serde(default)]
    pub as_token: String,

    /// Localpart of the bridge bot account.
    #[serde(default = "default_bot_username")]
    pub bot_username: String,
}

impl Default for AppserviceConfig {
    fn default() -> Self {
        Self {
            as_token: String::new(),
            bot_username: default_bot_username(),
        }
    }
}

fn default_bot_username() -> String {
    "maxbot".to_string()
}

/// Max connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxConfig {
    /// Default connection mode for config-provisioned logins.
    pub connection_mode: Option<ConnectionMode>,

    /// Bot token for config-provisioned bot mode.
    pub bot_token: Option<String>,

    /// Bot REST API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// User WebSocket URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Long-polling timeout in seconds.
    #[serde(default = "default_polling_timeout")]
    pub polling_timeout: u64,
}

impl Default for MaxConfig {
    fn default() -> Self {
        Self {
            connection_mode: None,
            bot_token: None,
            api_url: default_api_url(),
            ws_url: default_ws_url(),
            polling_timeout: default_polling_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "https://platform-api.max.ru".to_string()
}

fn default_ws_url() -> String {
    "wss://ws-api.oneme.ru/websocket".to_string()
}

const fn default_polling_timeout() -> u64 {
    90
}

/// Bridge behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Ghost username template; must contain `{userid}`.
    #[serde(default = "default_username_template")]
    pub username_template: String,

    /// Ghost display name template with `{displayname}`, `{username}`,
    /// `{id}` placeholders.
    #[serde(default = "default_displayname_template")]
    pub displayname_template: String,

    /// Permission map: mxid, domain, or `*` to permission level.
    #[serde(default)]
    pub permissions: HashMap<String, String>,

    /// Provisioning API settings.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            username_template: default_username_template(),
            displayname_template: default_displayname_template(),
            permissions: HashMap::new(),
            provisioning: ProvisioningConfig::default(),
        }
    }
}

fn default_username_template() -> String {
    "max_{userid}".to_string()
}

fn default_displayname_template() -> String {
    "{displayname} (Max)".to_string()
}

/// Provisioning API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Whether the provisioning API is served.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path prefix the API is mounted under.
    #[serde(default = "default_provisioning_prefix")]
    pub prefix: String,

    /// Shared secret expected in the Authorization header.
    #[serde(default)]
    pub shared_secret: String,

    /// Listen address for the provisioning server.
    #[serde(default = "default_provisioning_listen")]
    pub listen: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_provisioning_prefix(),
            shared_secret: String::new(),
            listen: default_provisioning_listen(),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_provisioning_prefix() -> String {
    "/_matrix/provision".to_string()
}

fn default_provisioning_listen() -> String {
    "127.0.0.1:29331".to_string()
}

/// MergeChat license settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergechatConfig {
    /// License key.
    #[serde(default)]
    pub license_key: String,

    /// Server identifier the license is bound to.
    #[serde(default)]
    pub server_id: String,

    /// License API base URL.
    #[serde(default = "default_mergechat_api_url")]
    pub api_url: String,
}

impl Default for MergechatConfig {
    fn default() -> Self {
        Self {
            license_key: String::new(),
            server_id: String::new(),
            api_url: default_mergechat_api_url(),
        }
    }
}

fn default_mergechat_api_url() -> String {
    "https://api.mergechat.io".to_string()
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URI.
    #[serde(default = "default_database_uri")]
    pub uri: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: default_database_uri(),
        }
    }
}

fn default_database_uri() -> String {
    "sqlite:maxbridge.db".to_string()
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter directive (tracing env-filter syntax).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.homeserver.domain = "example.com".to_string();
        config
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max.api_url, "https://platform-api.max.ru");
        assert_eq!(config.max.ws_url, "wss://ws-api.oneme.ru/websocket");
        assert_eq!(config.max.polling_timeout, 90);
        assert!(config.bridge.provisioning.enabled);
    }

    #[test]
    fn validation_requires_userid_placeholder() {
        let mut config = test_config();
        config.bridge.username_template = "max_ghost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn json5_parsing() {
        let content = r#"{
            // comment
            homeserver: { domain: "example.com" },
            max: { polling_timeout: 30, },
        }"#;
        let config: Config = json5::from_str(content).unwrap();
        assert_eq!(config.max.polling_timeout, 30);
        assert_eq!(config.homeserver.domain, "example.com");
    }

    #[test]
    fn config_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        let mut config = test_config();
        config.max.bot_token = Some("T".to_string());
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.max.bot_token.as_deref(), Some("T"));
    }

    #[test]
    fn ghost_mxid_roundtrip() {
        let config = test_config();
        let mxid = config.ghost_mxid(12345);
        assert_eq!(mxid, "@max_12345:example.com");
        assert_eq!(config.parse_ghost_mxid(&mxid), Some(12345));
        assert!(config.is_ghost_mxid(&mxid));
        assert!(!config.is_ghost_mxid("@alice:example.com"));
        assert_eq!(config.parse_ghost_mxid("@alice:example.com"), None);
    }

    #[test]
    fn permission_lookup_order() {
        let mut config = test_config();
        config
            .bridge
            .permissions
            .insert("@alice:example.com".to_string(), "full".to_string());
        config
            .bridge
            .permissions
            .insert("example.com".to_string(), "user".to_string());
        config
            .bridge
            .permissions
            .insert("*".to_string(), "relay".to_string());

        assert_eq!(config.permission_for("@alice:example.com"), Some("full"));
        assert_eq!(config.permission_for("@bob:example.com"), Some("user"));
        assert_eq!(config.permission_for("@eve:other.org"), Some("relay"));
    }

    #[test]
    fn displayname_template() {
        let config = test_config();
        assert_eq!(
            config.puppet_displayname("Bob", "bob", 200),
            "Bob (Max)".to_string()
        );
    }
}
