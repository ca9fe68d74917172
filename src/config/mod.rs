//! Configuration management
//!
//! Layered: built-in defaults, then an optional TOML file (path taken from
//! `WEBPHONE_CONFIG`, default `webphone.toml`), then environment variables
//! such as `WEBPHONE__TELEPHONY__BASE_URL`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub telephony: TelephonyConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// PBX control API (ARI) settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Endpoint dialled for every offering session, e.g. `PJSIP/1001`
    pub endpoint: String,
    /// Stasis application that owns created channels
    pub app: String,
    pub app_args: String,
    /// Dialplan application that joins a channel to its bridge
    pub dialplan_app: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Protocol violations tolerated before a session is closed
    pub max_protocol_violations: u32,
    /// bcrypt cost for the in-memory user directory
    pub password_hash_cost: u32,
}

impl Config {
    /// Load configuration from defaults, file and environment
    pub fn load() -> Result<Self, ::config::ConfigError> {
        let path = std::env::var("WEBPHONE_CONFIG").unwrap_or_else(|_| "webphone.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ::config::ConfigError> {
        ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("WEBPHONE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8088/ari".to_string(),
            username: "asterisk".to_string(),
            password: String::new(),
            endpoint: "PJSIP/1001".to_string(),
            app: "webphone".to_string(),
            app_args: "dialed".to_string(),
            dialplan_app: "bridge".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl TelephonyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// Keeps the password out of logs
impl std::fmt::Debug for TelephonyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelephonyConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("endpoint", &self.endpoint)
            .field("app", &self.app)
            .field("app_args", &self.app_args)
            .field("dialplan_app", &self.dialplan_app)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_protocol_violations: 3,
            password_hash_cost: bcrypt::DEFAULT_COST,
        }
    }
}
