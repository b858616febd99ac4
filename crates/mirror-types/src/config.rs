//! Process configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default TCP port for the server.
pub const DEFAULT_PORT: u16 = 3000;

/// Default seconds a best-match call waits for its reply.
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 10;

/// Top-level configuration, loaded from `~/.mirror/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Address the server listens on and the client connects to.
    pub listen_addr: SocketAddr,
    /// Root directory exposed to peers as `/`.
    pub root_dir: PathBuf,
    /// Login password checked by the server.
    pub password: String,
    /// Seconds a best-match call waits for its reply.
    pub reply_timeout_secs: u64,
    /// Stable identifier of this node.
    pub node_id: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            root_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            password: "iamtostupidtochangemypassword".to_string(),
            reply_timeout_secs: DEFAULT_REPLY_TIMEOUT_SECS,
            node_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl MirrorConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// `~/.mirror`, falling back to the working directory.
pub fn mirror_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".mirror"))
        .unwrap_or_else(|| PathBuf::from(".mirror"))
}

/// `~/.mirror/config.toml`.
pub fn default_config_path() -> PathBuf {
    mirror_home().join("config.toml")
}
