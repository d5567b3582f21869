use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use phx_channels::{Backoff, Origin, SocketConfig, TransportFactory};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Layered config: defaults → phx.toml (or --config) → PHX_* env vars
// =============================================================================
//
//   phx.toml:   endpoint = "wss://example.com/socket"
//               [origin]
//               host = "example.com"
//
//   env var:    PHX_ORIGIN__HOST=example.com   (double underscore = nesting)

const DEFAULT_CONFIG_FILE: &str = "phx.toml";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Websocket,
    Longpoll,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_after_ms")]
    pub reconnect_after_ms: Vec<u64>,
    #[serde(default = "default_longpoller_timeout_ms")]
    pub longpoller_timeout_ms: u64,
    /// Default join params for every channel.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Needed only for relative endpoints.
    #[serde(default)]
    pub origin: Option<Origin>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            transport: TransportKind::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_after_ms: default_reconnect_after_ms(),
            longpoller_timeout_ms: default_longpoller_timeout_ms(),
            params: Map::new(),
            origin: None,
        }
    }
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:4000/socket/websocket".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_reconnect_after_ms() -> Vec<u64> {
    vec![1000, 5000, 10000]
}
fn default_longpoller_timeout_ms() -> u64 {
    20_000
}

impl FileConfig {
    pub fn socket_config(&self) -> SocketConfig {
        let transport = match self.transport {
            TransportKind::Websocket => TransportFactory::websocket(),
            TransportKind::Longpoll => TransportFactory::long_poll(),
        };
        SocketConfig {
            transport,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            reconnect_after: Backoff::stepped(&self.reconnect_after_ms),
            logger: None,
            longpoller_timeout: Duration::from_millis(self.longpoller_timeout_ms),
            params: self.params.clone(),
            origin: self.origin.clone(),
        }
    }
}

/// Build a figment that layers: defaults → config file → PHX_* env vars.
///
/// Without `--config`, `phx.toml` in the working directory is used if present.
pub fn load_config(config_file: Option<&Path>) -> Figment {
    let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("PHX_").split("__"))
}
