use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Accepted range for `maxSendQueue`, from the file or `PARLEY_SEND_QUEUE`.
pub const SEND_QUEUE_RANGE: (usize, usize) = (1, 65_536);
/// Accepted range for `timeoutSecs`, from the file or `PARLEY_INFERENCE_TIMEOUT_SECS`.
pub const INFERENCE_TIMEOUT_RANGE: (u64, u64) = (1, 600);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub inference: InferenceSettings,
    pub hub: HubSettings,
    pub logging: LoggingSettings,
}

/// Listener and per-connection limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound queue capacity per connection. A connection whose queue fills up is dropped.
    pub max_send_queue: usize,
    /// Interval between keepalive pings on each socket.
    pub ping_interval_secs: u64,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_send_queue: 256,
            ping_interval_secs: 30,
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    /// `max_send_queue` clamped to [`SEND_QUEUE_RANGE`].
    pub fn send_queue(&self) -> usize {
        let (min, max) = SEND_QUEUE_RANGE;
        self.max_send_queue.clamp(min, max)
    }
}

/// Where the inference backend lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InferenceSettings {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout_secs: 30,
        }
    }
}

impl InferenceSettings {
    /// `timeout_secs` clamped to [`INFERENCE_TIMEOUT_RANGE`].
    pub fn timeout(&self) -> Duration {
        let (min, max) = INFERENCE_TIMEOUT_RANGE;
        Duration::from_secs(self.timeout_secs.clamp(min, max))
    }
}

/// Who receives the replies to a user's message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every live connection (one shared room).
    #[default]
    Broadcast,
    /// Only the connection that sent the message.
    Origin,
}

/// Which session id is sent to the inference backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionScope {
    /// A fresh session per connection.
    #[default]
    Connection,
    /// One placeholder session for everyone.
    Shared,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    pub delivery: DeliveryMode,
    pub session_scope: SessionScope,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level. `RUST_LOG` wins when set.
    pub level: String,
    /// Per-module overrides, e.g. `{"parley_server": "debug"}`.
    pub modules: BTreeMap<String, String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            json: false,
        }
    }
}
