//! Client configuration.
//!
//! ```ignore
//! let config = ClientConfig::from_json(r#"{ "address": "10.0.0.5", "port": 8080, "timeout_ms": 500 }"#)?;
//! let client = Client::from_config(config)?;
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_CHUNK_SIZE};

/// Default name of the reactor thread.
pub const DEFAULT_THREAD_NAME: &str = "rpcwire-reactor";

/// Settings for one client instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or IP address of the server.
    pub address: String,
    pub port: u16,
    /// Bound for connecting and for blocking waits. `None` waits forever.
    pub timeout_ms: Option<u64>,
    /// Upper bound for one socket read.
    pub read_chunk_size: usize,
    /// Maximum bytes one incomplete message may occupy in the read buffer.
    pub max_message_size: usize,
    /// Name given to the reactor thread.
    pub thread_name: String,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 0,
            timeout_ms: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}
