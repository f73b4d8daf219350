//! Error types for rpcwire-client.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON deserialization error (configuration only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed MsgPack on the byte stream.
    #[error("MsgPack read error: {0}")]
    MsgPackRead(#[from] rmpv::decode::Error),

    /// Conversion between a dynamic MsgPack value and a typed value failed.
    #[error("MsgPack value conversion error: {0}")]
    Value(#[from] rmpv::ext::Error),

    /// Protocol error (malformed message, oversized message, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered the call with an error payload.
    #[error("rpc error during call '{function}': {error}")]
    Rpc {
        /// Name of the function that failed.
        function: String,
        /// Error payload reported by the server.
        error: rmpv::Value,
    },

    /// Waiting for the connection exceeded the configured timeout.
    #[error("Timeout of {}ms while connecting to {endpoint}", .timeout.as_millis())]
    ConnectTimeout {
        /// `host:port` of the server.
        endpoint: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// Waiting for a call result exceeded the configured timeout.
    #[error("Timeout of {}ms while calling RPC function '{function}'", .timeout.as_millis())]
    CallTimeout {
        /// Name of the function that was called.
        function: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The client is not connected and no connection attempt is in flight.
    #[error("Not connected")]
    NotConnected,

    /// The server closed or reset the connection before answering.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The read loop stopped on an unrecoverable error.
    #[error("Read loop halted: {0}")]
    ReadLoopHalted(String),

    /// The client was torn down before the operation completed.
    #[error("Client shut down")]
    Shutdown,
}

impl ClientError {
    /// Returns true for either timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectTimeout { .. } | ClientError::CallTimeout { .. }
        )
    }
}

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;
