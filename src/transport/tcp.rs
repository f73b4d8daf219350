//! TCP transport: endpoint resolution, connect and read error classes.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire_client::transport::{connect, Endpoint};
//!
//! let endpoint = Endpoint::new("127.0.0.1", 8080);
//! let stream = connect(&endpoint, Some(Duration::from_millis(500))).await?;
//! ```

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};

/// Server address as given by the user (host name or IP, plus port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why the read side of a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStop {
    /// The server closed the connection.
    Eof,
    /// The connection was reset or aborted by the peer.
    Reset,
    /// Any other I/O or decode failure.
    Failed(String),
}

impl ReadStop {
    /// Classify a read error.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ReadStop::Eof,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ReadStop::Reset,
            _ => ReadStop::Failed(err.to_string()),
        }
    }

    /// Whether this stop ends the connection (as opposed to just the reads).
    pub fn disconnects(&self) -> bool {
        matches!(self, ReadStop::Eof | ReadStop::Reset)
    }
}

/// Resolve `endpoint` and connect to the first address that accepts.
///
/// With `Some(timeout)` the whole attempt (resolution included) is bounded
/// and fails with [`io::ErrorKind::TimedOut`].
pub async fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let attempt = connect_any(endpoint);
    let stream = match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {}ms", endpoint, limit.as_millis()),
            )
        })??,
        None => attempt.await?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn connect_any(endpoint: &Endpoint) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in lookup_host((endpoint.host(), endpoint.port())).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", endpoint),
        )
    }))
}
