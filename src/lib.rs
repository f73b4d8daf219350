//! # rpcwire-client
//!
//! Client engine for msgpack-rpc servers.
//!
//! One client owns one TCP connection. Calls can be issued from any number
//! of threads; responses may come back in any order and are matched to their
//! callers by call id.
//!
//! ## Architecture
//!
//! - **Reactor thread**: a dedicated thread running a current-thread `tokio`
//!   runtime. It alone touches the socket and the table of pending calls.
//! - **Callers**: post commands to the reactor and wait on a per-call result
//!   slot, either blocking ([`Client::call`]) or awaiting a [`CallHandle`].
//! - **Connection state**: `initial`, `connected` or `disconnected`, observable
//!   through a callback and waitable with [`Client::wait_for_connection`].
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use rpcwire_client::Client;
//!
//! let client = Client::builder("127.0.0.1", 8080)
//!     .timeout(Duration::from_secs(1))
//!     .connect()?;
//!
//! let sum: i64 = client.call("add", &(2, 3))?;
//!
//! let handle = client.async_call("sub", &(5, 1))?;
//! let diff: i64 = handle.decode().await?;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

mod call;
mod client;
mod reactor;
mod state;
mod writer;

pub use call::{CallHandle, CallIdGenerator};
pub use client::{Client, ClientBuilder, ClientHandle, StateObserver};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use rmpv::Value;
pub use state::ConnectionState;
pub use transport::Endpoint;
