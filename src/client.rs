//! Client builder and facade.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the client and
//! starting it. The [`Client`] manages the lifecycle:
//! 1. Start the reactor thread with its own current-thread runtime
//! 2. Begin connecting to the server
//! 3. Post calls, notifications and reconnects to the reactor
//! 4. On drop, stop the reactor and join its thread
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use rpcwire_client::Client;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("127.0.0.1", 8080)
//!         .timeout(Duration::from_millis(500))
//!         .on_state_change(|client, prev, next| {
//!             println!("{}: {} -> {}", client.endpoint(), prev, next);
//!         })
//!         .connect()?;
//!
//!     let sum: i64 = client.call("add", &(2, 3))?;
//!     assert_eq!(sum, 5);
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::call::{CallHandle, CallIdGenerator};
use crate::codec::MsgPackCodec;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::protocol::{encode_notification, encode_request};
use crate::reactor::{Command, Reactor, Shared};
use crate::state::{ConnectionState, Listener, WaitOutcome};
use crate::transport::Endpoint;

/// Callback invoked as `(client, previous, current)` on every connection
/// state transition.
pub type StateObserver =
    Arc<dyn Fn(&ClientHandle, ConnectionState, ConnectionState) + Send + Sync + 'static>;

/// The owning client, as seen from inside a state observer.
///
/// Only lent to the observer for the duration of the callback. It never
/// keeps the reactor alive; once the client is dropped, reconnecting
/// fails with [`ClientError::Shutdown`].
pub struct ClientHandle {
    shared: Arc<Shared>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl ClientHandle {
    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.monitor.state()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.shared.endpoint()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.timeout()
    }

    /// Calls sent whose responses have not arrived yet.
    pub fn pending_calls(&self) -> usize {
        self.shared.in_flight()
    }

    /// Start reconnecting; the future resolves to the resulting state.
    ///
    /// Never blocks, so it is safe to call from an observer. Do not block on
    /// the returned future there: it is resolved by the thread running the
    /// observer.
    pub fn async_reconnect(
        &self,
    ) -> impl Future<Output = Result<ConnectionState>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        self.shared.monitor.begin_connect();
        let posted = self
            .commands
            .upgrade()
            .ok_or(ClientError::Shutdown)
            .and_then(|commands| {
                commands
                    .send(Command::Connect { reply: Some(reply) })
                    .map_err(|_| ClientError::Shutdown)
            });
        async move {
            posted?;
            rx.await.map_err(|_| ClientError::Shutdown)
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("endpoint", self.shared.endpoint())
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Adapt `observer` to the monitor's listener.
///
/// The listener lives inside `Shared`, so it only holds weak references;
/// a strong one would keep the client state alive forever.
fn bind_observer(
    shared: &Arc<Shared>,
    commands: &mpsc::UnboundedSender<Command>,
    observer: StateObserver,
) -> Listener {
    let shared: Weak<Shared> = Arc::downgrade(shared);
    let commands = commands.downgrade();
    Arc::new(move |previous, current| {
        if let Some(shared) = shared.upgrade() {
            let client = ClientHandle {
                shared,
                commands: commands.clone(),
            };
            observer(&client, previous, current);
        }
    })
}

/// Builder for configuring and starting a client.
pub struct ClientBuilder {
    config: ClientConfig,
    observer: Option<StateObserver>,
}

impl ClientBuilder {
    /// Create a builder for the server at `address:port`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self::from_config(ClientConfig::new(address, port))
    }

    /// Start from an existing configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            observer: None,
        }
    }

    /// Bound for connecting and for blocking waits.
    ///
    /// Default: none (wait indefinitely)
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX - 1));
        self
    }

    /// Set the upper bound for a single socket read.
    ///
    /// Default: 64 KiB
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    /// Set the largest message the read buffer may hold.
    ///
    /// Default: 64 MiB
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Name the reactor thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Register an observer for connection state transitions.
    ///
    /// Installed before the first connect attempt, so it sees the very first
    /// transition. It runs on the reactor thread and must not block.
    pub fn on_state_change<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ClientHandle, ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Start the reactor and begin connecting.
    ///
    /// Returns as soon as the attempt is under way; use
    /// [`Client::wait_for_connection`] to wait for its outcome.
    pub fn connect(self) -> Result<Client> {
        Client::start(self.config, self.observer)
    }
}

/// Client for one msgpack-rpc server connection.
///
/// All methods take `&self`; share the client across threads with an `Arc`.
pub struct Client {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    handle: ClientHandle,
    ids: CallIdGenerator,
    runtime: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(address: impl Into<String>, port: u16) -> ClientBuilder {
        ClientBuilder::new(address, port)
    }

    /// Connect to `address:port` with default settings.
    pub fn new(address: impl Into<String>, port: u16) -> Result<Self> {
        Self::builder(address, port).connect()
    }

    /// Connect using a full configuration.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        ClientBuilder::from_config(config).connect()
    }

    fn start(config: ClientConfig, observer: Option<StateObserver>) -> Result<Self> {
        let endpoint = Endpoint::new(config.address.clone(), config.port);
        let shared = Arc::new(Shared::new(
            endpoint,
            config.timeout(),
            config.read_chunk_size,
            config.max_message_size,
        ));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let (commands, rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(shared.clone(), rx);
        if let Some(observer) = observer {
            shared
                .monitor
                .set_listener(Some(bind_observer(&shared, &commands, observer)));
        }

        // Queued ahead of any call, so early calls wait in the backlog.
        shared.monitor.begin_connect();
        commands
            .send(Command::Connect { reply: None })
            .map_err(|_| ClientError::Shutdown)?;

        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                runtime.block_on(reactor.run());
            })?;

        tracing::debug!("Client for {} started", shared.endpoint());
        Ok(Self {
            handle: ClientHandle {
                shared: shared.clone(),
                commands: commands.downgrade(),
            },
            shared,
            commands,
            ids: CallIdGenerator::new(),
            runtime: handle,
            thread: Some(thread),
        })
    }

    /// Call `function` and block until its result arrives.
    ///
    /// Waits for the connection first, then for the response, each bounded
    /// by the configured timeout. `args` is a tuple of arguments; `()` sends
    /// none.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime; use
    /// [`async_call`](Self::async_call) there instead.
    pub fn call<A, R>(&self, function: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.wait_for_connection()?;
        let handle = self.async_call(function, args)?;
        let value = handle.wait(self.timeout())?;
        MsgPackCodec::from_value(value)
    }

    /// Send a call and return a handle to its result without waiting.
    ///
    /// A call made while a connect attempt is in flight is sent once the
    /// connection is up. The handle can be awaited from any runtime or
    /// waited on from a plain thread.
    pub fn async_call<A>(&self, function: &str, args: &A) -> Result<CallHandle>
    where
        A: Serialize + ?Sized,
    {
        let params = MsgPackCodec::params(args)?;
        let id = self.ids.next();
        let payload = encode_request(id, function, &params)?;
        let (slot, rx) = oneshot::channel();

        self.post(Command::Call {
            id,
            function: function.to_string(),
            payload,
            slot,
        })?;
        Ok(CallHandle::new(id, function.to_string(), rx, self.runtime.clone()))
    }

    /// Send a notification: no id, no response.
    pub fn notify<A>(&self, function: &str, args: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        if self.connection_state() == ConnectionState::Disconnected
            && !self.shared.monitor.is_connecting()
        {
            return Err(ClientError::NotConnected);
        }
        let params = MsgPackCodec::params(args)?;
        let payload = encode_notification(function, &params)?;
        self.post(Command::Notify {
            function: function.to_string(),
            payload,
        })
    }

    /// Block until connected, honoring the configured timeout.
    ///
    /// Fails with [`ClientError::ConnectTimeout`] when the bound is exceeded,
    /// and with [`ClientError::NotConnected`] when the connection is down and
    /// no attempt is in flight.
    pub fn wait_for_connection(&self) -> Result<()> {
        let timeout = self.timeout();
        match self.shared.monitor.wait_connected(timeout) {
            WaitOutcome::Connected => Ok(()),
            WaitOutcome::Failed => Err(ClientError::NotConnected),
            WaitOutcome::TimedOut => Err(ClientError::ConnectTimeout {
                endpoint: self.shared.endpoint().to_string(),
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Current connection state.
    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.handle.connection_state()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Server this client talks to.
    pub fn endpoint(&self) -> &Endpoint {
        self.handle.endpoint()
    }

    /// Set the bound for connecting and for blocking waits.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.set_timeout(Some(timeout));
    }

    /// Wait indefinitely from now on.
    pub fn clear_timeout(&self) {
        self.shared.set_timeout(None);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.handle.timeout()
    }

    /// Calls sent whose responses have not arrived yet.
    pub fn pending_calls(&self) -> usize {
        self.handle.pending_calls()
    }

    /// Block until every call outstanding right now has resolved.
    ///
    /// Calls made after this point are not waited for.
    pub fn wait_all_responses(&self) -> Result<()> {
        self.runtime.block_on(self.async_wait_all_responses())
    }

    /// Async form of [`wait_all_responses`](Self::wait_all_responses).
    pub fn async_wait_all_responses(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let posted = self.post(Command::Drain { reply });
        async move {
            posted?;
            rx.await.map_err(|_| ClientError::Shutdown)
        }
    }

    /// Reconnect and block until the attempt resolves.
    ///
    /// Returns the resulting state. When already connected, nothing is done
    /// and [`ConnectionState::Connected`] is returned; when an attempt is
    /// already in flight, this one joins it.
    pub fn reconnect(&self) -> Result<ConnectionState> {
        self.runtime.block_on(self.async_reconnect())
    }

    /// Start reconnecting; the future resolves to the resulting state.
    ///
    /// The attempt starts immediately, whether or not the future is polled.
    pub fn async_reconnect(
        &self,
    ) -> impl Future<Output = Result<ConnectionState>> + Send + 'static {
        self.handle.async_reconnect()
    }

    /// Install the connection state observer, replacing any previous one.
    pub fn set_state_handler<F>(&self, observer: F)
    where
        F: Fn(&ClientHandle, ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        let listener = bind_observer(&self.shared, &self.commands, Arc::new(observer));
        self.shared.monitor.set_listener(Some(listener));
    }

    /// Remove the connection state observer.
    pub fn clear_state_handler(&self) {
        self.shared.monitor.set_listener(None);
    }

    fn post(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ClientError::Shutdown)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Reactor thread for {} panicked", self.shared.endpoint());
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", self.shared.endpoint())
            .field("state", &self.connection_state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
