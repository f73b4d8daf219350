//! The I/O reactor: one actor that owns the connection and the call table.
//!
//! Caller threads never touch the socket or the table. They post
//! [`Command`]s; the reactor task consumes them one at a time, together with
//! the events produced by its own connect and read tasks. Everything runs on
//! a single current-thread runtime, so no two of these steps ever overlap.
//!
//! ```text
//! caller threads ─► Command ─┐
//!                            ├─► Reactor ─► CallTable / WriterHandle / ConnectionMonitor
//! connect task ─► Event ─────┤
//! read loop    ─► Event ─────┤
//! writer task  ─► Event ─────┘
//! ```

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::call::{CallTable, Completion, PendingCall, ResultSlot};
use crate::error::ClientError;
use crate::protocol::{CallId, Message, MessageDecoder, Response};
use crate::state::{ConnectionMonitor, ConnectionState};
use crate::transport::{self, Endpoint, ReadStop};
use crate::writer::{spawn_writer_task, OutboundMessage, WriterHandle};

/// Stored in `timeout_ms` when no timeout is set.
const NO_TIMEOUT: u64 = u64::MAX;

/// State read by both the caller threads and the reactor.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) monitor: ConnectionMonitor,
    endpoint: Endpoint,
    timeout_ms: AtomicU64,
    in_flight: AtomicUsize,
    read_chunk_size: usize,
    max_message_size: usize,
}

impl Shared {
    pub(crate) fn new(
        endpoint: Endpoint,
        timeout: Option<Duration>,
        read_chunk_size: usize,
        max_message_size: usize,
    ) -> Self {
        let shared = Self {
            monitor: ConnectionMonitor::new(endpoint.clone()),
            endpoint,
            timeout_ms: AtomicU64::new(NO_TIMEOUT),
            in_flight: AtomicUsize::new(0),
            read_chunk_size,
            max_message_size,
        };
        shared.set_timeout(timeout);
        shared
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms.load(Ordering::Acquire) {
            NO_TIMEOUT => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(NO_TIMEOUT, |t| {
            u64::try_from(t.as_millis()).unwrap_or(NO_TIMEOUT - 1)
        });
        self.timeout_ms.store(ms, Ordering::Release);
    }

    /// Calls registered in the table right now.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Work posted to the reactor by the client facade.
#[derive(Debug)]
pub(crate) enum Command {
    /// Start a connect attempt, or join the one in flight.
    Connect {
        reply: Option<oneshot::Sender<ConnectionState>>,
    },
    /// Register a call and queue its encoded request.
    Call {
        id: CallId,
        function: String,
        payload: Bytes,
        slot: ResultSlot,
    },
    /// Queue an encoded notification.
    Notify { function: String, payload: Bytes },
    /// Reply once every call outstanding right now has resolved.
    Drain { reply: oneshot::Sender<()> },
    Shutdown,
}

/// Completions reported by tasks the reactor spawned.
#[derive(Debug)]
enum Event {
    Connected(io::Result<TcpStream>),
    Inbound {
        session: u64,
        responses: Vec<Response>,
    },
    ReadStopped {
        session: u64,
        reason: ReadStop,
    },
    WriteFailed {
        session: u64,
        reason: String,
    },
}

#[derive(Debug)]
struct DrainWaiter {
    ids: HashSet<CallId>,
    reply: oneshot::Sender<()>,
}

/// The actor owning the connection.
pub(crate) struct Reactor {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    calls: CallTable,
    writer: Option<WriterHandle>,
    /// Messages posted while a connect attempt is in flight.
    backlog: Vec<OutboundMessage>,
    /// `Some` while a connect attempt is in flight, holding its waiters.
    connecting: Option<Vec<oneshot::Sender<ConnectionState>>>,
    /// Set when the read loop stopped without losing the connection.
    halted: Option<String>,
    /// Bumped whenever a connection is attached or dropped; events from
    /// older sessions are ignored.
    session: u64,
    read_task: Option<JoinHandle<()>>,
    drains: Vec<DrainWaiter>,
}

impl Reactor {
    pub(crate) fn new(shared: Arc<Shared>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            shared,
            commands,
            events_tx,
            events,
            calls: CallTable::new(),
            writer: None,
            backlog: Vec::new(),
            connecting: None,
            halted: None,
            session: 0,
            read_task: None,
            drains: Vec::new(),
        }
    }

    /// Process commands and events until shut down.
    ///
    /// Returns when [`Command::Shutdown`] arrives or every command sender is
    /// gone. Outstanding calls are failed with [`ClientError::Shutdown`].
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.on_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        self.shutdown();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(reply),
            Command::Call {
                id,
                function,
                payload,
                slot,
            } => self.call(id, function, payload, slot),
            Command::Notify { function, payload } => self.notify(function, payload),
            Command::Drain { reply } => self.drain(reply),
            Command::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Connected(result) => self.connect_finished(result),
            Event::Inbound { session, responses } if session == self.session => {
                let mut completed = Vec::with_capacity(responses.len());
                for response in responses {
                    let id = response.id;
                    match self.calls.resolve(response) {
                        Some(completion) => completed.push(completion),
                        None => tracing::debug!("Response for unknown call id {}", id),
                    }
                }
                self.settle(completed);
            }
            Event::ReadStopped { session, reason } if session == self.session => {
                self.read_stopped(reason)
            }
            Event::WriteFailed { session, reason } if session == self.session => {
                tracing::error!("Write to {} failed: {}", self.shared.endpoint(), reason);
                self.disconnected();
            }
            Event::Inbound { session, .. }
            | Event::ReadStopped { session, .. }
            | Event::WriteFailed { session, .. } => {
                tracing::trace!("Ignoring event from stale session {}", session);
            }
        }
    }

    fn connect(&mut self, reply: Option<oneshot::Sender<ConnectionState>>) {
        if let Some(waiters) = self.connecting.as_mut() {
            waiters.extend(reply);
            return;
        }

        if self.writer.is_some() && self.halted.is_none() {
            // Clears the connecting flag a caller may have raised.
            self.shared.monitor.finish_connect(ConnectionState::Connected);
            if let Some(reply) = reply {
                let _ = reply.send(ConnectionState::Connected);
            }
            return;
        }

        // Reconnecting after a halted read loop drops the old connection.
        self.detach();
        self.halted = None;

        self.connecting = Some(reply.into_iter().collect());
        self.shared.monitor.begin_connect();

        let endpoint = self.shared.endpoint().clone();
        let timeout = self.shared.timeout();
        let events = self.events_tx.clone();
        tracing::info!("Initiating connection to {}", endpoint);
        tokio::spawn(async move {
            let result = transport::connect(&endpoint, timeout).await;
            let _ = events.send(Event::Connected(result));
        });
    }

    fn connect_finished(&mut self, result: io::Result<TcpStream>) {
        let waiters = self.connecting.take().unwrap_or_default();

        let state = match result {
            Ok(stream) => {
                self.attach(stream);
                ConnectionState::Connected
            }
            Err(e) => {
                tracing::error!("Error during connection to {}: {}", self.shared.endpoint(), e);
                self.backlog.clear();
                let failed = self.calls.fail_all(|| ClientError::NotConnected);
                if !failed.is_empty() {
                    tracing::debug!("Failed {} calls posted while connecting", failed.len());
                }
                self.settle(failed);
                ConnectionState::Disconnected
            }
        };

        self.shared.monitor.finish_connect(state);
        for waiter in waiters {
            let _ = waiter.send(state);
        }
    }

    /// Start the writer and the read loop on a fresh connection.
    fn attach(&mut self, stream: TcpStream) {
        self.session += 1;
        tracing::info!("Client connected to {}", self.shared.endpoint());

        let (read_half, write_half) = stream.into_split();
        self.start_writer(write_half);

        let decoder =
            MessageDecoder::with_limits(self.shared.read_chunk_size, self.shared.max_message_size);
        tracing::trace!("Reading with chunk size {}", decoder.chunk_size());
        self.read_task = Some(tokio::spawn(read_loop(
            read_half,
            decoder,
            self.events_tx.clone(),
            self.session,
        )));
    }

    /// Spawn the writer task, flush the backlog into it and watch it for
    /// failure.
    fn start_writer<W>(&mut self, write_half: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, task) = spawn_writer_task(write_half);
        for message in self.backlog.drain(..) {
            // A fresh writer task cannot have stopped yet.
            let _ = writer.send(message);
        }
        self.writer = Some(writer);

        let events = self.events_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            let reason = match task.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            let _ = events.send(Event::WriteFailed { session, reason });
        });
    }

    /// Drop the current connection, if any. Pending calls are left alone.
    fn detach(&mut self) {
        self.session += 1;
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        // Dropping the last handle stops the writer task.
        if let Some(writer) = self.writer.take() {
            let unsent = writer.pending_count();
            if unsent > 0 {
                tracing::debug!("Dropping {} unsent messages", unsent);
            }
        }
    }

    fn read_stopped(&mut self, stop: ReadStop) {
        self.read_task = None;
        if stop.disconnects() {
            if stop == ReadStop::Reset {
                tracing::warn!("The connection was reset.");
            } else {
                tracing::info!("The server closed the connection.");
            }
            self.disconnected();
        } else if let ReadStop::Failed(reason) = stop {
            tracing::error!("Unhandled error during read: {}", reason);
            let failed = self
                .calls
                .fail_all(|| ClientError::ReadLoopHalted(reason.clone()));
            self.halted = Some(reason);
            self.settle(failed);
        }
    }

    fn disconnected(&mut self) {
        self.detach();
        self.halted = None;
        let failed = self.calls.fail_all(|| ClientError::ConnectionClosed);
        if !failed.is_empty() {
            tracing::debug!("Failed {} calls on disconnect", failed.len());
        }
        self.settle(failed);
        self.shared.monitor.transition(ConnectionState::Disconnected);
    }

    fn call(&mut self, id: CallId, function: String, payload: Bytes, slot: ResultSlot) {
        let call = PendingCall::new(function, slot);

        if let Some(reason) = &self.halted {
            call.fail(ClientError::ReadLoopHalted(reason.clone()));
            return;
        }
        if self.writer.is_none() && self.connecting.is_none() {
            call.fail(ClientError::NotConnected);
            return;
        }

        tracing::trace!("Posting call {} to '{}'", id, call.function());
        if let Some(rejected) = self.calls.insert(id, call) {
            rejected.fail(ClientError::Protocol(format!(
                "call id {} is still outstanding",
                id
            )));
            return;
        }

        let failed = match self.post(OutboundMessage::new(payload)) {
            Ok(()) => Vec::new(),
            Err(e) => self
                .calls
                .remove(id)
                .map(|call| vec![call.failure(e)])
                .unwrap_or_default(),
        };
        self.settle(failed);
    }

    fn notify(&mut self, function: String, payload: Bytes) {
        if self.writer.is_none() && self.connecting.is_none() {
            tracing::debug!("Dropping notification '{}': not connected", function);
            return;
        }
        if let Err(e) = self.post(OutboundMessage::new(payload)) {
            tracing::warn!("Dropping notification '{}': {}", function, e);
        }
    }

    /// Queue a message on the writer, or on the backlog while connecting.
    fn post(&mut self, message: OutboundMessage) -> crate::error::Result<()> {
        match &self.writer {
            Some(writer) => writer.send(message),
            None => {
                self.backlog.push(message);
                Ok(())
            }
        }
    }

    fn drain(&mut self, reply: oneshot::Sender<()>) {
        if self.calls.is_empty() {
            let _ = reply.send(());
            return;
        }
        self.drains.push(DrainWaiter {
            ids: self.calls.ids().collect(),
            reply,
        });
    }

    /// Publish the table size, then hand out the given results, then release
    /// drain waiters that are done.
    ///
    /// A caller woken by its result already sees the table without its call.
    fn settle(&mut self, completed: Vec<Completion>) {
        self.shared.in_flight.store(self.calls.len(), Ordering::Release);
        for completion in completed {
            completion.deliver();
        }

        if self.drains.is_empty() {
            return;
        }
        let calls = &self.calls;
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.drains)
            .into_iter()
            .partition(|drain| drain.ids.iter().all(|id| !calls.contains(*id)));
        self.drains = waiting;
        for drain in done {
            let _ = drain.reply.send(());
        }
    }

    fn shutdown(&mut self) {
        self.detach();
        self.backlog.clear();
        let failed = self.calls.fail_all(|| ClientError::Shutdown);
        let count = failed.len();
        self.settle(failed);
        tracing::debug!("Reactor stopped, {} pending calls failed", count);
    }
}

/// Read until the stream ends or fails, reporting decoded responses.
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut decoder: MessageDecoder,
    events: mpsc::UnboundedSender<Event>,
    session: u64,
) {
    let reason = loop {
        match decoder.read_from(&mut reader).await {
            Ok(0) => break ReadStop::Eof,
            Ok(_) => {}
            Err(e) => break ReadStop::classify(&e),
        }

        let messages = match decoder.drain() {
            Ok(messages) => messages,
            Err(e) => break ReadStop::Failed(e.to_string()),
        };

        let mut responses = Vec::with_capacity(messages.len());
        for message in messages {
            match message {
                Message::Response(response) => responses.push(response),
                other => {
                    tracing::debug!("Skipping server message of type {}", other.kind());
                }
            }
        }

        if !responses.is_empty()
            && events
                .send(Event::Inbound { session, responses })
                .is_err()
        {
            // Reactor is gone.
            return;
        }
    };

    let _ = events.send(Event::ReadStopped { session, reason });
}
