//! Connection state machine.
//!
//! ```text
//!            connect ok                 EOF / reset
//! Initial ───────────────► Connected ───────────────► Disconnected
//!    │                         ▲                           │
//!    │ connect failed          └──── reconnect ok ─────────┘
//!    └───────────────────────────────────────────────────► Disconnected
//! ```
//!
//! The [`ConnectionMonitor`] owns the state, the condition variable that
//! connection waiters sleep on, and the optional listener. Transitions are
//! only applied from the reactor thread, so the observer sees them one at a
//! time and in order even though it is invoked outside the lock.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::transport::Endpoint;

/// Lifecycle of the client's single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// No connect attempt has finished yet.
    Initial = 0,
    /// The socket is connected and the read loop is running.
    Connected = 1,
    /// The connect attempt failed, or the server closed/reset the connection.
    Disconnected = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            _ => ConnectionState::Initial,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initial => "initial",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Called as `(previous, current)` on every transition.
///
/// The client wraps its public observer into one of these.
pub(crate) type Listener = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync + 'static>;

/// Outcome of [`ConnectionMonitor::wait_connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Connected,
    /// No attempt is in flight and the last one failed.
    Failed,
    TimedOut,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    connecting: bool,
}

/// Connection state plus the waiters and listener attached to it.
pub struct ConnectionMonitor {
    endpoint: Endpoint,
    snapshot: AtomicU8,
    inner: Mutex<Inner>,
    changed: Condvar,
    listener: Mutex<Option<Listener>>,
}

impl ConnectionMonitor {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            snapshot: AtomicU8::new(ConnectionState::Initial as u8),
            inner: Mutex::new(Inner {
                state: ConnectionState::Initial,
                connecting: false,
            }),
            changed: Condvar::new(),
            listener: Mutex::new(None),
        }
    }

    /// Lock-free snapshot of the current state.
    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.snapshot.load(Ordering::Acquire))
    }

    /// Whether a connect attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        self.lock().connecting
    }

    /// Install (or with `None`, remove) the listener. Returns the old one.
    pub(crate) fn set_listener(&self, listener: Option<Listener>) -> Option<Listener> {
        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, listener)
    }

    /// Mark a connect attempt as in flight.
    pub(crate) fn begin_connect(&self) {
        self.lock().connecting = true;
    }

    /// Record the result of the in-flight connect attempt.
    pub(crate) fn finish_connect(&self, state: ConnectionState) {
        self.apply(state, true);
    }

    /// Apply a transition that does not end a connect attempt (EOF, reset).
    pub(crate) fn transition(&self, state: ConnectionState) {
        self.apply(state, false);
    }

    fn apply(&self, state: ConnectionState, finishes_connect: bool) {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.state = state;
            if finishes_connect {
                inner.connecting = false;
            }
            self.snapshot.store(state as u8, Ordering::Release);
            self.changed.notify_all();
            previous
        };

        if previous == state {
            return;
        }

        tracing::debug!("connection to {}: {} -> {}", self.endpoint, previous, state);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(previous, state);
        }
    }

    /// Block until connected.
    ///
    /// Returns early with [`WaitOutcome::Failed`] when the state is
    /// disconnected and no attempt is in flight, since nothing would ever
    /// wake the waiter. `None` waits without a bound.
    pub fn wait_connected(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();

        loop {
            match inner.state {
                ConnectionState::Connected => return WaitOutcome::Connected,
                ConnectionState::Disconnected if !inner.connecting => return WaitOutcome::Failed,
                _ => {}
            }

            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    self.changed
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .changed
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
