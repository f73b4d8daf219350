//! Call correlation: ids, result slots and the pending-call table.
//!
//! ```text
//! caller ──► CallIdGenerator::next() ──► oneshot (slot, handle)
//!                                          │        │
//!            reactor: CallTable ◄──────────┘        └──► CallHandle (await / wait)
//!            Response { id } ──► CallTable::resolve ──► Completion::deliver
//! ```
//!
//! The table is owned by the reactor task; it is never shared behind a lock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::codec::MsgPackCodec;
use crate::error::{ClientError, Result};
use crate::protocol::{CallId, Response};

/// Write side of a call's result slot.
pub(crate) type ResultSlot = oneshot::Sender<Result<Value>>;

/// Hands out call ids: 1, 2, 3, ... wrapping at `u32::MAX`.
#[derive(Debug, Default)]
pub struct CallIdGenerator {
    last: AtomicU32,
}

impl CallIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id (post-increment value).
    #[inline]
    pub fn next(&self) -> CallId {
        self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    #[cfg(test)]
    fn starting_after(last: CallId) -> Self {
        Self {
            last: AtomicU32::new(last),
        }
    }
}

/// A call that has been sent and is waiting for its response.
#[derive(Debug)]
pub(crate) struct PendingCall {
    function: String,
    slot: ResultSlot,
}

impl PendingCall {
    pub(crate) fn new(function: String, slot: ResultSlot) -> Self {
        Self { function, slot }
    }

    pub(crate) fn function(&self) -> &str {
        &self.function
    }

    /// Pair the call with the server's answer.
    pub(crate) fn answer(self, outcome: std::result::Result<Value, Value>) -> Completion {
        let result = outcome.map_err(|error| ClientError::Rpc {
            function: self.function.clone(),
            error,
        });
        Completion { call: self, result }
    }

    /// Pair the call with a failure that did not come from the server.
    pub(crate) fn failure(self, err: ClientError) -> Completion {
        Completion {
            call: self,
            result: Err(err),
        }
    }

    /// Resolve without a response, right away.
    pub(crate) fn fail(self, err: ClientError) {
        self.failure(err).deliver();
    }
}

/// A call taken out of the table together with its result.
///
/// Nothing reaches the caller until [`deliver`](Completion::deliver), so the
/// table's owner can publish its bookkeeping first.
#[derive(Debug)]
pub(crate) struct Completion {
    call: PendingCall,
    result: Result<Value>,
}

impl Completion {
    pub(crate) fn deliver(self) {
        // The caller may have timed out and dropped its handle.
        let _ = self.call.slot.send(self.result);
    }
}

/// Call id → pending call.
#[derive(Debug, Default)]
pub(crate) struct CallTable {
    calls: HashMap<CallId, PendingCall>,
}

impl CallTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a call.
    ///
    /// An id that is still outstanding is never reused; the new call is
    /// handed back unregistered instead.
    pub(crate) fn insert(&mut self, id: CallId, call: PendingCall) -> Option<PendingCall> {
        if self.calls.contains_key(&id) {
            return Some(call);
        }
        self.calls.insert(id, call);
        None
    }

    /// Remove the call a response belongs to, paired with its result.
    ///
    /// Returns `None` if no call with that id is outstanding.
    pub(crate) fn resolve(&mut self, response: Response) -> Option<Completion> {
        let call = self.calls.remove(&response.id)?;
        if let Err(error) = &response.outcome {
            tracing::debug!(
                "call {} to '{}' failed on the server: {}",
                response.id,
                call.function(),
                error
            );
        }
        Some(call.answer(response.outcome))
    }

    /// Remove every outstanding call, each paired with a failure.
    pub(crate) fn fail_all(&mut self, mut error: impl FnMut() -> ClientError) -> Vec<Completion> {
        self.calls
            .drain()
            .map(|(_, call)| call.failure(error()))
            .collect()
    }

    /// Take a call out without resolving it.
    pub(crate) fn remove(&mut self, id: CallId) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// Ids of every outstanding call.
    pub(crate) fn ids(&self) -> impl Iterator<Item = CallId> + '_ {
        self.calls.keys().copied()
    }

    pub(crate) fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Read side of a call's result slot.
///
/// `.await` it from async code, or [`wait`](CallHandle::wait) from a plain
/// thread. Dropping the handle abandons the result; the response is still
/// consumed and the call is still removed from the table when it arrives.
#[derive(Debug)]
pub struct CallHandle {
    id: CallId,
    function: String,
    rx: oneshot::Receiver<Result<Value>>,
    runtime: Handle,
}

impl CallHandle {
    pub(crate) fn new(
        id: CallId,
        function: String,
        rx: oneshot::Receiver<Result<Value>>,
        runtime: Handle,
    ) -> Self {
        Self {
            id,
            function,
            rx,
            runtime,
        }
    }

    /// Id the call was sent with.
    #[inline]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Name of the called function.
    #[inline]
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Block the current thread until the result arrives.
    ///
    /// With `Some(timeout)` gives up after that long with
    /// [`ClientError::CallTimeout`].
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime; `.await` the handle
    /// there instead.
    pub fn wait(self, timeout: Option<Duration>) -> Result<Value> {
        let CallHandle {
            function,
            rx,
            runtime,
            ..
        } = self;

        runtime.block_on(async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(received) => flatten(received),
                    Err(_) => Err(ClientError::CallTimeout {
                        function,
                        timeout: limit,
                    }),
                },
                None => flatten(rx.await),
            }
        })
    }

    /// Await the result and convert it to `R`.
    pub async fn decode<R: DeserializeOwned>(self) -> Result<R> {
        MsgPackCodec::from_value(self.await?)
    }

    /// Take the result if it has already arrived.
    pub fn try_result(&mut self) -> Option<Result<Value>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::Shutdown)),
        }
    }
}

impl Future for CallHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(flatten)
    }
}

/// A dropped slot means the reactor went away without answering.
fn flatten(
    received: std::result::Result<Result<Value>, oneshot::error::RecvError>,
) -> Result<Value> {
    received.unwrap_or_else(|_| Err(ClientError::Shutdown))
}
