//! Dedicated writer task: the outbound write path.
//!
//! The socket's write half is owned by one task that receives encoded
//! messages over an mpsc channel. Messages are written strictly in the order
//! they were queued; whatever has piled up while a write was in progress is
//! batched into the next vectored write.
//!
//! # Architecture
//!
//! ```text
//! reactor ─► mpsc::UnboundedSender<OutboundMessage> ─► Writer Task ─► Socket
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ClientError, Result};

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded message ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Bytes,
}

impl OutboundMessage {
    #[inline]
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Handle for queueing messages on the writer task.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    /// Messages queued but not yet written.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Queue a message. Never waits.
    ///
    /// Fails with [`ClientError::ConnectionClosed`] once the writer task
    /// has stopped.
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(message).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            ClientError::ConnectionClosed
        })
    }

    /// Messages queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task on the current runtime.
///
/// The task ends cleanly once every [`WriterHandle`] is dropped, or with an
/// error on the first failed write.
pub fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, pending).await;
        if let Err(e) = &result {
            tracing::error!("Writer stopped: {}", e);
        }
        result
    });

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        let first = match rx.recv().await {
            Some(message) => message,
            None => {
                // All handles dropped.
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        batch.clear();
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        pending.fetch_sub(batch.len(), Ordering::Release);
    }
}

/// Write a batch of messages with vectored I/O, retrying partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundMessage]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundMessage::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything after the first `skip_bytes` bytes.
fn remaining_slices(batch: &[OutboundMessage], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for message in batch {
        let start = offset;
        let end = offset + message.size();
        offset = end;

        if skip_bytes < end && start < end {
            let skip_in_message = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&message.payload[skip_in_message..]));
        }
    }

    slices
}
