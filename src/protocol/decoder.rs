//! Incremental message decoder over a growable read buffer.
//!
//! Uses `bytes::BytesMut` for the decode buffer. Socket reads land in the
//! buffer's spare capacity; complete MsgPack values are then peeled off the
//! front one at a time. A value that is cut short by the end of the buffer
//! stays buffered until the next read completes it.
//!
//! # Framing
//!
//! MsgPack carries no length prefix, so the decoder walks the front value's
//! markers and length fields to find where it ends. The walk resumes where
//! the previous read left off; payload bytes of strings, binaries and
//! extensions are skipped, never looked at. Only once the whole value is
//! buffered is it decoded, exactly once.
//!
//! # Buffer growth
//!
//! Before every read the decoder makes sure the spare capacity is at least
//! one read chunk. When it is not, the buffer grows by its current capacity
//! (or one chunk, whichever is larger), so capacity roughly doubles and a
//! read is never shortened for lack of space.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire_client::protocol::MessageDecoder;
//!
//! let mut decoder = MessageDecoder::new();
//! loop {
//!     let n = decoder.read_from(&mut socket).await?;
//!     for message in decoder.drain()? {
//!         println!("{:?}", message);
//!     }
//! }
//! ```

use bytes::{Buf, BytesMut};
use rmp::Marker;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::message::Message;
use crate::error::{ClientError, Result};

/// Default size of one socket read (64 KiB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Default cap on the bytes buffered for one incomplete message (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Progress of the walk over the front message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scan {
    /// End of the last value walked, relative to the buffer start. May lie
    /// past the buffered bytes while a payload is still arriving.
    offset: usize,
    /// Values still to walk before the message is complete.
    remaining: usize,
}

impl Scan {
    const START: Scan = Scan {
        offset: 0,
        remaining: 1,
    };
}

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct MessageDecoder {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Upper bound for a single read.
    chunk_size: usize,
    /// Maximum bytes an incomplete message may occupy.
    max_message_size: usize,
    scan: Scan,
    #[cfg(test)]
    stats: ScanStats,
}

/// Work done by the decoder, for tests.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
struct ScanStats {
    /// Value headers walked.
    headers: usize,
    /// Full decodes of a buffered message.
    decodes: usize,
}

impl MessageDecoder {
    /// Create a decoder with default settings.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_READ_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a decoder with a custom read chunk size and message cap.
    pub fn with_limits(chunk_size: usize, max_message_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            max_message_size,
            scan: Scan::START,
            #[cfg(test)]
            stats: ScanStats::default(),
        }
    }

    /// Read at most one chunk from `reader` into the buffer tail.
    ///
    /// Returns the number of bytes read; `0` means end of stream.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.reserve_chunk();
        let mut limited = reader.take(self.chunk_size as u64);
        limited.read_buf(&mut self.buffer).await
    }

    /// Append bytes without reading from a socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Push data and extract all complete messages.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.extend(data);
        self.drain()
    }

    /// Extract every complete message currently buffered.
    ///
    /// # Errors
    ///
    /// Returns error on malformed MsgPack, on a value that is not a
    /// msgpack-rpc message, or when an incomplete message outgrows
    /// `max_message_size`. Any of these leaves the stream unusable.
    pub fn drain(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Try to extract a single message from the front of the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(message))` if a complete message was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let Some(end) = self.scan_front()? else {
            if self.buffer.len() > self.max_message_size {
                return Err(self.too_large(self.buffer.len()));
            }
            return Ok(None);
        };

        let mut cursor = &self.buffer[..end];
        let value = rmpv::decode::read_value(&mut cursor)?;
        #[cfg(test)]
        {
            self.stats.decodes += 1;
        }
        self.buffer.advance(end);
        self.scan = Scan::START;
        Message::from_value(value).map(Some)
    }

    /// Continue walking the front message.
    ///
    /// Returns its length once every byte of it is buffered.
    fn scan_front(&mut self) -> Result<Option<usize>> {
        loop {
            if self.scan.offset > self.max_message_size {
                return Err(self.too_large(self.scan.offset));
            }
            if self.scan.offset > self.buffer.len() {
                return Ok(None);
            }
            if self.scan.remaining == 0 {
                return Ok(Some(self.scan.offset));
            }

            let Some((size, children)) = value_header(&self.buffer[self.scan.offset..])? else {
                return Ok(None);
            };
            #[cfg(test)]
            {
                self.stats.headers += 1;
            }
            self.scan.offset = self.scan.offset.saturating_add(size);
            self.scan.remaining = (self.scan.remaining - 1).saturating_add(children);
        }
    }

    fn too_large(&self, size: usize) -> ClientError {
        ClientError::Protocol(format!(
            "Message size exceeds maximum {} (needs {})",
            self.max_message_size, size
        ))
    }

    /// Grow the buffer so the next read can take a full chunk.
    ///
    /// Returns true when the buffer had to grow.
    pub fn reserve_chunk(&mut self) -> bool {
        if self.spare_capacity() >= self.chunk_size {
            return false;
        }
        let grow_by = self.buffer.capacity().max(self.chunk_size);
        tracing::trace!("Reserving extra buffer: {}", grow_by);
        self.buffer.reserve(grow_by);
        true
    }

    /// Free space after the buffered bytes.
    #[inline]
    pub fn spare_capacity(&self) -> usize {
        self.buffer.capacity() - self.buffer.len()
    }

    /// Current buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Size of one read.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan = Scan::START;
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Length field of a marker whose size is only known after reading it.
enum LengthField {
    /// `len` payload bytes follow the field, plus `extra` fixed bytes.
    Bytes { field: usize, extra: usize },
    /// `len` nested values follow, `per` of them for each counted entry.
    Items { field: usize, per: usize },
}

/// Size of the value starting at `bytes[0]`, not counting nested values,
/// and the number of nested values that follow it.
///
/// `None` when the header itself is not fully buffered yet.
fn value_header(bytes: &[u8]) -> Result<Option<(usize, usize)>> {
    let Some(&first) = bytes.first() else {
        return Ok(None);
    };

    let length = match Marker::from_u8(first) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            return Ok(Some((1, 0)))
        }
        Marker::U8 | Marker::I8 => return Ok(Some((2, 0))),
        Marker::U16 | Marker::I16 | Marker::FixExt1 => return Ok(Some((3, 0))),
        Marker::FixExt2 => return Ok(Some((4, 0))),
        Marker::U32 | Marker::I32 | Marker::F32 => return Ok(Some((5, 0))),
        Marker::FixExt4 => return Ok(Some((6, 0))),
        Marker::U64 | Marker::I64 | Marker::F64 => return Ok(Some((9, 0))),
        Marker::FixExt8 => return Ok(Some((10, 0))),
        Marker::FixExt16 => return Ok(Some((18, 0))),
        Marker::FixStr(len) => return Ok(Some((1 + usize::from(len), 0))),
        Marker::FixArray(len) => return Ok(Some((1, usize::from(len)))),
        Marker::FixMap(len) => return Ok(Some((1, 2 * usize::from(len)))),
        Marker::Str8 | Marker::Bin8 => LengthField::Bytes { field: 1, extra: 0 },
        Marker::Str16 | Marker::Bin16 => LengthField::Bytes { field: 2, extra: 0 },
        Marker::Str32 | Marker::Bin32 => LengthField::Bytes { field: 4, extra: 0 },
        Marker::Ext8 => LengthField::Bytes { field: 1, extra: 1 },
        Marker::Ext16 => LengthField::Bytes { field: 2, extra: 1 },
        Marker::Ext32 => LengthField::Bytes { field: 4, extra: 1 },
        Marker::Array16 => LengthField::Items { field: 2, per: 1 },
        Marker::Array32 => LengthField::Items { field: 4, per: 1 },
        Marker::Map16 => LengthField::Items { field: 2, per: 2 },
        Marker::Map32 => LengthField::Items { field: 4, per: 2 },
        Marker::Reserved => {
            return Err(ClientError::Protocol(format!(
                "Invalid MessagePack marker 0x{:02x}",
                first
            )))
        }
    };

    let field = match length {
        LengthField::Bytes { field, .. } | LengthField::Items { field, .. } => field,
    };
    let Some(raw) = bytes.get(1..1 + field) else {
        return Ok(None);
    };
    // Big-endian, at most four bytes.
    let len = raw.iter().fold(0usize, |len, byte| (len << 8) | usize::from(*byte));

    Ok(Some(match length {
        LengthField::Bytes { field, extra } => ((1 + field + extra).saturating_add(len), 0),
        LengthField::Items { field, per } => (1 + field, len.saturating_mul(per)),
    }))
}
