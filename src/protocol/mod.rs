//! Protocol module - msgpack-rpc messages and stream decoding.
//!
//! This module implements the wire side of the client:
//! - Request / response / notification layouts
//! - Incremental decoder over a growable read buffer

mod decoder;
mod message;

pub use decoder::{MessageDecoder, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_CHUNK_SIZE};
pub use message::{encode_notification, encode_request, kind, CallId, Message, Response};
