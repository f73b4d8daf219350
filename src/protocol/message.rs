//! msgpack-rpc message layouts.
//!
//! Every message is a single MsgPack array; messages are concatenated on the
//! stream with no extra length prefix:
//! ```text
//! Request      [0, msgid, method, params]
//! Response     [1, msgid, error, result]
//! Notification [2, method, params]
//! ```
//!
//! A response whose `error` field is not nil is an error response and its
//! `result` is ignored.

use bytes::Bytes;
use rmpv::Value;

use crate::codec::MsgPackCodec;
use crate::error::{ClientError, Result};

/// Identifier correlating a request with its response.
pub type CallId = u32;

/// Message type tags (first array element).
pub mod kind {
    /// `[0, msgid, method, params]`
    pub const REQUEST: u8 = 0;
    /// `[1, msgid, error, result]`
    pub const RESPONSE: u8 = 1;
    /// `[2, method, params]`
    pub const NOTIFICATION: u8 = 2;
}

/// A decoded response: the call it answers and its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the call this response answers.
    pub id: CallId,
    /// `Ok(result)` or `Err(server error payload)`.
    pub outcome: std::result::Result<Value, Value>,
}

impl Response {
    /// Successful response.
    pub fn ok(id: CallId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    /// Error response.
    pub fn error(id: CallId, error: Value) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Any msgpack-rpc message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: CallId,
        method: String,
        params: Vec<Value>,
    },
    Response(Response),
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    /// Type tag of this message.
    pub fn kind(&self) -> u8 {
        match self {
            Message::Request { .. } => kind::REQUEST,
            Message::Response(_) => kind::RESPONSE,
            Message::Notification { .. } => kind::NOTIFICATION,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Bytes> {
        let bytes = match self {
            Message::Request { id, method, params } => {
                MsgPackCodec::encode(&(kind::REQUEST, *id, method, params))?
            }
            Message::Response(response) => {
                let (error, result) = match &response.outcome {
                    Ok(result) => (&Value::Nil, result),
                    Err(error) => (error, &Value::Nil),
                };
                MsgPackCodec::encode(&(kind::RESPONSE, response.id, error, result))?
            }
            Message::Notification { method, params } => {
                MsgPackCodec::encode(&(kind::NOTIFICATION, method, params))?
            }
        };
        Ok(Bytes::from(bytes))
    }

    /// Interpret a decoded MsgPack value as a message.
    pub fn from_value(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            other => return Err(protocol(format!("expected message array, got {}", other))),
        };

        let kind = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| protocol("missing message type".to_string()))?;

        let mut fields = items.into_iter().skip(1);
        match (kind, fields.len()) {
            (0, 3) => Ok(Message::Request {
                id: call_id(fields.next())?,
                method: method_name(fields.next())?,
                params: params(fields.next())?,
            }),
            (1, 3) => {
                let id = call_id(fields.next())?;
                let error = fields.next().unwrap_or(Value::Nil);
                let result = fields.next().unwrap_or(Value::Nil);
                Ok(Message::Response(if error.is_nil() {
                    Response::ok(id, result)
                } else {
                    Response::error(id, error)
                }))
            }
            (2, 2) => Ok(Message::Notification {
                method: method_name(fields.next())?,
                params: params(fields.next())?,
            }),
            (kind, n) => Err(protocol(format!(
                "unexpected message type {} with {} fields",
                kind,
                n + 1
            ))),
        }
    }
}

/// Encode a request without building a [`Message`].
///
/// `params` must already be an array (see [`MsgPackCodec::params`]).
pub fn encode_request(id: CallId, method: &str, params: &Value) -> Result<Bytes> {
    Ok(Bytes::from(MsgPackCodec::encode(&(
        kind::REQUEST,
        id,
        method,
        params,
    ))?))
}

/// Encode a notification without building a [`Message`].
pub fn encode_notification(method: &str, params: &Value) -> Result<Bytes> {
    Ok(Bytes::from(MsgPackCodec::encode(&(
        kind::NOTIFICATION,
        method,
        params,
    ))?))
}

fn protocol(msg: String) -> ClientError {
    ClientError::Protocol(msg)
}

fn call_id(field: Option<Value>) -> Result<CallId> {
    field
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|id| CallId::try_from(id).ok())
        .ok_or_else(|| protocol("message id is not a 32-bit unsigned integer".to_string()))
}

fn method_name(field: Option<Value>) -> Result<String> {
    match field {
        Some(Value::String(name)) => name
            .into_str()
            .ok_or_else(|| protocol("method name is not valid UTF-8".to_string())),
        _ => Err(protocol("method name is not a string".to_string())),
    }
}

fn params(field: Option<Value>) -> Result<Vec<Value>> {
    match field {
        Some(Value::Array(params)) => Ok(params),
        _ => Err(protocol("params is not an array".to_string())),
    }
}
