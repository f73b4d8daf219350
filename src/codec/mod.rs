//! Codec module - conversion between Rust values and MsgPack.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (to_vec_named) and
//!   dynamic [`rmpv::Value`] payloads
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather than trait objects.
//!
//! # Example
//!
//! ```
//! use rpcwire_client::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
