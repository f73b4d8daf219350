//! MsgPack codec using `rmp-serde` and `rmpv`.
//!
//! Typed values travel through `rmp_serde`; payloads that the client does
//! not interpret (call results, server error payloads) stay as dynamic
//! [`rmpv::Value`] until the caller asks for a concrete type.
//!
//! # Example
//!
//! ```
//! use rpcwire_client::codec::MsgPackCodec;
//!
//! let value = MsgPackCodec::to_value(&(2, 3)).unwrap();
//! let back: (i32, i32) = MsgPackCodec::from_value(value).unwrap();
//! assert_eq!(back, (2, 3));
//! ```

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// Uses `to_vec_named` so structs serialize as maps, which is what
    /// msgpack-rpc servers in dynamic languages expect.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Convert a typed value into a dynamic MsgPack value.
    ///
    /// Goes through the named encoder rather than `rmpv::ext::to_value`,
    /// which would flatten structs into positional arrays.
    pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
        let bytes = Self::encode(value)?;
        Ok(rmpv::decode::read_value(&mut bytes.as_slice())?)
    }

    /// Convert a dynamic MsgPack value into a typed value.
    #[inline]
    pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
        Ok(rmpv::ext::from_value(value)?)
    }

    /// Turn call arguments into a msgpack-rpc `params` array.
    ///
    /// Tuples already serialize as arrays. `()` serializes as nil and becomes
    /// an empty array; any other scalar becomes a one-element array. Pass a
    /// single `Vec` argument as `(vec,)`, otherwise its elements are taken as
    /// the argument list.
    pub fn params<A: Serialize + ?Sized>(args: &A) -> Result<Value> {
        Ok(match Self::to_value(args)? {
            Value::Nil => Value::Array(Vec::new()),
            array @ Value::Array(_) => array,
            single => Value::Array(vec![single]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_params_from_tuple() {
        let params = MsgPackCodec::params(&(2, 3)).unwrap();
        assert_eq!(params, Value::Array(vec![Value::from(2), Value::from(3)]));
    }

    #[test]
    fn test_params_from_unit_is_empty_array() {
        let params = MsgPackCodec::params(&()).unwrap();
        assert_eq!(params, Value::Array(Vec::new()));
    }

    #[test]
    fn test_params_wraps_scalar() {
        let params = MsgPackCodec::params(&"hello").unwrap();
        assert_eq!(params, Value::Array(vec![Value::from("hello")]));
    }

    #[test]
    fn test_params_single_vec_argument() {
        let params = MsgPackCodec::params(&(vec![1, 2, 3],)).unwrap();
        match params {
            Value::Array(items) => {
                assert_eq!(items.len(), 1);
                assert!(items[0].is_array());
            }
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_argument_becomes_map() {
        let params = MsgPackCodec::params(&(Point { x: 1, y: 2 },)).unwrap();
        let Value::Array(items) = params else {
            panic!("params must be an array");
        };
        assert!(items[0].is_map(), "structs are sent as maps");
    }

    #[test]
    fn test_value_round_trip_struct() {
        let value = MsgPackCodec::to_value(&Point { x: -4, y: 9 }).unwrap();
        let point: Point = MsgPackCodec::from_value(value).unwrap();
        assert_eq!(point, Point { x: -4, y: 9 });
    }

    #[test]
    fn test_from_value_type_mismatch() {
        let result: Result<i64> = MsgPackCodec::from_value(Value::from("not a number"));
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_decode_option_nil() {
        let encoded = MsgPackCodec::encode(&Option::<i32>::None).unwrap();
        assert_eq!(encoded, vec![0xc0], "None should encode as msgpack nil");
        let decoded: Option<i32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_binary_payload_is_bin_format() {
        let data: Vec<u8> = vec![0x01, 0x02, 0x03];
        let encoded = MsgPackCodec::encode(&serde_bytes::Bytes::new(&data)).unwrap();
        assert_eq!(encoded[0], 0xc4, "Expected bin8 format");

        let value = MsgPackCodec::params(&(serde_bytes::Bytes::new(&data),)).unwrap();
        let Value::Array(items) = value else {
            panic!("params must be an array");
        };
        assert_eq!(items[0], Value::Binary(data));
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Point> = MsgPackCodec::decode(b"\xc1");
        assert!(result.is_err());
    }
}
