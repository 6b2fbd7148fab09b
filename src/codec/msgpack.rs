//! MsgPack codec using `rmp-serde`.
//!
//! Uses `to_vec_named` so structs serialize as maps keyed by field name
//! rather than positional arrays. Argument structs gain fields across
//! protocol revisions; the map format lets an older peer skip fields it does
//! not know instead of misreading the whole tuple.
//!
//! # Example
//!
//! ```
//! use mqwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Envelope {
//!     seq: u32,
//!     body: String,
//! }
//!
//! let env = Envelope { seq: 7, body: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&env).unwrap();
//! let decoded: Envelope = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, env);
//! ```

use crate::error::Result;

/// MessagePack codec for structured payloads.
///
/// Stateless: each call encodes into a fresh `Vec` and decodes from a
/// self-contained slice.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map format).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_struct_as_map_format() {
        // Map format starts with 0x8X (fixmap); positional array format
        // would start with 0x9X. The protocol depends on the map format for
        // cross-revision field tolerance.
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let encoded = MsgPackCodec::encode(&test).unwrap();
        assert_eq!(
            encoded[0] & 0xF0,
            0x80,
            "Expected map format (0x8X), got {:02X}",
            encoded[0]
        );
    }

    #[test]
    fn test_encode_decode_option() {
        let some_val: Option<i32> = Some(42);
        let encoded = MsgPackCodec::encode(&some_val).unwrap();
        let decoded: Option<i32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, some_val);

        let none_val: Option<i32> = None;
        let encoded = MsgPackCodec::encode(&none_val).unwrap();
        assert_eq!(encoded, vec![0xc0], "None should encode as msgpack nil");
        let decoded: Option<i32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, none_val);
    }

    #[test]
    fn test_binary_body_roundtrip() {
        // Message bodies travel as msgpack bin, not as int arrays.
        let data: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let encoded = MsgPackCodec::encode(&serde_bytes::Bytes::new(&data)).unwrap();
        assert_eq!(encoded[0], 0xc4, "Expected bin8 format");

        let decoded: serde_bytes::ByteBuf = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), &data);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"not valid msgpack";
        let result: Result<TestStruct> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_map_keys_skipped() {
        // A newer peer may send extra fields; decoding into a struct that
        // lacks them must succeed.
        #[derive(Serialize)]
        struct Wide {
            id: u32,
            name: String,
            active: bool,
            extra: u64,
        }
        let wide = Wide {
            id: 9,
            name: "n".to_string(),
            active: true,
            extra: 123,
        };
        let encoded = MsgPackCodec::encode(&wide).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.name, "n");
    }
}
