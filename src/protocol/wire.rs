//! Request, reply, and push frame encoding.
//!
//! Frames travel one-per-segment on their logical channel:
//!
//! ```text
//! request (sync channel):  [opcode: 1][token: 8 BE][args: MsgPack]
//! reply   (sync channel):  [status: 1][value-or-fault: MsgPack]
//! push    (push channel):  [opcode: 1][args: MsgPack]
//! push ack(push channel):  [0]  or  [1][fault: MsgPack]
//! ```
//!
//! The reply status byte decodes into the explicit [`Reply`] type: `0` means
//! success with no value, `1` means a value follows, `2` means a fault
//! follows. Absence of a result (an empty `receive`, say) is `Empty`, never
//! a fault - there is no exceptions-as-control-flow on this wire.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::MsgPackCodec;
use crate::error::{MqwireError, Result};
use crate::session::ConnectionToken;

use super::opcode::Opcode;

/// Size of the request frame prefix: opcode byte plus token.
pub const REQUEST_PREFIX: usize = 1 + 8;

/// Reply status byte: success, no value.
pub const STATUS_EMPTY: u8 = 0;
/// Reply status byte: success, value follows.
pub const STATUS_VALUE: u8 = 1;
/// Reply status byte: fault follows.
pub const STATUS_FAILED: u8 = 2;

/// A fault raised by the peer, carried inside a reply or push-ack frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFault {
    pub message: String,
}

impl RemoteFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Decoded reply frame.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Success, no value.
    Empty,
    /// Success, undecoded value payload.
    Value(Bytes),
    /// The peer's business logic faulted.
    Failed(RemoteFault),
}

impl Reply {
    /// Build a `Value` reply from a serializable result.
    pub fn value<T: Serialize>(value: &T) -> Result<Reply> {
        Ok(Reply::Value(Bytes::from(MsgPackCodec::encode(value)?)))
    }

    /// Build an optional-value reply: `None` encodes as `Empty`.
    pub fn opt_value<T: Serialize>(value: &Option<T>) -> Result<Reply> {
        match value {
            Some(v) => Reply::value(v),
            None => Ok(Reply::Empty),
        }
    }

    /// Decode into the caller's result shape: `Empty` becomes `None`, a
    /// fault is rethrown as [`MqwireError::Remote`].
    pub fn into_result<T: serde::de::DeserializeOwned>(self) -> Result<Option<T>> {
        match self {
            Reply::Empty => Ok(None),
            Reply::Value(payload) => Ok(Some(MsgPackCodec::decode(&payload)?)),
            Reply::Failed(fault) => Err(MqwireError::Remote(fault.message)),
        }
    }

    /// Decode a reply that must carry a value.
    pub fn into_value<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        self.into_result()?
            .ok_or_else(|| MqwireError::Protocol("reply missing expected value".to_string()))
    }

    /// Decode a reply for an operation without a result value.
    pub fn into_empty(self) -> Result<()> {
        match self {
            Reply::Failed(fault) => Err(MqwireError::Remote(fault.message)),
            _ => Ok(()),
        }
    }
}

/// Encode a request frame.
pub fn encode_request<T: Serialize>(
    opcode: Opcode,
    token: ConnectionToken,
    args: &T,
) -> Result<Bytes> {
    let payload = MsgPackCodec::encode(args)?;
    let mut buf = BytesMut::with_capacity(REQUEST_PREFIX + payload.len());
    buf.put_u8(opcode as u8);
    buf.put_u64(token.0);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode a request frame into its opcode, token, and argument payload.
pub fn decode_request(frame: &Bytes) -> Result<(Opcode, ConnectionToken, Bytes)> {
    if frame.len() < REQUEST_PREFIX {
        return Err(MqwireError::Protocol(format!(
            "request frame truncated at {} bytes",
            frame.len()
        )));
    }
    let opcode = Opcode::try_from(frame[0])?;
    let token = ConnectionToken(u64::from_be_bytes(
        frame[1..9].try_into().expect("prefix length checked"),
    ));
    Ok((opcode, token, frame.slice(REQUEST_PREFIX..)))
}

/// Encode a reply frame.
pub fn encode_reply(reply: &Reply) -> Result<Bytes> {
    match reply {
        Reply::Empty => Ok(Bytes::from_static(&[STATUS_EMPTY])),
        Reply::Value(payload) => {
            let mut buf = BytesMut::with_capacity(1 + payload.len());
            buf.put_u8(STATUS_VALUE);
            buf.put_slice(payload);
            Ok(buf.freeze())
        }
        Reply::Failed(fault) => {
            let payload = MsgPackCodec::encode(fault)?;
            let mut buf = BytesMut::with_capacity(1 + payload.len());
            buf.put_u8(STATUS_FAILED);
            buf.put_slice(&payload);
            Ok(buf.freeze())
        }
    }
}

/// Decode a reply frame.
pub fn decode_reply(frame: &Bytes) -> Result<Reply> {
    let status = *frame
        .first()
        .ok_or_else(|| MqwireError::Protocol("empty reply frame".to_string()))?;
    match status {
        STATUS_EMPTY => Ok(Reply::Empty),
        STATUS_VALUE => Ok(Reply::Value(frame.slice(1..))),
        STATUS_FAILED => {
            let fault: RemoteFault = MsgPackCodec::decode(&frame[1..])?;
            Ok(Reply::Failed(fault))
        }
        other => Err(MqwireError::Protocol(format!(
            "acknowledgement out of sequence: reply status {}",
            other
        ))),
    }
}

/// Encode a push frame (server to client).
pub fn encode_push<T: Serialize>(opcode: Opcode, args: &T) -> Result<Bytes> {
    debug_assert!(opcode.is_push());
    let payload = MsgPackCodec::encode(args)?;
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(opcode as u8);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode a push frame into its opcode and argument payload.
pub fn decode_push(frame: &Bytes) -> Result<(Opcode, Bytes)> {
    let byte = *frame
        .first()
        .ok_or_else(|| MqwireError::Protocol("empty push frame".to_string()))?;
    let opcode = Opcode::try_from(byte)?;
    if !opcode.is_push() {
        return Err(MqwireError::Protocol(format!(
            "request opcode {} on push channel",
            byte
        )));
    }
    Ok((opcode, frame.slice(1..)))
}

/// Encode the lightweight push acknowledgement.
pub fn encode_push_ack(outcome: &std::result::Result<(), RemoteFault>) -> Result<Bytes> {
    match outcome {
        Ok(()) => Ok(Bytes::from_static(&[0])),
        Err(fault) => {
            let payload = MsgPackCodec::encode(fault)?;
            let mut buf = BytesMut::with_capacity(1 + payload.len());
            buf.put_u8(1);
            buf.put_slice(&payload);
            Ok(buf.freeze())
        }
    }
}

/// Decode a push acknowledgement.
pub fn decode_push_ack(frame: &Bytes) -> Result<std::result::Result<(), RemoteFault>> {
    match frame.first() {
        Some(0) => Ok(Ok(())),
        Some(1) => {
            let fault: RemoteFault = MsgPackCodec::decode(&frame[1..])?;
            Ok(Err(fault))
        }
        Some(other) => Err(MqwireError::Protocol(format!(
            "bad push ack status {}",
            other
        ))),
        None => Err(MqwireError::Protocol("empty push ack frame".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ops::AuthenticateArgs;

    #[test]
    fn test_request_roundtrip() {
        let args = AuthenticateArgs {
            user: "guest".to_string(),
            password: "guest".to_string(),
        };
        let token = ConnectionToken(0xDEAD_BEEF_CAFE_0001);
        let frame = encode_request(Opcode::Authenticate, token, &args).unwrap();

        let (opcode, decoded_token, payload) = decode_request(&frame).unwrap();
        assert_eq!(opcode, Opcode::Authenticate);
        assert_eq!(decoded_token, token);

        let decoded: AuthenticateArgs = MsgPackCodec::decode(&payload).unwrap();
        assert_eq!(decoded.user, "guest");
    }

    #[test]
    fn test_request_truncated() {
        let frame = Bytes::from_static(&[11, 0, 0]);
        assert!(matches!(
            decode_request(&frame),
            Err(MqwireError::Protocol(_))
        ));
    }

    #[test]
    fn test_request_bad_opcode_surfaces() {
        let mut raw = vec![0xEEu8];
        raw.extend_from_slice(&[0; 8]);
        let frame = Bytes::from(raw);
        assert!(matches!(
            decode_request(&frame),
            Err(MqwireError::BadOpcode(0xEE))
        ));
    }

    #[test]
    fn test_reply_empty_roundtrip() {
        let frame = encode_reply(&Reply::Empty).unwrap();
        assert_eq!(&frame[..], &[STATUS_EMPTY]);
        let reply = decode_reply(&frame).unwrap();
        assert!(reply.into_result::<String>().unwrap().is_none());
    }

    #[test]
    fn test_reply_value_roundtrip() {
        let frame = encode_reply(&Reply::value(&"forty-two").unwrap()).unwrap();
        assert_eq!(frame[0], STATUS_VALUE);
        let value: String = decode_reply(&frame).unwrap().into_value().unwrap();
        assert_eq!(value, "forty-two");
    }

    #[test]
    fn test_reply_fault_rethrown() {
        let reply = Reply::Failed(RemoteFault::new("no such queue"));
        let frame = encode_reply(&reply).unwrap();
        assert_eq!(frame[0], STATUS_FAILED);

        let err = decode_reply(&frame)
            .unwrap()
            .into_result::<String>()
            .unwrap_err();
        match err {
            MqwireError::Remote(msg) => assert_eq!(msg, "no such queue"),
            other => panic!("expected Remote, got {other}"),
        }
    }

    #[test]
    fn test_reply_unknown_status() {
        let frame = Bytes::from_static(&[9, 1, 2]);
        let err = decode_reply(&frame).unwrap_err();
        assert!(matches!(err, MqwireError::Protocol(msg) if msg.contains("out of sequence")));
    }

    #[test]
    fn test_opt_value_encodes_absence_as_empty() {
        let none: Option<String> = None;
        let frame = encode_reply(&Reply::opt_value(&none).unwrap()).unwrap();
        assert_eq!(frame[0], STATUS_EMPTY);

        let some = Some("x".to_string());
        let frame = encode_reply(&Reply::opt_value(&some).unwrap()).unwrap();
        assert_eq!(frame[0], STATUS_VALUE);
    }

    #[test]
    fn test_push_roundtrip() {
        let frame = encode_push(Opcode::PushPing, &()).unwrap();
        let (opcode, _payload) = decode_push(&frame).unwrap();
        assert_eq!(opcode, Opcode::PushPing);
    }

    #[test]
    fn test_request_opcode_rejected_on_push_channel() {
        let frame = encode_request(Opcode::AddMessage, ConnectionToken::NONE, &()).unwrap();
        assert!(matches!(
            decode_push(&frame),
            Err(MqwireError::Protocol(_))
        ));
    }

    #[test]
    fn test_push_ack_roundtrip() {
        let frame = encode_push_ack(&Ok(())).unwrap();
        assert_eq!(&frame[..], &[0]);
        assert!(decode_push_ack(&frame).unwrap().is_ok());

        let frame = encode_push_ack(&Err(RemoteFault::new("handler failed"))).unwrap();
        assert_eq!(frame[0], 1);
        let fault = decode_push_ack(&frame).unwrap().unwrap_err();
        assert_eq!(fault.message, "handler failed");
    }
}
