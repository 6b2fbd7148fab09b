//! Message and destination model.
//!
//! A [`Message`] is the unit of delivery: an optional broker-assigned id, a
//! target [`Destination`], an opaque body, a property map, and delivery
//! metadata (redelivered flag, timestamp, expiration). Properties are typed
//! via [`PropertyValue`] so a consumer can read back exactly what a producer
//! set, across the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Well-known property: provider-native redelivery counter. Brokers that
/// track redelivery themselves stamp this on each redelivered message; the
/// redelivery governor then uses it instead of its local fallback table.
pub const PROP_REDELIVERY_COUNT: &str = "broker_redelivery_count";

/// Well-known property: original destination of a dead-lettered message.
pub const PROP_ORIG_DESTINATION: &str = "orig_destination";

/// Well-known property: original id of a dead-lettered message.
pub const PROP_ORIG_MESSAGE_ID: &str = "orig_message_id";

/// A message destination.
///
/// Temporary destinations live only as long as the session that created
/// them; the server reaps them at `connection_closing`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Queue(String),
    Topic(String),
    TemporaryQueue(String),
    TemporaryTopic(String),
}

impl Destination {
    /// The destination's name, without its kind.
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(n)
            | Destination::Topic(n)
            | Destination::TemporaryQueue(n)
            | Destination::TemporaryTopic(n) => n,
        }
    }

    /// Whether this is a temporary destination.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Destination::TemporaryQueue(_) | Destination::TemporaryTopic(_)
        )
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Queue(n) => write!(f, "queue/{}", n),
            Destination::Topic(n) => write!(f, "topic/{}", n),
            Destination::TemporaryQueue(n) => write!(f, "tmpqueue/{}", n),
            Destination::TemporaryTopic(n) => write!(f, "tmptopic/{}", n),
        }
    }
}

/// Typed message property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl PropertyValue {
    /// Read this property as an unsigned counter, if it holds one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropertyValue::I32(v) if *v >= 0 => Some(*v as u32),
            PropertyValue::I64(v) if *v >= 0 && *v <= u32::MAX as i64 => Some(*v as u32),
            _ => None,
        }
    }

    /// Read this property as a string slice, if it holds one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A message travelling through the invocation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Broker-assigned id. `None` until the broker stamps one at
    /// `add_message`; a delivery without an id cannot be tracked for
    /// redelivery.
    pub id: Option<String>,
    /// Where this message is (or was) headed.
    pub destination: Destination,
    /// Opaque body bytes.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    /// Producer- and broker-set properties.
    pub properties: HashMap<String, PropertyValue>,
    /// True when this delivery is a re-presentation after a prior attempt
    /// did not result in committed acknowledgement.
    pub redelivered: bool,
    /// Broker receive time, milliseconds since the epoch.
    pub timestamp: u64,
    /// Absolute expiration in milliseconds since the epoch; 0 = never.
    pub expiration: u64,
    /// Delivery priority, 0..=9.
    pub priority: u8,
}

impl Message {
    /// Create a message with the given body, bound for `destination`.
    pub fn new(destination: Destination, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: None,
            destination,
            body: body.into(),
            properties: HashMap::new(),
            redelivered: false,
            timestamp: now_millis(),
            expiration: 0,
            priority: 4,
        }
    }

    /// Create a text message (UTF-8 body).
    pub fn text(destination: Destination, text: &str) -> Self {
        Self::new(destination, text.as_bytes().to_vec())
    }

    /// The body interpreted as UTF-8, if it is.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Set a property, builder-style.
    pub fn with_property(mut self, key: &str, value: PropertyValue) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    /// The provider-native redelivery counter, if the broker stamps one.
    pub fn native_redelivery_count(&self) -> Option<u32> {
        self.properties
            .get(PROP_REDELIVERY_COUNT)
            .and_then(PropertyValue::as_u32)
    }

    /// Whether the message has expired as of `now` (ms since epoch).
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expiration != 0 && now >= self.expiration
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;

    #[test]
    fn test_text_message() {
        let msg = Message::text(Destination::Queue("orders".into()), "hello");
        assert_eq!(msg.body_text(), Some("hello"));
        assert!(!msg.redelivered);
        assert_eq!(msg.priority, 4);
        assert!(msg.id.is_none());
    }

    #[test]
    fn test_destination_display_and_kind() {
        assert_eq!(Destination::Queue("A".into()).to_string(), "queue/A");
        assert_eq!(Destination::Topic("B".into()).to_string(), "topic/B");
        assert!(Destination::TemporaryQueue("t1".into()).is_temporary());
        assert!(!Destination::Queue("A".into()).is_temporary());
        assert_eq!(Destination::TemporaryTopic("t2".into()).name(), "t2");
    }

    #[test]
    fn test_native_redelivery_count_property() {
        let msg = Message::text(Destination::Queue("q".into()), "x")
            .with_property(PROP_REDELIVERY_COUNT, PropertyValue::I32(3));
        assert_eq!(msg.native_redelivery_count(), Some(3));

        let msg = Message::text(Destination::Queue("q".into()), "x");
        assert_eq!(msg.native_redelivery_count(), None);

        // A negative counter is not a counter.
        let msg = Message::text(Destination::Queue("q".into()), "x")
            .with_property(PROP_REDELIVERY_COUNT, PropertyValue::I64(-1));
        assert_eq!(msg.native_redelivery_count(), None);
    }

    #[test]
    fn test_expiration() {
        let mut msg = Message::text(Destination::Queue("q".into()), "x");
        assert!(!msg.is_expired_at(u64::MAX));
        msg.expiration = 1000;
        assert!(!msg.is_expired_at(999));
        assert!(msg.is_expired_at(1000));
    }

    #[test]
    fn test_message_wire_roundtrip() {
        let original = Message::text(Destination::Topic("events".into()), "payload")
            .with_property("shard", PropertyValue::I64(12))
            .with_property("trace", PropertyValue::Str("abc".into()))
            .with_property("blob", PropertyValue::Bytes(vec![1, 2, 3]));

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded.body, original.body);
        assert_eq!(decoded.destination, original.destination);
        assert_eq!(decoded.properties, original.properties);
        assert_eq!(decoded.redelivered, original.redelivered);
    }
}
