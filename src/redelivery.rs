//! Redelivery governor - dead-letter handling.
//!
//! Every inbound delivery flagged as redelivered passes through the
//! governor before it reaches business logic. The governor counts how many
//! times the message has been re-presented and, once the count exceeds the
//! configured threshold, reroutes it to the dead-letter destination instead
//! of letting it be retried forever.
//!
//! Counting has two sources. A broker that tracks redelivery natively stamps
//! [`PROP_REDELIVERY_COUNT`] on the message and the governor uses that value
//! directly, with no bookkeeping of its own. Otherwise a local fallback
//! table keyed by message id carries the count - and because a rolled-back
//! attempt must keep its count, the table entry is only removed by a
//! transaction-commit callback (or when the message is dead-lettered).
//!
//! The dead-letter send path runs on its own session, independent of the
//! consuming session, so rolling back or closing the consumer cannot undo
//! the forwarding of a poison message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::invoker::DestinationResolver;
use crate::message::{
    now_millis, Destination, Message, PropertyValue, PROP_ORIG_DESTINATION, PROP_ORIG_MESSAGE_ID,
    PROP_REDELIVERY_COUNT,
};
use crate::tx::{AfterCompletion, CompletionStatus, TransactionManager};

/// Default dead-letter destination name.
pub const DEFAULT_DEAD_LETTER_NAME: &str = "queue/DLQ";

/// Default redelivery threshold.
pub const DEFAULT_MAX_REDELIVERED: u32 = 10;

/// Recognized governor options.
///
/// Parsed from a JSON options map; unrecognized keys are ignored with a
/// warning (see [`DeadLetterConfig::from_options`]).
#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    /// Dead-letter destination name.
    #[serde(rename = "DestinationQueue", default = "default_destination")]
    pub destination: String,

    /// Redeliveries beyond this count are rerouted.
    #[serde(rename = "MaxTimesRedelivered", default = "default_max_redelivered")]
    pub max_redelivered: u32,

    /// Time-to-live for the forwarded message, in milliseconds. 0 keeps the
    /// provider default (no expiration set by the governor).
    #[serde(rename = "TimeToLive", default)]
    pub time_to_live_millis: u64,

    /// Credentials for the dedicated dead-letter session.
    #[serde(rename = "DLQUser", default)]
    pub user: Option<String>,
    #[serde(rename = "DLQPassword", default)]
    pub password: Option<String>,
}

fn default_destination() -> String {
    DEFAULT_DEAD_LETTER_NAME.to_string()
}

fn default_max_redelivered() -> u32 {
    DEFAULT_MAX_REDELIVERED
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            max_redelivered: default_max_redelivered(),
            time_to_live_millis: 0,
            user: None,
            password: None,
        }
    }
}

impl DeadLetterConfig {
    /// Parse from a JSON options object. Unknown keys warn and are skipped.
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        const KNOWN: [&str; 5] = [
            "DestinationQueue",
            "MaxTimesRedelivered",
            "TimeToLive",
            "DLQUser",
            "DLQPassword",
        ];
        if let Some(map) = options.as_object() {
            for key in map.keys() {
                if !KNOWN.contains(&key.as_str()) {
                    tracing::warn!(option = %key, "unrecognized dead-letter option ignored");
                }
            }
        }
        Ok(serde_json::from_value(options.clone())?)
    }
}

/// The independent session used to forward poison messages.
#[async_trait]
pub trait DeadLetterSession: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;
}

/// Dead-letter session over its own client connection.
///
/// Deliberately not the consumer's connection: closing or rolling back the
/// consumer's session must not be able to undo or block the forwarding of a
/// poison message. The connection is expected to be authenticated with the
/// configured `DLQUser`/`DLQPassword` before the governor is built.
pub struct ClientDeadLetterSession {
    connection: Arc<crate::client::ClientConnection>,
}

impl ClientDeadLetterSession {
    pub fn new(connection: Arc<crate::client::ClientConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl DeadLetterSession for ClientDeadLetterSession {
    async fn send(&self, message: Message) -> Result<()> {
        self.connection.add_message(message).await
    }
}

/// Concurrency-safe redelivery counter table, keyed by message id.
///
/// Owned by the governor instance (not process-ambient); cloned into
/// transaction synchronizations so they can remove entries at commit. One
/// coarse lock - entries are short-lived and contention is bounded by
/// delivery throughput.
#[derive(Clone, Default)]
pub struct ResentBuffer {
    entries: Arc<Mutex<HashMap<String, u32>>>,
}

impl ResentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter for `id`. The entry is created at 1 on first sight
    /// (the original delivery), so the first increment - the first observed
    /// redelivery - returns 2.
    pub fn increment_resent_count(&self, id: &str) -> u32 {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let count = entries.entry(id.to_string()).or_insert(1);
        *count += 1;
        *count
    }

    /// Drop the entry for `id`. Idempotent.
    pub fn delete_from_buffer(&self, id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Current count for `id`, if tracked.
    pub fn count(&self, id: &str) -> Option<u32> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }

    /// Number of tracked messages.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decides, per redelivered message, whether to admit it or reroute it to
/// the dead-letter destination.
pub struct RedeliveryGovernor {
    config: DeadLetterConfig,
    dead_letter_destination: Destination,
    buffer: ResentBuffer,
    session: Arc<dyn DeadLetterSession>,
    tx: Option<Arc<dyn TransactionManager>>,
}

impl RedeliveryGovernor {
    /// Build a governor. The dead-letter destination name is resolved once,
    /// up front; a bad name fails construction rather than the first poison
    /// message.
    pub fn new(
        config: DeadLetterConfig,
        resolver: &dyn DestinationResolver,
        session: Arc<dyn DeadLetterSession>,
        tx: Option<Arc<dyn TransactionManager>>,
    ) -> Result<Self> {
        let dead_letter_destination = resolver.lookup(&config.destination)?;
        Ok(Self {
            config,
            dead_letter_destination,
            buffer: ResentBuffer::new(),
            session,
            tx,
        })
    }

    /// The resolved dead-letter destination.
    pub fn dead_letter_destination(&self) -> &Destination {
        &self.dead_letter_destination
    }

    /// The counter table (exposed for inspection).
    pub fn buffer(&self) -> &ResentBuffer {
        &self.buffer
    }

    /// Decide the fate of a delivery.
    ///
    /// Returns `true` when the message was rerouted to the dead-letter
    /// destination and the caller must suppress normal delivery; `false`
    /// admits the message. A message whose id cannot be determined is never
    /// handled: without an id it cannot be tracked or safely deduplicated,
    /// so the governor declines and the provider's own redelivery handling
    /// remains the backstop.
    pub async fn handle(&self, message: &Message) -> Result<bool> {
        if !message.redelivered {
            return Ok(false);
        }

        let Some(id) = message.id.as_deref() else {
            tracing::warn!("redelivered message without id, declining to track");
            return Ok(false);
        };

        let native_count = message.native_redelivery_count();
        let count = match native_count {
            // The broker tracks redelivery itself; decide immediately.
            Some(count) => count,
            None => self.buffer.increment_resent_count(id),
        };

        if count > self.config.max_redelivered {
            tracing::warn!(
                message_id = %id,
                count,
                max = self.config.max_redelivered,
                dlq = %self.dead_letter_destination,
                "redelivery limit exceeded, rerouting to dead-letter destination"
            );
            self.forward_to_dead_letter(message, id).await;
            if native_count.is_none() {
                self.buffer.delete_from_buffer(id);
            }
            return Ok(true);
        }

        if native_count.is_none() {
            if let Some(tx) = self.tx.as_ref().and_then(|tm| tm.current_transaction()) {
                // Entry removal is gated on commit: a successful (committed)
                // consumption clears the count, a rollback keeps it for the
                // next attempt.
                let buffer = self.buffer.clone();
                let id = id.to_string();
                tx.register_synchronization(Box::new(AfterCompletion(
                    move |status: CompletionStatus| {
                        if status == CompletionStatus::Committed {
                            buffer.delete_from_buffer(&id);
                        }
                    },
                )));
            }
        }

        Ok(false)
    }

    /// Build the outgoing copy and send it on the dedicated session. A send
    /// failure is logged and not retried.
    async fn forward_to_dead_letter(&self, message: &Message, id: &str) {
        let mut copy = message.clone();

        // Stamp the origin from the message's values before any mutation.
        // The inbound property set may be read-only upstream; the copy's map
        // is ours to write.
        copy.properties.insert(
            PROP_ORIG_DESTINATION.to_string(),
            PropertyValue::Str(message.destination.to_string()),
        );
        copy.properties.insert(
            PROP_ORIG_MESSAGE_ID.to_string(),
            PropertyValue::Str(id.to_string()),
        );
        copy.properties.remove(PROP_REDELIVERY_COUNT);

        copy.destination = self.dead_letter_destination.clone();
        copy.redelivered = false;
        if self.config.time_to_live_millis != 0 {
            copy.expiration = now_millis() + self.config.time_to_live_millis;
        }

        if let Err(e) = self.session.send(copy).await {
            tracing::error!(
                message_id = %id,
                error = %e,
                "dead-letter forward failed; message dropped from governor, provider redelivery is the backstop"
            );
        }
    }
}

impl std::fmt::Debug for RedeliveryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeliveryGovernor")
            .field("destination", &self.dead_letter_destination)
            .field("max_redelivered", &self.config.max_redelivered)
            .field("tracked", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MqwireError;
    use crate::invoker::NamePathResolver;
    use crate::tx::LocalTransactionManager;
    use serde_json::json;

    /// Recording dead-letter session; optionally fails every send.
    #[derive(Default)]
    struct RecordingSession {
        sent: Mutex<Vec<Message>>,
        fail: bool,
    }

    #[async_trait]
    impl DeadLetterSession for RecordingSession {
        async fn send(&self, message: Message) -> Result<()> {
            if self.fail {
                return Err(MqwireError::DeadLetter("session down".into()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn governor_with(
        max: u32,
        tm: Option<Arc<dyn TransactionManager>>,
    ) -> (RedeliveryGovernor, Arc<RecordingSession>) {
        let session = Arc::new(RecordingSession::default());
        let config = DeadLetterConfig {
            max_redelivered: max,
            ..DeadLetterConfig::default()
        };
        let governor =
            RedeliveryGovernor::new(config, &NamePathResolver, session.clone(), tm).unwrap();
        (governor, session)
    }

    fn redelivered(id: &str) -> Message {
        let mut msg = Message::text(Destination::Queue("orders".into()), "payload");
        msg.id = Some(id.to_string());
        msg.redelivered = true;
        msg
    }

    #[test]
    fn test_increment_starts_at_two() {
        let buffer = ResentBuffer::new();
        assert_eq!(buffer.increment_resent_count("M1"), 2);
        assert_eq!(buffer.increment_resent_count("M1"), 3);
        assert_eq!(buffer.increment_resent_count("M2"), 2);

        buffer.delete_from_buffer("M1");
        assert_eq!(buffer.count("M1"), None);
        assert_eq!(buffer.count("M2"), Some(2));
        // Deleting again is a no-op.
        buffer.delete_from_buffer("M1");
    }

    #[tokio::test]
    async fn test_threshold_monotonicity() {
        // With max = 3: counts 2..=3 admit, the delivery pushing the count
        // to 4 reroutes.
        let (governor, session) = governor_with(3, None);
        let msg = redelivered("M1");

        assert!(!governor.handle(&msg).await.unwrap()); // count 2
        assert!(!governor.handle(&msg).await.unwrap()); // count 3
        assert!(governor.handle(&msg).await.unwrap()); // count 4 > 3
        assert_eq!(session.sent.lock().unwrap().len(), 1);

        // Entry removed after the forward; the cycle restarts.
        assert_eq!(governor.buffer().count("M1"), None);
    }

    #[tokio::test]
    async fn test_first_delivery_not_counted() {
        let (governor, session) = governor_with(10, None);
        let mut msg = redelivered("M1");
        msg.redelivered = false;

        assert!(!governor.handle(&msg).await.unwrap());
        assert!(governor.buffer().is_empty());
        assert!(session.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_id_fails_closed() {
        let (governor, session) = governor_with(0, None);
        let mut msg = redelivered("M1");
        msg.id = None;

        // Even with max 0, the governor declines without an id.
        assert!(!governor.handle(&msg).await.unwrap());
        assert!(governor.buffer().is_empty());
        assert!(session.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_native_counter_bypasses_local_table() {
        let (governor, session) = governor_with(5, None);

        let under = redelivered("M1")
            .with_property(PROP_REDELIVERY_COUNT, PropertyValue::I32(5));
        assert!(!governor.handle(&under).await.unwrap());
        assert!(governor.buffer().is_empty(), "no local bookkeeping expected");

        let over = redelivered("M2")
            .with_property(PROP_REDELIVERY_COUNT, PropertyValue::I32(6));
        assert!(governor.handle(&over).await.unwrap());
        assert_eq!(session.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_gated_counter_reset() {
        let tm = Arc::new(LocalTransactionManager::new());
        let (governor, _session) = governor_with(10, Some(tm.clone()));
        let msg = redelivered("M1");

        // Three redeliveries inside a transaction that rolls back: the
        // count survives.
        tm.begin();
        for _ in 0..3 {
            assert!(!governor.handle(&msg).await.unwrap());
        }
        assert_eq!(governor.buffer().count("M1"), Some(4));
        tm.rollback();
        assert_eq!(governor.buffer().count("M1"), Some(4), "rollback must not reset");

        // The next attempt commits: the entry is removed.
        tm.begin();
        assert!(!governor.handle(&msg).await.unwrap());
        tm.commit();
        assert_eq!(governor.buffer().count("M1"), None);
    }

    #[tokio::test]
    async fn test_dead_letter_stamping() {
        let (governor, session) = governor_with(0, None);
        let msg = redelivered("M1").with_property("shard", PropertyValue::I32(9));

        assert!(governor.handle(&msg).await.unwrap());

        let sent = session.sent.lock().unwrap();
        let forwarded = &sent[0];
        assert_eq!(forwarded.destination, Destination::Queue("DLQ".into()));
        assert_eq!(
            forwarded.properties.get(PROP_ORIG_DESTINATION).unwrap(),
            &PropertyValue::Str("queue/orders".into())
        );
        assert_eq!(
            forwarded.properties.get(PROP_ORIG_MESSAGE_ID).unwrap(),
            &PropertyValue::Str("M1".into())
        );
        // Original properties survive the copy.
        assert_eq!(
            forwarded.properties.get("shard").unwrap(),
            &PropertyValue::I32(9)
        );
        assert!(!forwarded.redelivered);
        assert_eq!(forwarded.body, msg.body);
    }

    #[tokio::test]
    async fn test_dead_letter_ttl_applied() {
        let session = Arc::new(RecordingSession::default());
        let config = DeadLetterConfig {
            max_redelivered: 0,
            time_to_live_millis: 60_000,
            ..DeadLetterConfig::default()
        };
        let governor =
            RedeliveryGovernor::new(config, &NamePathResolver, session.clone(), None).unwrap();

        let before = now_millis();
        assert!(governor.handle(&redelivered("M1")).await.unwrap());
        let sent = session.sent.lock().unwrap();
        assert!(sent[0].expiration >= before + 60_000);
    }

    #[tokio::test]
    async fn test_send_failure_not_retried_decision_stands() {
        let session = Arc::new(RecordingSession {
            fail: true,
            ..RecordingSession::default()
        });
        let governor = RedeliveryGovernor::new(
            DeadLetterConfig {
                max_redelivered: 0,
                ..DeadLetterConfig::default()
            },
            &NamePathResolver,
            session.clone(),
            None,
        )
        .unwrap();

        // The decision stands even though the forward failed; the entry is
        // gone and normal delivery stays suppressed.
        assert!(governor.handle(&redelivered("M1")).await.unwrap());
        assert_eq!(governor.buffer().count("M1"), None);
    }

    #[test]
    fn test_bad_destination_fails_construction() {
        let session = Arc::new(RecordingSession::default());
        let config = DeadLetterConfig {
            destination: "nowhere".into(),
            ..DeadLetterConfig::default()
        };
        assert!(RedeliveryGovernor::new(config, &NamePathResolver, session, None).is_err());
    }

    #[test]
    fn test_options_parsing() {
        let options = json!({
            "DestinationQueue": "queue/poison",
            "MaxTimesRedelivered": 3,
            "TimeToLive": 5000,
            "DLQUser": "dlq",
            "SomethingElse": true,
        });
        let config = DeadLetterConfig::from_options(&options).unwrap();
        assert_eq!(config.destination, "queue/poison");
        assert_eq!(config.max_redelivered, 3);
        assert_eq!(config.time_to_live_millis, 5000);
        assert_eq!(config.user.as_deref(), Some("dlq"));
        assert_eq!(config.password, None);

        let config = DeadLetterConfig::from_options(&json!({})).unwrap();
        assert_eq!(config.destination, DEFAULT_DEAD_LETTER_NAME);
        assert_eq!(config.max_redelivered, DEFAULT_MAX_REDELIVERED);
    }
}
