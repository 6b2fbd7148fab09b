//! Typed argument and result shapes, one per opcode.
//!
//! Every opcode writes its arguments in a fixed shape and reads back a fixed
//! result type. The shapes here are the single source of truth for both
//! endpoints; adding a field is a compatible change (struct-as-map
//! encoding), renaming or retyping one is not.

use serde::{Deserialize, Serialize};

use crate::message::{Destination, Message};

/// `authenticate(user, password) -> ConnectionToken`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateArgs {
    pub user: String,
    pub password: String,
}

/// `check_user(user, password) -> String` (the principal's client id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckUserArgs {
    pub user: String,
    pub password: String,
}

/// `check_id(id) -> ()` - reserve a caller-chosen client id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckIdArgs {
    pub id: String,
}

/// `create_queue(name) -> Destination` / `create_topic(name) -> Destination`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDestinationArgs {
    pub name: String,
}

/// `delete_temporary_destination(destination) -> ()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTemporaryArgs {
    pub destination: Destination,
}

/// `add_message(message) -> ()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMessageArgs {
    pub message: Message,
}

/// `receive(subscription_id, wait_millis) -> Option<Message>`
///
/// `wait_millis = 0` polls; otherwise the server may hold the request up to
/// that long waiting for a message to arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveArgs {
    pub subscription_id: u64,
    pub wait_millis: u64,
}

/// `browse(destination, selector) -> Vec<Message>` - peek without consuming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseArgs {
    pub destination: Destination,
    pub selector: Option<String>,
}

/// A consumer subscription, client-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: u64,
    pub destination: Destination,
    pub selector: Option<String>,
    /// Name for subscriptions that outlive the connection; `destroy_subscription`
    /// removes by this name.
    pub name: Option<String>,
}

/// `unsubscribe(subscription_id) -> ()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeArgs {
    pub subscription_id: u64,
}

/// `destroy_subscription(name) -> ()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroySubscriptionArgs {
    pub name: String,
}

/// Acknowledgement of one delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    pub message_id: String,
    pub subscription_id: u64,
}

/// `acknowledge(ack) -> ()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcknowledgeArgs {
    pub ack: MessageAck,
}

/// Transaction completion verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactVerb {
    Commit,
    Rollback,
}

/// `transact(verb, acks) -> ()` - complete a transacted batch: on commit the
/// carried acks take effect, on rollback the messages become redeliverable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactArgs {
    pub verb: TransactVerb,
    pub acks: Vec<MessageAck>,
}

/// `set_enabled(enabled) -> ()` - gate asynchronous delivery to this session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetEnabledArgs {
    pub enabled: bool,
}

/// Push-channel `deliver`: a message for one of the client's subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverArgs {
    pub subscription_id: u64,
    pub message: Message,
}
