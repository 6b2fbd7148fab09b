//! Server business boundary.
//!
//! The invocation layer carries calls; it does not store messages or match
//! subscriptions. That work belongs to the [`Invoker`] the server endpoint
//! is constructed with - one async method per opcode. A fault returned by an
//! invoker method is serialized into the reply frame and rethrown at the
//! caller; it never terminates the connection.

use async_trait::async_trait;

use crate::callback::PushSender;
use crate::error::{MqwireError, Result};
use crate::message::{Destination, Message};
use crate::protocol::ops::{MessageAck, Subscription, TransactVerb};
use crate::session::ConnectionToken;

/// A fault raised by business logic, reported to the remote caller.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvokeFault {
    pub message: String,
}

impl InvokeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result type for invoker methods.
pub type InvokeResult<T> = std::result::Result<T, InvokeFault>;

/// The server-side business object, one method per opcode.
///
/// All methods except the handshake ones receive a validated
/// [`ConnectionToken`]; the endpoint rejects session-scoped requests whose
/// token it does not know before they reach the invoker.
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
    async fn authenticate(&self, user: &str, password: &str) -> InvokeResult<ConnectionToken>;

    async fn check_user(&self, user: &str, password: &str) -> InvokeResult<String>;

    async fn get_id(&self, token: ConnectionToken) -> InvokeResult<String>;

    async fn check_id(&self, token: ConnectionToken, id: &str) -> InvokeResult<()>;

    async fn connection_closing(&self, token: ConnectionToken) -> InvokeResult<()>;

    async fn create_queue(&self, token: ConnectionToken, name: &str) -> InvokeResult<Destination>;

    async fn create_topic(&self, token: ConnectionToken, name: &str) -> InvokeResult<Destination>;

    async fn get_temporary_queue(&self, token: ConnectionToken) -> InvokeResult<Destination>;

    async fn get_temporary_topic(&self, token: ConnectionToken) -> InvokeResult<Destination>;

    async fn delete_temporary_destination(
        &self,
        token: ConnectionToken,
        destination: Destination,
    ) -> InvokeResult<()>;

    async fn add_message(&self, token: ConnectionToken, message: Message) -> InvokeResult<()>;

    /// Synchronous receive; `None` when nothing arrived within `wait_millis`.
    async fn receive(
        &self,
        token: ConnectionToken,
        subscription_id: u64,
        wait_millis: u64,
    ) -> InvokeResult<Option<Message>>;

    async fn browse(
        &self,
        token: ConnectionToken,
        destination: Destination,
        selector: Option<String>,
    ) -> InvokeResult<Vec<Message>>;

    async fn subscribe(&self, token: ConnectionToken, subscription: Subscription)
        -> InvokeResult<()>;

    async fn unsubscribe(&self, token: ConnectionToken, subscription_id: u64) -> InvokeResult<()>;

    async fn destroy_subscription(&self, token: ConnectionToken, name: &str) -> InvokeResult<()>;

    async fn acknowledge(&self, token: ConnectionToken, ack: MessageAck) -> InvokeResult<()>;

    async fn transact(
        &self,
        token: ConnectionToken,
        verb: TransactVerb,
        acks: Vec<MessageAck>,
    ) -> InvokeResult<()>;

    async fn set_enabled(&self, token: ConnectionToken, enabled: bool) -> InvokeResult<()>;

    /// The endpoint hands each authenticated session its connection's push
    /// channel so the invoker can deliver asynchronously. Default: the
    /// invoker does not push.
    fn attach_push_channel(&self, _token: ConnectionToken, _channel: PushSender) {}

    /// Called when a session's connection is gone; pushes for it must stop.
    fn detach_push_channel(&self, _token: ConnectionToken) {}
}

/// Resolves a destination name to a [`Destination`].
///
/// Consumed by components configured with textual destination names, such as
/// the redelivery governor's dead-letter target.
pub trait DestinationResolver: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Destination>;
}

/// Resolver for `kind/name` paths: `queue/DLQ`, `topic/events`.
pub struct NamePathResolver;

impl DestinationResolver for NamePathResolver {
    fn lookup(&self, name: &str) -> Result<Destination> {
        match name.split_once('/') {
            Some(("queue", rest)) if !rest.is_empty() => Ok(Destination::Queue(rest.to_string())),
            Some(("topic", rest)) if !rest.is_empty() => Ok(Destination::Topic(rest.to_string())),
            _ => Err(MqwireError::Remote(format!(
                "unresolvable destination name: {name}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_path_resolver() {
        let resolver = NamePathResolver;
        assert_eq!(
            resolver.lookup("queue/DLQ").unwrap(),
            Destination::Queue("DLQ".into())
        );
        assert_eq!(
            resolver.lookup("topic/events").unwrap(),
            Destination::Topic("events".into())
        );
        assert!(resolver.lookup("DLQ").is_err());
        assert!(resolver.lookup("queue/").is_err());
        assert!(resolver.lookup("tmpqueue/x").is_err());
    }

    #[test]
    fn test_invoke_fault_display() {
        let fault = InvokeFault::new("queue not found: orders");
        assert_eq!(fault.to_string(), "queue not found: orders");
    }
}
