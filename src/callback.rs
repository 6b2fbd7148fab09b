//! Asynchronous callback channel - the server-to-client direction.
//!
//! Deliveries and keepalive pings travel on the push channel without an
//! outstanding client request. The discipline mirrors the sync channel in
//! reverse: the server writes one push frame, then waits for the client's
//! lightweight ack before the next push. On the client, a dedicated task
//! reads push frames and dispatches them, so a long-running delivery handler
//! never blocks an in-flight synchronous call and vice versa.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::invoker::InvokeFault;
use crate::message::Message;
use crate::mux::{ChannelReader, ChannelWriter};
use crate::protocol::ops::DeliverArgs;
use crate::protocol::{
    decode_push, decode_push_ack, encode_push, encode_push_ack, Opcode, RemoteFault,
};
use crate::redelivery::RedeliveryGovernor;

/// One pushed message, as the consumer sees it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription_id: u64,
    pub message: Message,
}

/// The consumer of pushed messages - the container's dispatch target.
///
/// Returning an error acks the push negatively; the broker treats the
/// delivery attempt as failed and may redeliver.
#[async_trait]
pub trait MessageCallback: Send + Sync + 'static {
    async fn on_message(&self, delivery: Delivery) -> std::result::Result<(), InvokeFault>;
}

/// Server-side handle for pushing frames to one connection's client.
///
/// Cloneable; all clones share the one-push-in-flight lock, so a connection
/// never interleaves two pushes.
#[derive(Clone)]
pub struct PushSender {
    inner: Arc<tokio::sync::Mutex<PushPair>>,
}

struct PushPair {
    writer: ChannelWriter,
    reader: ChannelReader,
}

impl PushSender {
    /// Build from the push channel's two directions: outbound frames and
    /// inbound acks.
    pub fn new(writer: ChannelWriter, reader: ChannelReader) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(PushPair { writer, reader })),
        }
    }

    /// Push a message delivery; resolves once the client has acked it.
    ///
    /// The outer error is connectivity (the channel is gone); the inner
    /// result is the client's verdict on the delivery.
    pub async fn deliver(
        &self,
        subscription_id: u64,
        message: Message,
    ) -> Result<std::result::Result<(), RemoteFault>> {
        let args = DeliverArgs {
            subscription_id,
            message,
        };
        self.push(Opcode::Deliver, &args).await
    }

    /// Push a keepalive ping; the client acks without dispatching it.
    pub async fn ping(&self) -> Result<std::result::Result<(), RemoteFault>> {
        self.push(Opcode::PushPing, &()).await
    }

    async fn push<T: Serialize>(
        &self,
        opcode: Opcode,
        args: &T,
    ) -> Result<std::result::Result<(), RemoteFault>> {
        let mut pair = self.inner.lock().await;
        pair.writer.send(encode_push(opcode, args)?).await?;
        let ack = pair.reader.recv().await?;
        decode_push_ack(&ack)
    }
}

/// Spawn the client-side push loop: read push frames, dispatch deliveries to
/// the callback, write acks. Exits when the channel dies or a protocol
/// violation is seen.
pub fn spawn_push_loop(
    mut reader: ChannelReader,
    ack_writer: ChannelWriter,
    callback: Arc<dyn MessageCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = match reader.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "push channel closed");
                    return;
                }
            };

            let outcome = match dispatch_push(&frame, &callback).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Malformed push frame: protocol errors are fatal.
                    tracing::warn!(error = %e, "malformed push frame, abandoning push loop");
                    return;
                }
            };

            let ack = match encode_push_ack(&outcome) {
                Ok(ack) => ack,
                Err(e) => {
                    tracing::warn!(error = %e, "push ack encode failed");
                    return;
                }
            };
            if let Err(e) = ack_writer.send(ack).await {
                tracing::debug!(error = %e, "push ack write failed, channel gone");
                return;
            }
        }
    })
}

async fn dispatch_push(
    frame: &bytes::Bytes,
    callback: &Arc<dyn MessageCallback>,
) -> Result<std::result::Result<(), RemoteFault>> {
    let (opcode, payload) = decode_push(frame)?;
    match opcode {
        Opcode::PushPing => Ok(Ok(())),
        Opcode::Deliver => {
            let args: DeliverArgs = MsgPackCodec::decode(&payload)?;
            let delivery = Delivery {
                subscription_id: args.subscription_id,
                message: args.message,
            };
            match callback.on_message(delivery).await {
                Ok(()) => Ok(Ok(())),
                Err(fault) => {
                    tracing::debug!(fault = %fault, "delivery handler faulted");
                    Ok(Err(RemoteFault::new(fault.message)))
                }
            }
        }
        // decode_push only yields push opcodes; anything else is unreachable
        // by construction, but fail loudly rather than ack blindly.
        other => Ok(Err(RemoteFault::new(format!(
            "unexpected push opcode {:?}",
            other
        )))),
    }
}

/// Delivery pipeline: redelivery governance in front of the container.
///
/// A redelivered message is first put to the governor; if the governor
/// reroutes it (dead-lettered), normal delivery is suppressed and the push
/// is acked positively. A governor failure admits the message - failing
/// closed means declining to intervene, not dropping traffic.
pub struct DeliveryPipeline {
    governor: Arc<RedeliveryGovernor>,
    container: Arc<dyn MessageCallback>,
}

impl DeliveryPipeline {
    pub fn new(governor: Arc<RedeliveryGovernor>, container: Arc<dyn MessageCallback>) -> Self {
        Self {
            governor,
            container,
        }
    }
}

#[async_trait]
impl MessageCallback for DeliveryPipeline {
    async fn on_message(&self, delivery: Delivery) -> std::result::Result<(), InvokeFault> {
        if delivery.message.redelivered {
            match self.governor.handle(&delivery.message).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "redelivery governor failed, admitting message");
                }
            }
        }
        self.container.on_message(delivery).await
    }
}
