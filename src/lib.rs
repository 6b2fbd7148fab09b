//! # mqwire
//!
//! Message-oriented middleware invocation layer: reliable point-to-point and
//! publish/subscribe delivery over a multiplexed binary socket protocol,
//! plus the redelivery governance that keeps poison messages from being
//! retried forever.
//!
//! ## Architecture
//!
//! One TCP connection carries two independent logical channels:
//!
//! - **sync channel**: client→server opcode calls, each answered by exactly
//!   one reply frame (strict ping-pong, no pipelining)
//! - **push channel**: server→client deliveries and keepalive pings, each
//!   acked by the client
//!
//! A blocking call on one channel never stalls the other - the
//! [`mux::Multiplexor`] routes whole frames to per-channel queues.
//!
//! On the consuming side, deliveries flagged as redelivered pass through the
//! [`redelivery::RedeliveryGovernor`] before business logic: once a message
//! exceeds the redelivery threshold it is rerouted to the dead-letter
//! destination on an independent session, and the consumer never sees it
//! again.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mqwire::client::{ClientConfig, ClientConnection};
//! use mqwire::message::Message;
//!
//! #[tokio::main]
//! async fn main() -> mqwire::error::Result<()> {
//!     let conn = ClientConnection::connect("127.0.0.1:9011", callback, ClientConfig::default()).await?;
//!     conn.authenticate("guest", "guest").await?;
//!
//!     let queue = conn.create_queue("orders").await?;
//!     conn.add_message(Message::text(queue, "hello")).await?;
//!     Ok(())
//! }
//! ```

pub mod callback;
pub mod client;
pub mod codec;
pub mod error;
pub mod invoker;
pub mod message;
pub mod mux;
pub mod protocol;
pub mod redelivery;
pub mod server;
pub mod session;
pub mod tx;

mod writer;

pub use callback::{Delivery, DeliveryPipeline, MessageCallback, PushSender};
pub use client::{ClientConfig, ClientConnection, ReconnectSupervisor};
pub use error::{MqwireError, Result};
pub use invoker::{InvokeFault, InvokeResult, Invoker};
pub use message::{Destination, Message, PropertyValue};
pub use redelivery::{
    ClientDeadLetterSession, DeadLetterConfig, DeadLetterSession, RedeliveryGovernor,
};
pub use server::{ServerEndpoint, ServerHandle};
pub use session::ConnectionToken;
