//! Server invocation endpoint.
//!
//! Accepts connections, runs one task per connection, and demultiplexes
//! incoming opcodes into calls on the [`Invoker`]. Each connection's task
//! owns its sync-channel reader: frames are read, dispatched, and answered
//! strictly one at a time, which is the per-channel request/reply ordering
//! the protocol promises. A slow client only ever stalls its own task.
//!
//! Failure handling per frame:
//! - a business fault from the invoker becomes a fault reply; the loop keeps
//!   serving further frames
//! - a malformed frame or unknown opcode is reported as a fault reply and
//!   then terminates the connection (protocol errors are always fatal)
//! - an I/O error terminates the connection immediately; the peer is
//!   expected to notice the closed socket and reconnect

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;

use crate::callback::PushSender;
use crate::codec::MsgPackCodec;
use crate::error::{MqwireError, Result};
use crate::invoker::{InvokeResult, Invoker};
use crate::mux::{Multiplexor, PUSH_CHANNEL, SYNC_CHANNEL};
use crate::protocol::ops::{
    AcknowledgeArgs, AddMessageArgs, AuthenticateArgs, BrowseArgs, CheckIdArgs, CheckUserArgs,
    CreateDestinationArgs, DeleteTemporaryArgs, DestroySubscriptionArgs, ReceiveArgs,
    SetEnabledArgs, Subscription, TransactArgs, UnsubscribeArgs,
};
use crate::protocol::{decode_request, encode_reply, Opcode, RemoteFault, Reply};
use crate::session::ConnectionToken;

/// Handle for stopping a running server.
#[derive(Clone)]
pub struct ServerHandle {
    stop_tx: watch::Sender<bool>,
}

impl ServerHandle {
    /// Ask the accept loop to stop. Existing connections drain on their own
    /// sockets.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// The listening endpoint.
pub struct ServerEndpoint {
    listener: TcpListener,
    invoker: Arc<dyn Invoker>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl ServerEndpoint {
    /// Bind the listener.
    pub async fn bind(addr: impl ToSocketAddrs, invoker: Arc<dyn Invoker>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            listener,
            invoker,
            stop_tx,
            stop_rx,
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle that stops the accept loop.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Run the accept loop until stopped. The loop selects on the stop
    /// signal so a shutdown request is observed promptly, not on the next
    /// accept.
    pub async fn serve(self) -> Result<()> {
        let mut stop_rx = self.stop_rx.clone();
        let addr = self.listener.local_addr()?;
        tracing::info!(%addr, "server listening");

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        tracing::info!("server stopping");
                        return Ok(());
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "connection accepted");
                            let invoker = self.invoker.clone();
                            tokio::spawn(async move {
                                match serve_connection(stream, invoker).await {
                                    Ok(()) => tracing::debug!(%peer, "connection closed"),
                                    Err(e) if e.is_connectivity() => {
                                        tracing::debug!(%peer, error = %e, "connection dropped")
                                    }
                                    Err(e) => tracing::warn!(%peer, error = %e, "connection failed"),
                                }
                            });
                        }
                        Err(e) => {
                            // Transient accept failures (EMFILE and friends)
                            // must not kill the service.
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }
}

/// Serve one connection's frame loop. Generic over the stream so tests can
/// drive it with an in-memory duplex.
pub(crate) async fn serve_connection<S>(stream: S, invoker: Arc<dyn Invoker>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mux = Multiplexor::open(stream);
    let mut sync_rx = mux
        .take_reader(SYNC_CHANNEL)
        .expect("fresh multiplexor has its channels");
    let sync_tx = mux.writer(SYNC_CHANNEL);
    let push = PushSender::new(
        mux.writer(PUSH_CHANNEL),
        mux.take_reader(PUSH_CHANNEL)
            .expect("fresh multiplexor has its channels"),
    );

    // Tokens authenticated on this connection; their push channels are
    // detached when the connection goes away.
    let mut tokens: Vec<ConnectionToken> = Vec::new();

    let outcome = connection_loop(&mut sync_rx, &sync_tx, &push, &invoker, &mut tokens).await;

    for token in tokens {
        invoker.detach_push_channel(token);
    }
    mux.close();

    match outcome {
        // Peer closed the socket: a normal end of conversation.
        Err(MqwireError::ConnectionClosed) => Ok(()),
        other => other,
    }
}

async fn connection_loop(
    sync_rx: &mut crate::mux::ChannelReader,
    sync_tx: &crate::mux::ChannelWriter,
    push: &PushSender,
    invoker: &Arc<dyn Invoker>,
    tokens: &mut Vec<ConnectionToken>,
) -> Result<()> {
    loop {
        let frame = sync_rx.recv().await?;

        let (opcode, token, payload) = match decode_request(&frame) {
            Ok(parts) => parts,
            Err(e) => {
                // Report the protocol violation to the caller, then tear the
                // connection down - never drop it silently.
                let reply = Reply::Failed(RemoteFault::new(e.to_string()));
                let _ = sync_tx.send(encode_reply(&reply)?).await;
                return Err(e);
            }
        };

        if opcode == Opcode::Ping {
            // Fire-and-forget by contract: no reply frame.
            tracing::trace!(%token, "ping");
            continue;
        }

        if opcode.is_push() {
            let e = MqwireError::Protocol(format!("push opcode {:?} on sync channel", opcode));
            let reply = Reply::Failed(RemoteFault::new(e.to_string()));
            let _ = sync_tx.send(encode_reply(&reply)?).await;
            return Err(e);
        }

        let reply = if !opcode.is_handshake() && !tokens.contains(&token) {
            Reply::Failed(RemoteFault::new(format!(
                "unknown connection token {token}"
            )))
        } else {
            match dispatch(invoker, push, tokens, opcode, token, &payload).await {
                Ok(reply) => reply,
                Err(e) => {
                    // Undecodable arguments are a malformed frame: report,
                    // then terminate.
                    let reply = Reply::Failed(RemoteFault::new(e.to_string()));
                    let _ = sync_tx.send(encode_reply(&reply)?).await;
                    return Err(e);
                }
            }
        };

        sync_tx.send(encode_reply(&reply)?).await?;
    }
}

/// Decode the opcode's arguments and call the invoker. Business faults map
/// to fault replies; only malformed argument payloads surface as `Err`.
async fn dispatch(
    invoker: &Arc<dyn Invoker>,
    push: &PushSender,
    tokens: &mut Vec<ConnectionToken>,
    opcode: Opcode,
    token: ConnectionToken,
    payload: &Bytes,
) -> Result<Reply> {
    match opcode {
        Opcode::Authenticate => {
            let args: AuthenticateArgs = MsgPackCodec::decode(payload)?;
            let result = invoker.authenticate(&args.user, &args.password).await;
            if let Ok(issued) = &result {
                tokens.push(*issued);
                invoker.attach_push_channel(*issued, push.clone());
                tracing::debug!(user = %args.user, token = %issued, "session opened");
            }
            value_reply(result)
        }
        Opcode::CheckUser => {
            let args: CheckUserArgs = MsgPackCodec::decode(payload)?;
            value_reply(invoker.check_user(&args.user, &args.password).await)
        }
        Opcode::GetId => value_reply(invoker.get_id(token).await),
        Opcode::CheckId => {
            let args: CheckIdArgs = MsgPackCodec::decode(payload)?;
            empty_reply(invoker.check_id(token, &args.id).await)
        }
        Opcode::ConnectionClosing => {
            let result = invoker.connection_closing(token).await;
            if result.is_ok() {
                invoker.detach_push_channel(token);
                tokens.retain(|t| *t != token);
                tracing::debug!(%token, "session closed");
            }
            empty_reply(result)
        }
        Opcode::CreateQueue => {
            let args: CreateDestinationArgs = MsgPackCodec::decode(payload)?;
            value_reply(invoker.create_queue(token, &args.name).await)
        }
        Opcode::CreateTopic => {
            let args: CreateDestinationArgs = MsgPackCodec::decode(payload)?;
            value_reply(invoker.create_topic(token, &args.name).await)
        }
        Opcode::GetTemporaryQueue => value_reply(invoker.get_temporary_queue(token).await),
        Opcode::GetTemporaryTopic => value_reply(invoker.get_temporary_topic(token).await),
        Opcode::DeleteTemporaryDestination => {
            let args: DeleteTemporaryArgs = MsgPackCodec::decode(payload)?;
            empty_reply(
                invoker
                    .delete_temporary_destination(token, args.destination)
                    .await,
            )
        }
        Opcode::AddMessage => {
            let args: AddMessageArgs = MsgPackCodec::decode(payload)?;
            empty_reply(invoker.add_message(token, args.message).await)
        }
        Opcode::Receive => {
            let args: ReceiveArgs = MsgPackCodec::decode(payload)?;
            let result = invoker
                .receive(token, args.subscription_id, args.wait_millis)
                .await;
            match result {
                Ok(message) => Reply::opt_value(&message),
                Err(fault) => Ok(Reply::Failed(RemoteFault::new(fault.message))),
            }
        }
        Opcode::Browse => {
            let args: BrowseArgs = MsgPackCodec::decode(payload)?;
            value_reply(invoker.browse(token, args.destination, args.selector).await)
        }
        Opcode::Subscribe => {
            let args: Subscription = MsgPackCodec::decode(payload)?;
            empty_reply(invoker.subscribe(token, args).await)
        }
        Opcode::Unsubscribe => {
            let args: UnsubscribeArgs = MsgPackCodec::decode(payload)?;
            empty_reply(invoker.unsubscribe(token, args.subscription_id).await)
        }
        Opcode::DestroySubscription => {
            let args: DestroySubscriptionArgs = MsgPackCodec::decode(payload)?;
            empty_reply(invoker.destroy_subscription(token, &args.name).await)
        }
        Opcode::Acknowledge => {
            let args: AcknowledgeArgs = MsgPackCodec::decode(payload)?;
            empty_reply(invoker.acknowledge(token, args.ack).await)
        }
        Opcode::Transact => {
            let args: TransactArgs = MsgPackCodec::decode(payload)?;
            empty_reply(invoker.transact(token, args.verb, args.acks).await)
        }
        Opcode::SetEnabled => {
            let args: SetEnabledArgs = MsgPackCodec::decode(payload)?;
            empty_reply(invoker.set_enabled(token, args.enabled).await)
        }
        // Handled before dispatch.
        Opcode::Ping | Opcode::Deliver | Opcode::PushPing => {
            unreachable!("filtered in connection loop")
        }
    }
}

fn value_reply<T: serde::Serialize>(result: InvokeResult<T>) -> Result<Reply> {
    match result {
        Ok(value) => Reply::value(&value),
        Err(fault) => Ok(Reply::Failed(RemoteFault::new(fault.message))),
    }
}

fn empty_reply(result: InvokeResult<()>) -> Result<Reply> {
    match result {
        Ok(()) => Ok(Reply::Empty),
        Err(fault) => Ok(Reply::Failed(RemoteFault::new(fault.message))),
    }
}
