//! Client invocation endpoint.
//!
//! [`ClientConnection`] turns local method calls into request frames and
//! blocks for the paired reply: one request in flight per connection, full
//! stop. Callers that need concurrent calls open more connections. The push
//! channel runs independently on its own task, so an inbound delivery never
//! waits on an outstanding synchronous call and vice versa.
//!
//! `ping` is the deliberate exception to the request/reply pairing: it is
//! written without taking the call lane and without awaiting a reply, so two
//! peers pinging each other while blocked in calls cannot deadlock.
//!
//! For long-lived service connections, [`ReconnectSupervisor`] re-establishes
//! a failed connection on a fixed interval and replays a caller-supplied
//! restore step (re-authenticate, re-subscribe).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::callback::{spawn_push_loop, MessageCallback};
use crate::error::Result;
use crate::message::{Destination, Message};
use crate::mux::{ChannelReader, ChannelWriter, Multiplexor, PUSH_CHANNEL, SYNC_CHANNEL};
use crate::protocol::ops::{
    AcknowledgeArgs, AddMessageArgs, AuthenticateArgs, BrowseArgs, CheckIdArgs, CheckUserArgs,
    CreateDestinationArgs, DeleteTemporaryArgs, DestroySubscriptionArgs, MessageAck, ReceiveArgs,
    SetEnabledArgs, Subscription, TransactArgs, TransactVerb, UnsubscribeArgs,
};
use crate::protocol::{decode_reply, encode_request, Opcode, Reply};
use crate::session::ConnectionToken;

/// Default keepalive ping interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default reconnect retry interval (fixed, no backoff).
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Keepalive ping cadence; `None` disables the pinger task.
    pub ping_interval: Option<Duration>,
    /// Fixed interval between reconnect attempts of a supervisor.
    pub retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// The sync channel's two directions, locked together for the duration of
/// one request/reply exchange.
struct CallLane {
    tx: ChannelWriter,
    rx: ChannelReader,
}

/// A client connection to a server endpoint.
pub struct ClientConnection {
    mux: Multiplexor,
    lane: tokio::sync::Mutex<CallLane>,
    /// Writer clone for fire-and-forget pings; bypasses the call lane.
    ping_tx: ChannelWriter,
    token: std::sync::Mutex<ConnectionToken>,
    _push_task: JoinHandle<()>,
    ping_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Connect over TCP and start the push loop.
    pub async fn connect(
        addr: &str,
        callback: Arc<dyn MessageCallback>,
        config: ClientConfig,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::over_stream(stream, callback, config))
    }

    /// Build a connection over an arbitrary stream (in-memory transports,
    /// tests).
    pub fn over_stream<S>(stream: S, callback: Arc<dyn MessageCallback>, config: ClientConfig) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let mux = Multiplexor::open(stream);

        let lane = CallLane {
            tx: mux.writer(SYNC_CHANNEL),
            rx: mux
                .take_reader(SYNC_CHANNEL)
                .expect("fresh multiplexor has its channels"),
        };
        let ping_tx = mux.writer(SYNC_CHANNEL);

        let push_task = spawn_push_loop(
            mux.take_reader(PUSH_CHANNEL)
                .expect("fresh multiplexor has its channels"),
            mux.writer(PUSH_CHANNEL),
            callback,
        );

        let ping_task = config.ping_interval.map(|interval| {
            let tx = mux.writer(SYNC_CHANNEL);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let frame = match encode_request(Opcode::Ping, ConnectionToken::NONE, &()) {
                        Ok(frame) => frame,
                        Err(_) => return,
                    };
                    if tx.send(frame).await.is_err() {
                        tracing::debug!("pinger stopping, channel gone");
                        return;
                    }
                }
            })
        });

        Self {
            mux,
            lane: tokio::sync::Mutex::new(lane),
            ping_tx,
            token: std::sync::Mutex::new(ConnectionToken::NONE),
            _push_task: push_task,
            ping_task,
        }
    }

    /// The session token, once authenticated.
    pub fn token(&self) -> ConnectionToken {
        *self.token.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One request/reply exchange. The lane lock is held across both halves:
    /// that is the "one outstanding request per connection" discipline.
    async fn roundtrip<A: Serialize>(&self, opcode: Opcode, args: &A) -> Result<Reply> {
        let frame = encode_request(opcode, self.token(), args)?;
        let mut lane = self.lane.lock().await;
        lane.tx.send(frame).await?;
        let reply = lane.rx.recv().await?;
        decode_reply(&reply)
    }

    /// Handshake: authenticate and adopt the issued session token.
    pub async fn authenticate(&self, user: &str, password: &str) -> Result<ConnectionToken> {
        let issued: ConnectionToken = self
            .roundtrip(
                Opcode::Authenticate,
                &AuthenticateArgs {
                    user: user.to_string(),
                    password: password.to_string(),
                },
            )
            .await?
            .into_value()?;
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = issued;
        Ok(issued)
    }

    /// Validate credentials without opening a session.
    pub async fn check_user(&self, user: &str, password: &str) -> Result<String> {
        self.roundtrip(
            Opcode::CheckUser,
            &CheckUserArgs {
                user: user.to_string(),
                password: password.to_string(),
            },
        )
        .await?
        .into_value()
    }

    /// Fetch a server-assigned client id.
    pub async fn get_id(&self) -> Result<String> {
        self.roundtrip(Opcode::GetId, &()).await?.into_value()
    }

    /// Reserve a caller-chosen client id.
    pub async fn check_id(&self, id: &str) -> Result<()> {
        self.roundtrip(Opcode::CheckId, &CheckIdArgs { id: id.to_string() })
            .await?
            .into_empty()
    }

    /// Announce orderly close; the token is invalid afterwards.
    pub async fn connection_closing(&self) -> Result<()> {
        let result = self
            .roundtrip(Opcode::ConnectionClosing, &())
            .await?
            .into_empty();
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionToken::NONE;
        result
    }

    pub async fn create_queue(&self, name: &str) -> Result<Destination> {
        self.roundtrip(
            Opcode::CreateQueue,
            &CreateDestinationArgs {
                name: name.to_string(),
            },
        )
        .await?
        .into_value()
    }

    pub async fn create_topic(&self, name: &str) -> Result<Destination> {
        self.roundtrip(
            Opcode::CreateTopic,
            &CreateDestinationArgs {
                name: name.to_string(),
            },
        )
        .await?
        .into_value()
    }

    pub async fn get_temporary_queue(&self) -> Result<Destination> {
        self.roundtrip(Opcode::GetTemporaryQueue, &())
            .await?
            .into_value()
    }

    pub async fn get_temporary_topic(&self) -> Result<Destination> {
        self.roundtrip(Opcode::GetTemporaryTopic, &())
            .await?
            .into_value()
    }

    pub async fn delete_temporary_destination(&self, destination: Destination) -> Result<()> {
        self.roundtrip(
            Opcode::DeleteTemporaryDestination,
            &DeleteTemporaryArgs { destination },
        )
        .await?
        .into_empty()
    }

    /// Send a message to its destination.
    pub async fn add_message(&self, message: Message) -> Result<()> {
        self.roundtrip(Opcode::AddMessage, &AddMessageArgs { message })
            .await?
            .into_empty()
    }

    /// Synchronous receive; `Ok(None)` when nothing arrived in time.
    pub async fn receive(&self, subscription_id: u64, wait_millis: u64) -> Result<Option<Message>> {
        self.roundtrip(
            Opcode::Receive,
            &ReceiveArgs {
                subscription_id,
                wait_millis,
            },
        )
        .await?
        .into_result()
    }

    /// Peek at a destination without consuming.
    pub async fn browse(
        &self,
        destination: Destination,
        selector: Option<String>,
    ) -> Result<Vec<Message>> {
        self.roundtrip(
            Opcode::Browse,
            &BrowseArgs {
                destination,
                selector,
            },
        )
        .await?
        .into_value()
    }

    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.roundtrip(Opcode::Subscribe, &subscription)
            .await?
            .into_empty()
    }

    pub async fn unsubscribe(&self, subscription_id: u64) -> Result<()> {
        self.roundtrip(Opcode::Unsubscribe, &UnsubscribeArgs { subscription_id })
            .await?
            .into_empty()
    }

    pub async fn destroy_subscription(&self, name: &str) -> Result<()> {
        self.roundtrip(
            Opcode::DestroySubscription,
            &DestroySubscriptionArgs {
                name: name.to_string(),
            },
        )
        .await?
        .into_empty()
    }

    pub async fn acknowledge(&self, ack: MessageAck) -> Result<()> {
        self.roundtrip(Opcode::Acknowledge, &AcknowledgeArgs { ack })
            .await?
            .into_empty()
    }

    /// Complete a transacted batch.
    pub async fn transact(&self, verb: TransactVerb, acks: Vec<MessageAck>) -> Result<()> {
        self.roundtrip(Opcode::Transact, &TransactArgs { verb, acks })
            .await?
            .into_empty()
    }

    /// Gate asynchronous delivery to this session.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.roundtrip(Opcode::SetEnabled, &SetEnabledArgs { enabled })
            .await?
            .into_empty()
    }

    /// Fire-and-forget liveness probe. Does not take the call lane and does
    /// not await a reply.
    pub async fn ping(&self) -> Result<()> {
        let frame = encode_request(Opcode::Ping, self.token(), &())?;
        self.ping_tx.send(frame).await
    }

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        if let Some(task) = &self.ping_task {
            task.abort();
        }
        self.mux.close();
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Future type for the supervisor's restore step.
pub type RestoreFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Fixed-interval reconnect loop for long-lived service connections.
///
/// On every (re)connect the `restore` step runs first - authenticate,
/// re-subscribe, whatever the service needs - before the connection is
/// published to callers. Liveness is probed with the fire-and-forget ping;
/// when the channel dies the supervisor clears the published connection and
/// retries on the same fixed interval. No backoff: these are in-cluster
/// links where the peer is expected back shortly.
pub struct ReconnectSupervisor {
    current: Arc<tokio::sync::RwLock<Option<Arc<ClientConnection>>>>,
    stop_tx: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

impl ReconnectSupervisor {
    /// Spawn the supervisor loop.
    pub fn spawn<R>(
        addr: String,
        config: ClientConfig,
        callback: Arc<dyn MessageCallback>,
        restore: R,
    ) -> Self
    where
        R: Fn(Arc<ClientConnection>) -> RestoreFuture + Send + Sync + 'static,
    {
        let current: Arc<tokio::sync::RwLock<Option<Arc<ClientConnection>>>> =
            Arc::new(tokio::sync::RwLock::new(None));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(supervisor_loop(
            addr,
            config,
            callback,
            restore,
            current.clone(),
            stop_rx,
        ));

        Self {
            current,
            stop_tx,
            _task: task,
        }
    }

    /// The live connection, if one is currently established and restored.
    pub async fn connection(&self) -> Option<Arc<ClientConnection>> {
        self.current.read().await.clone()
    }

    /// Stop supervising and drop the current connection.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn supervisor_loop<R>(
    addr: String,
    config: ClientConfig,
    callback: Arc<dyn MessageCallback>,
    restore: R,
    current: Arc<tokio::sync::RwLock<Option<Arc<ClientConnection>>>>,
    mut stop_rx: watch::Receiver<bool>,
) where
    R: Fn(Arc<ClientConnection>) -> RestoreFuture + Send + Sync + 'static,
{
    let retry = config.retry_interval;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        match ClientConnection::connect(&addr, callback.clone(), config.clone()).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                match restore(conn.clone()).await {
                    Ok(()) => {
                        tracing::info!(%addr, "connection established");
                        *current.write().await = Some(conn.clone());

                        // Probe until the channel dies or we are stopped.
                        loop {
                            tokio::select! {
                                _ = stop_rx.changed() => {}
                                _ = tokio::time::sleep(retry) => {}
                            }
                            if *stop_rx.borrow() {
                                break;
                            }
                            if conn.ping().await.is_err() {
                                tracing::warn!(%addr, "connection lost, will reconnect");
                                break;
                            }
                        }
                        *current.write().await = None;
                        conn.close();
                    }
                    Err(e) => {
                        tracing::warn!(%addr, error = %e, "restore failed, will retry");
                    }
                }
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed, will retry");
            }
        }

        if *stop_rx.borrow() {
            break;
        }
        tokio::time::sleep(retry).await;
    }

    *current.write().await = None;
    tracing::debug!(%addr, "supervisor stopped");
}
