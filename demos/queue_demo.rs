//! Queue demo - an in-process broker, a producer/consumer round trip, and
//! the dead-letter governor chewing on a poison message.
//!
//! ```sh
//! cargo run --example queue_demo
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mqwire::callback::{Delivery, DeliveryPipeline, MessageCallback};
use mqwire::client::{ClientConfig, ClientConnection};
use mqwire::invoker::NamePathResolver;
use mqwire::message::{Destination, Message};
use mqwire::protocol::ops::{MessageAck, Subscription, TransactVerb};
use mqwire::redelivery::{ClientDeadLetterSession, DeadLetterConfig, RedeliveryGovernor};
use mqwire::server::ServerEndpoint;
use mqwire::session::{ConnectionToken, SessionRegistry};
use mqwire::{InvokeFault, InvokeResult, Invoker};

/// Queue-only broker: enough Invoker surface for the demo.
struct DemoBroker {
    sessions: SessionRegistry,
    queues: Mutex<HashMap<Destination, VecDeque<Message>>>,
    subscriptions: Mutex<Vec<(ConnectionToken, Subscription)>>,
    serial: AtomicU64,
}

impl DemoBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionRegistry::new(),
            queues: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            serial: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Invoker for DemoBroker {
    async fn authenticate(&self, user: &str, _password: &str) -> InvokeResult<ConnectionToken> {
        Ok(self.sessions.open(user))
    }

    async fn check_user(&self, user: &str, _password: &str) -> InvokeResult<String> {
        Ok(format!("client-{user}"))
    }

    async fn get_id(&self, _token: ConnectionToken) -> InvokeResult<String> {
        Ok(format!("client-{}", self.serial.fetch_add(1, Ordering::Relaxed)))
    }

    async fn check_id(&self, _token: ConnectionToken, _id: &str) -> InvokeResult<()> {
        Ok(())
    }

    async fn connection_closing(&self, token: ConnectionToken) -> InvokeResult<()> {
        self.sessions.close(token);
        self.subscriptions.lock().unwrap().retain(|(t, _)| *t != token);
        Ok(())
    }

    async fn create_queue(&self, _token: ConnectionToken, name: &str) -> InvokeResult<Destination> {
        let destination = Destination::Queue(name.to_string());
        self.queues
            .lock()
            .unwrap()
            .entry(destination.clone())
            .or_default();
        Ok(destination)
    }

    async fn create_topic(&self, _token: ConnectionToken, name: &str) -> InvokeResult<Destination> {
        Ok(Destination::Topic(name.to_string()))
    }

    async fn get_temporary_queue(&self, _token: ConnectionToken) -> InvokeResult<Destination> {
        Ok(Destination::TemporaryQueue(format!(
            "tmp-{}",
            self.serial.fetch_add(1, Ordering::Relaxed)
        )))
    }

    async fn get_temporary_topic(&self, _token: ConnectionToken) -> InvokeResult<Destination> {
        Ok(Destination::TemporaryTopic(format!(
            "tmp-{}",
            self.serial.fetch_add(1, Ordering::Relaxed)
        )))
    }

    async fn delete_temporary_destination(
        &self,
        _token: ConnectionToken,
        destination: Destination,
    ) -> InvokeResult<()> {
        self.queues.lock().unwrap().remove(&destination);
        Ok(())
    }

    async fn add_message(&self, _token: ConnectionToken, mut message: Message) -> InvokeResult<()> {
        if message.id.is_none() {
            message.id = Some(format!("ID:{}", self.serial.fetch_add(1, Ordering::Relaxed)));
        }
        self.queues
            .lock()
            .unwrap()
            .entry(message.destination.clone())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn receive(
        &self,
        token: ConnectionToken,
        subscription_id: u64,
        _wait_millis: u64,
    ) -> InvokeResult<Option<Message>> {
        let destination = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter()
                .find(|(t, s)| *t == token && s.subscription_id == subscription_id)
                .map(|(_, s)| s.destination.clone())
        };
        let Some(destination) = destination else {
            return Err(InvokeFault::new("unknown subscription"));
        };
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get_mut(&destination)
            .and_then(VecDeque::pop_front))
    }

    async fn browse(
        &self,
        _token: ConnectionToken,
        destination: Destination,
        _selector: Option<String>,
    ) -> InvokeResult<Vec<Message>> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(&destination)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        token: ConnectionToken,
        subscription: Subscription,
    ) -> InvokeResult<()> {
        self.subscriptions.lock().unwrap().push((token, subscription));
        Ok(())
    }

    async fn unsubscribe(&self, token: ConnectionToken, subscription_id: u64) -> InvokeResult<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|(t, s)| !(*t == token && s.subscription_id == subscription_id));
        Ok(())
    }

    async fn destroy_subscription(&self, _token: ConnectionToken, _name: &str) -> InvokeResult<()> {
        Ok(())
    }

    async fn acknowledge(&self, _token: ConnectionToken, _ack: MessageAck) -> InvokeResult<()> {
        Ok(())
    }

    async fn transact(
        &self,
        _token: ConnectionToken,
        _verb: TransactVerb,
        _acks: Vec<MessageAck>,
    ) -> InvokeResult<()> {
        Ok(())
    }

    async fn set_enabled(&self, _token: ConnectionToken, _enabled: bool) -> InvokeResult<()> {
        Ok(())
    }
}

struct PrintingConsumer;

#[async_trait]
impl MessageCallback for PrintingConsumer {
    async fn on_message(&self, delivery: Delivery) -> Result<(), InvokeFault> {
        println!(
            "consumer got: {:?}",
            delivery.message.body_text().unwrap_or("<binary>")
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> mqwire::Result<()> {
    tracing_subscriber::fmt::init();

    // Broker behind the server endpoint.
    let server = ServerEndpoint::bind("127.0.0.1:0", DemoBroker::new()).await?;
    let addr = server.local_addr()?.to_string();
    tokio::spawn(server.serve());

    // Producer/consumer round trip.
    let client =
        ClientConnection::connect(&addr, Arc::new(PrintingConsumer), ClientConfig::default())
            .await?;
    client.authenticate("demo", "demo").await?;

    let orders = client.create_queue("orders").await?;
    client
        .add_message(Message::text(orders.clone(), "hello, queue"))
        .await?;
    client
        .subscribe(Subscription {
            subscription_id: 1,
            destination: orders.clone(),
            selector: None,
            name: None,
        })
        .await?;
    let received = client.receive(1, 1000).await?.expect("message was queued");
    println!("received: {:?}", received.body_text().unwrap());

    // Dead-letter governance: an independent session forwards poison
    // messages once they exceed the threshold.
    let dlq_conn = Arc::new(
        ClientConnection::connect(&addr, Arc::new(PrintingConsumer), ClientConfig::default())
            .await?,
    );
    dlq_conn.authenticate("dlq", "dlq").await?;
    dlq_conn.create_queue("DLQ").await?;

    let governor = Arc::new(RedeliveryGovernor::new(
        DeadLetterConfig {
            max_redelivered: 3,
            ..DeadLetterConfig::default()
        },
        &NamePathResolver,
        Arc::new(ClientDeadLetterSession::new(dlq_conn.clone())),
        None,
    )?);
    let pipeline = DeliveryPipeline::new(governor, Arc::new(PrintingConsumer));

    let mut poison = Message::text(orders, "poison pill");
    poison.id = Some("M-poison".into());
    poison.redelivered = true;

    // Rounds 1 and 2 are admitted (counts 2 and 3); round 3 crosses the
    // threshold and is rerouted to queue/DLQ instead of reaching the
    // consumer. Round 4 starts a fresh tracking cycle.
    for round in 1..=4 {
        println!("delivery round {round}");
        pipeline
            .on_message(Delivery {
                subscription_id: 1,
                message: poison.clone(),
            })
            .await
            .ok();
    }

    let dead = dlq_conn.browse(Destination::Queue("DLQ".into()), None).await?;
    println!("dead-lettered messages: {}", dead.len());
    for message in &dead {
        println!("  {:?} properties: {:?}", message.body_text(), message.properties);
    }

    client.connection_closing().await?;
    Ok(())
}
