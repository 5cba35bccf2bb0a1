//! Broadcast transport: the pub/sub channel that carries chat messages
//! between every instance of the service, this one included.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::messages::ChatMessage;
use crate::chat::connection::{connect_manager, open_client};
use crate::config::Config;
use crate::error::ChatError;

const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Serialized messages received from the transport, in publish order.
/// Yields `None` once the transport is closed.
pub type Subscription = mpsc::UnboundedReceiver<String>;

#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Publish a message to every subscriber on every instance.
    async fn publish(&self, message: &ChatMessage) -> Result<(), ChatError>;

    /// Start receiving messages published from now on.
    async fn subscribe(&self) -> Result<Subscription, ChatError>;

    /// Unsubscribe, end every subscription and close the publish connection.
    async fn close(&self);
}

/// Publish and log on failure. A lost publish only costs that one message.
pub async fn publish_or_log(transport: &dyn BroadcastTransport, message: &ChatMessage) {
    if let Err(e) = transport.publish(message).await {
        tracing::warn!(
            author = %message.author(),
            error = %e,
            "Could not publish to channel"
        );
    }
}

fn encode(message: &ChatMessage) -> Result<String, ChatError> {
    message
        .encode()
        .map_err(|e| ChatError::TransportUnavailable(format!("encode failed: {}", e)))
}

/// Redis pub/sub backed transport.
pub struct RedisBroadcastTransport {
    client: Client,
    publisher: Mutex<Option<ConnectionManager>>,
    channel: String,
    cancel: CancellationToken,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisBroadcastTransport {
    /// Connect and verify the publish connection. Called once at startup.
    pub async fn connect(config: &Config) -> Result<Self, ChatError> {
        let client =
            open_client(config).map_err(|e| ChatError::TransportUnavailable(e.to_string()))?;
        let publisher = connect_manager(&client)
            .await
            .map_err(|e| ChatError::TransportUnavailable(e.to_string()))?;

        tracing::info!(channel = %config.channel, "Connected broadcast transport to Redis");

        Ok(Self {
            client,
            publisher: Mutex::new(Some(publisher)),
            channel: config.channel.clone(),
            cancel: CancellationToken::new(),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    fn publisher(&self) -> Result<ConnectionManager, ChatError> {
        self.publisher
            .lock()
            .map_err(|_| ChatError::TransportUnavailable("connection lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| ChatError::TransportUnavailable("client closed".to_string()))
    }
}

#[async_trait]
impl BroadcastTransport for RedisBroadcastTransport {
    async fn publish(&self, message: &ChatMessage) -> Result<(), ChatError> {
        let payload = encode(message)?;
        let mut conn = self.publisher()?;
        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(|e| ChatError::TransportUnavailable(e.to_string()))
    }

    async fn subscribe(&self) -> Result<Subscription, ChatError> {
        if self.cancel.is_cancelled() {
            return Err(ChatError::TransportUnavailable("client closed".to_string()));
        }

        let pubsub = open_subscription(&self.client, &self.channel)
            .await
            .map_err(|e| ChatError::TransportUnavailable(e.to_string()))?;

        tracing::info!(channel = %self.channel, "Subscribed to broadcast channel");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(forward_messages(
            self.client.clone(),
            pubsub,
            self.channel.clone(),
            tx,
            self.cancel.clone(),
        ));
        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.push(handle);
        }
        Ok(rx)
    }

    async fn close(&self) {
        self.cancel.cancel();

        let forwarders: Vec<JoinHandle<()>> = match self.forwarders.lock() {
            Ok(mut forwarders) => forwarders.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in forwarders {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Subscription task failed");
            }
        }

        let publisher = match self.publisher.lock() {
            Ok(mut publisher) => publisher.take(),
            Err(_) => None,
        };
        if publisher.is_some() {
            tracing::info!("Broadcast transport closed");
        }
    }
}

async fn open_subscription(client: &Client, channel: &str) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// How a stretch of forwarding on one pub/sub connection ended.
#[derive(Debug, PartialEq, Eq)]
enum Pump {
    Cancelled,
    ReceiverGone,
    ConnectionLost,
}

async fn pump(
    pubsub: &mut PubSub,
    tx: &mpsc::UnboundedSender<String>,
    cancel: &CancellationToken,
) -> Pump {
    let messages = pubsub.on_message();
    tokio::pin!(messages);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Pump::Cancelled,
            msg = messages.next() => match msg {
                Some(msg) => match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            return Pump::ReceiverGone;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping non-text payload");
                    }
                },
                None => return Pump::ConnectionLost,
            },
        }
    }
}

/// Delay before each resubscribe attempt: doubles from `initial` up to `max`.
#[derive(Debug)]
struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Owns one logical subscription and forwards payloads until the transport
/// is closed or every receiver is gone. A dropped connection is replaced by
/// a fresh one subscribed to the same channel; messages published while
/// disconnected are lost.
async fn forward_messages(
    client: Client,
    mut pubsub: PubSub,
    channel: String,
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    loop {
        match pump(&mut pubsub, &tx, &cancel).await {
            Pump::Cancelled | Pump::ReceiverGone => break,
            Pump::ConnectionLost => {
                tracing::warn!(
                    channel = %channel,
                    "Redis subscription connection lost, resubscribing"
                );
                match resubscribe(&client, &channel, &cancel).await {
                    Some(fresh) => pubsub = fresh,
                    None => return,
                }
            }
        }
    }

    match pubsub.unsubscribe(&channel).await {
        Ok(()) => tracing::info!(channel = %channel, "Unsubscribed from broadcast channel"),
        Err(e) => tracing::warn!(
            channel = %channel,
            error = %e,
            "Failed to unsubscribe redis channel subscription"
        ),
    }
}

/// Retry until a new subscription is open. None if the transport is closed
/// first.
async fn resubscribe(
    client: &Client,
    channel: &str,
    cancel: &CancellationToken,
) -> Option<PubSub> {
    let mut backoff = Backoff::new(RESUBSCRIBE_INITIAL_DELAY, RESUBSCRIBE_MAX_DELAY);
    loop {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match open_subscription(client, channel).await {
            Ok(pubsub) => {
                tracing::info!(channel = %channel, "Resubscribed to broadcast channel");
                return Some(pubsub);
            }
            Err(e) => tracing::warn!(
                channel = %channel,
                error = %e,
                retry_in_ms = backoff.next.as_millis() as u64,
                "Resubscribe failed"
            ),
        }
    }
}

/// In-process transport for single-instance deployments and tests.
pub struct MemoryBroadcastTransport {
    // None once closed.
    subscribers: Mutex<Option<Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryBroadcastTransport {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subscribers
            .lock()
            .map(|subs| subs.is_none())
            .unwrap_or(true)
    }
}

impl Default for MemoryBroadcastTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastTransport for MemoryBroadcastTransport {
    async fn publish(&self, message: &ChatMessage) -> Result<(), ChatError> {
        let payload = encode(message)?;
        let mut guard = self
            .subscribers
            .lock()
            .map_err(|_| ChatError::TransportUnavailable("lock poisoned".to_string()))?;
        let subscribers = guard
            .as_mut()
            .ok_or_else(|| ChatError::TransportUnavailable("client closed".to_string()))?;
        subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, ChatError> {
        let mut guard = self
            .subscribers
            .lock()
            .map_err(|_| ChatError::TransportUnavailable("lock poisoned".to_string()))?;
        let subscribers = guard
            .as_mut()
            .ok_or_else(|| ChatError::TransportUnavailable("client closed".to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        subscribers.push(tx);
        Ok(rx)
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.subscribers.lock() {
            // Dropping the senders ends every subscription.
            guard.take();
        }
    }
}
