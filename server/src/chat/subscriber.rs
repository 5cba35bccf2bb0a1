//! The process-wide subscriber loop: the only path by which chat text
//! reaches a session's outbound stream.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::chat::broadcast::{BroadcastTransport, Subscription};
use crate::chat::messages::ChatMessage;
use crate::error::ChatError;
use crate::ws::SessionRegistry;

/// Subscribe to the transport and spawn the fan-out loop.
///
/// The subscription is established before this returns, so nothing
/// published afterwards is missed. The task ends when the transport closes.
pub async fn spawn_subscriber(
    transport: Arc<dyn BroadcastTransport>,
    registry: SessionRegistry,
) -> Result<JoinHandle<()>, ChatError> {
    tracing::info!("Starting subscriber");
    let subscription = transport.subscribe().await?;
    Ok(tokio::spawn(run_subscriber_loop(subscription, registry)))
}

/// Drain the subscription, fanning each message out to every local session
/// except its author.
pub async fn run_subscriber_loop(mut subscription: Subscription, registry: SessionRegistry) {
    while let Some(payload) = subscription.recv().await {
        match ChatMessage::decode(&payload) {
            Ok(message) => {
                fan_out(&registry, &message);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Dropping undecodable broadcast payload: {}",
                    payload.chars().take(100).collect::<String>()
                );
            }
        }
    }
    tracing::info!("Subscription ended, subscriber stopped");
}

/// Deliver one message to every local session except its author.
/// Returns the number of sessions it reached.
pub fn fan_out(registry: &SessionRegistry, message: &ChatMessage) -> usize {
    let text = message.render();
    let delivered = registry.for_each_except(message.author(), |username, handle| {
        handle
            .send_text(&text)
            .map_err(|_| ChatError::DeliveryFailure(username.to_string()))
    });
    tracing::debug!(author = %message.author(), delivered, "Fanned out message");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::broadcast::MemoryBroadcastTransport;
    use crate::ws::SessionHandle;
    use axum::extract::ws::Message;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn register(registry: &SessionRegistry, name: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(name, SessionHandle::new(tx));
        rx
    }

    async fn recv_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> String {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Message::Text(text))) => text.as_str().to_string(),
            other => panic!("Expected text frame, got: {:?}", other),
        }
    }

    #[test]
    fn test_fan_out_excludes_author() {
        let registry = SessionRegistry::new();
        let mut alice = register(&registry, "alice");
        let mut bob = register(&registry, "bob");

        let delivered = fan_out(&registry, &ChatMessage::text("alice", "hi"));

        assert_eq!(delivered, 1);
        assert!(alice.try_recv().is_err());
        match bob.try_recv() {
            Ok(Message::Text(text)) => assert_eq!(text.as_str(), "alice: hi"),
            other => panic!("Expected text frame, got: {:?}", other),
        }
    }

    #[test]
    fn test_fan_out_with_no_peers() {
        let registry = SessionRegistry::new();
        let _alice = register(&registry, "alice");
        assert_eq!(fan_out(&registry, &ChatMessage::joined("alice")), 0);
        assert_eq!(fan_out(&SessionRegistry::new(), &ChatMessage::joined("x")), 0);
    }

    #[tokio::test]
    async fn test_loop_survives_dead_peer_and_stops_on_close() {
        let transport: Arc<dyn BroadcastTransport> = Arc::new(MemoryBroadcastTransport::new());
        let registry = SessionRegistry::new();
        let dead = register(&registry, "dead");
        drop(dead);
        let mut bob = register(&registry, "bob");

        let handle = spawn_subscriber(transport.clone(), registry.clone())
            .await
            .unwrap();

        transport.publish(&ChatMessage::text("alice", "one")).await.unwrap();
        assert_eq!(recv_text(&mut bob).await, "alice: one");

        transport.publish(&ChatMessage::left("carol")).await.unwrap();
        assert_eq!(recv_text(&mut bob).await, "carol: has left the chat!");

        transport.close().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("subscriber should stop when the transport closes")
            .unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_skipped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new();
        let mut bob = register(&registry, "bob");

        let handle = tokio::spawn(run_subscriber_loop(rx, registry));
        tx.send("alice: legacy".to_string()).unwrap();
        tx.send(ChatMessage::text("alice", "json").encode().unwrap())
            .unwrap();

        assert_eq!(recv_text(&mut bob).await, "alice: json");

        drop(tx);
        handle.await.unwrap();
    }
}
