//! Tests against a live Redis server. Run with
//! `CHAT_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chat_relay_server::chat::broadcast::{BroadcastTransport, RedisBroadcastTransport};
use chat_relay_server::chat::connection::{connect_manager, open_client};
use chat_relay_server::chat::messages::ChatMessage;
use chat_relay_server::chat::presence::{PresenceStore, RedisPresenceStore};
use chat_relay_server::config::Config;
use chat_relay_server::error::ChatError;

/// Config pointing at the test server, with a channel and key no other test
/// run shares. None when no server is configured.
fn redis_config() -> Option<Config> {
    let url = std::env::var("CHAT_TEST_REDIS_URL").ok()?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let suffix = format!("{}-{}", std::process::id(), nanos);
    Some(Config {
        redis_url: url,
        channel: format!("chat-test-{}", suffix),
        users_key: format!("chat-test-users-{}", suffix),
        ..Config::default()
    })
}

#[tokio::test]
#[ignore]
async fn test_redis_presence_store() {
    let Some(config) = redis_config() else {
        eprintln!("CHAT_TEST_REDIS_URL not set, skipping");
        return;
    };
    let store = RedisPresenceStore::connect(&config).await.unwrap();

    assert!(!store.exists("alice").await.unwrap());
    store.add("alice").await.unwrap();
    store.add("alice").await.unwrap();
    assert!(store.exists("alice").await.unwrap());

    store.remove("alice").await;
    store.remove("alice").await;
    assert!(!store.exists("alice").await.unwrap());

    store.close().await;
    assert!(matches!(
        store.exists("alice").await,
        Err(ChatError::StoreUnavailable(_))
    ));
}

#[tokio::test]
#[ignore]
async fn test_redis_broadcast_between_instances() {
    let Some(config) = redis_config() else {
        eprintln!("CHAT_TEST_REDIS_URL not set, skipping");
        return;
    };
    let first = RedisBroadcastTransport::connect(&config).await.unwrap();
    let second = RedisBroadcastTransport::connect(&config).await.unwrap();
    let mut first_sub = first.subscribe().await.unwrap();
    let mut second_sub = second.subscribe().await.unwrap();

    first.publish(&ChatMessage::text("alice", "hi")).await.unwrap();

    for sub in [&mut first_sub, &mut second_sub] {
        let payload = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("message within timeout")
            .expect("subscription open");
        assert_eq!(
            ChatMessage::decode(&payload).unwrap(),
            ChatMessage::text("alice", "hi")
        );
    }

    first.close().await;
    assert!(first_sub.recv().await.is_none());
    assert!(first.publish(&ChatMessage::left("alice")).await.is_err());
    second.close().await;
    assert!(second_sub.recv().await.is_none());
}

#[tokio::test]
#[ignore]
async fn test_redis_subscription_survives_dropped_connection() {
    let Some(config) = redis_config() else {
        eprintln!("CHAT_TEST_REDIS_URL not set, skipping");
        return;
    };
    let transport = RedisBroadcastTransport::connect(&config).await.unwrap();
    let mut sub = transport.subscribe().await.unwrap();

    // Drop every pub/sub connection on the server, ours included.
    let admin = open_client(&config).unwrap();
    let mut admin = connect_manager(&admin).await.unwrap();
    let killed: i64 = redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("pubsub")
        .query_async(&mut admin)
        .await
        .unwrap();
    assert!(killed >= 1);

    // Messages published before the resubscribe lands are lost, so keep
    // publishing until one arrives.
    let received = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            transport
                .publish(&ChatMessage::text("alice", "still there?"))
                .await
                .unwrap();
            match tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
                Ok(Some(payload)) => return payload,
                Ok(None) => panic!("subscription ended after connection loss"),
                Err(_) => continue,
            }
        }
    })
    .await
    .expect("resubscribed within timeout");
    assert_eq!(
        ChatMessage::decode(&received).unwrap(),
        ChatMessage::text("alice", "still there?")
    );

    transport.close().await;
    assert!(sub.recv().await.is_none());
}
