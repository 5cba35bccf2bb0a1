//! Graceful shutdown of the chat engine.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::chat::session::retire;
use crate::state::AppState;

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Exit signalled");
}

/// Retire every session and close the shared clients, within `deadline`.
///
/// Order: refuse new connections, let admissions in progress finish, let
/// each session retire itself, retire whatever is left once the session wait
/// budget runs out, close the broadcast transport and wait for the
/// subscriber loop, then close the presence store.
pub async fn shutdown(state: &AppState, subscriber: Option<JoinHandle<()>>, deadline: Duration) {
    let started = Instant::now();
    state.shutdown.cancel();

    let active = state.registry.len();
    tracing::info!(sessions = active, "Shutting down chat sessions");

    // Sessions get most of the budget; the rest is for closing the clients.
    let session_budget = deadline.mul_f32(0.8);
    let drained = timeout(session_budget, async {
        // An admission either registers before this returns or sees the
        // cancelled token and backs out on its own.
        state.admissions.close();
        state.admissions.wait().await;
        state.registry.wait_until_empty().await;
    })
    .await;
    if drained.is_err() {
        let stuck = state.registry.snapshot();
        tracing::warn!(
            sessions = stuck.len(),
            "Sessions did not retire in time, retiring them directly"
        );
        for (username, handle) in stuck {
            retire(state, &username, &handle).await;
        }
    }
    tracing::info!("Cleaned up users and sessions");

    state.transport.close().await;
    if let Some(handle) = subscriber {
        let remaining = deadline.saturating_sub(started.elapsed());
        match timeout(remaining, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Subscriber task failed"),
            Err(_) => tracing::warn!("Subscriber did not stop before the deadline"),
        }
    }

    state.presence.close().await;
    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Chat engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::broadcast::{BroadcastTransport, MemoryBroadcastTransport};
    use crate::chat::messages::ChatMessage;
    use crate::chat::presence::{MemoryPresenceStore, PresenceStore};
    use crate::error::ChatError;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use crate::chat::session::ChatSession;
    use crate::chat::subscriber::spawn_subscriber;
    use axum::extract::ws::Message;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn closed(rx: &mut mpsc::UnboundedReceiver<Message>) -> bool {
        while let Ok(frame) = rx.try_recv() {
            if matches!(frame, Message::Close(_)) {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn test_shutdown_retires_stuck_sessions() {
        let presence = Arc::new(MemoryPresenceStore::new());
        let transport = Arc::new(MemoryBroadcastTransport::new());
        let state = AppState::new(presence.clone(), transport.clone());
        let mut published = transport.subscribe().await.unwrap();
        let subscriber = spawn_subscriber(transport.clone(), state.registry.clone())
            .await
            .unwrap();

        // No connection task runs for these sessions, so nothing reacts to the
        // shutdown signal and the sequence has to retire them itself.
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let mut alice = ChatSession::new("alice", alice_tx, state.clone());
        let mut bob = ChatSession::new("bob", bob_tx, state.clone());
        alice.admit().await.unwrap();
        bob.admit().await.unwrap();

        let deadline = Duration::from_millis(500);
        let started = Instant::now();
        shutdown(&state, Some(subscriber), deadline).await;
        assert!(started.elapsed() < deadline + Duration::from_millis(200));

        assert!(state.shutdown.is_cancelled());
        assert!(state.registry.is_empty());
        assert!(presence.is_empty());
        assert!(transport.is_closed());
        assert!(closed(&mut alice_rx));
        assert!(closed(&mut bob_rx));

        let mut left = Vec::new();
        while let Some(payload) = published.recv().await {
            if let ChatMessage::Left { author } = ChatMessage::decode(&payload).unwrap() {
                left.push(author);
            }
        }
        left.sort();
        assert_eq!(left, vec!["alice", "bob"]);

        // The sessions' own cleanup must not announce a second time.
        alice.disconnect().await;
        bob.disconnect().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_sessions_that_retire_themselves() {
        let presence = Arc::new(MemoryPresenceStore::new());
        let transport = Arc::new(MemoryBroadcastTransport::new());
        let state = AppState::new(presence.clone(), transport);

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut carol = ChatSession::new("carol", tx, state.clone());
        carol.admit().await.unwrap();

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            task_state.shutdown.cancelled().await;
            carol.disconnect().await;
        });

        shutdown(&state, None, Duration::from_secs(5)).await;
        task.await.unwrap();

        assert!(state.registry.is_empty());
        assert!(presence.is_empty());
    }

    /// Parks every `add` until released.
    struct SlowPresence {
        inner: MemoryPresenceStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PresenceStore for SlowPresence {
        async fn exists(&self, username: &str) -> Result<bool, ChatError> {
            self.inner.exists(username).await
        }

        async fn add(&self, username: &str) -> Result<(), ChatError> {
            self.inner.add(username).await?;
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn remove(&self, username: &str) {
            self.inner.remove(username).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_admission_in_progress() {
        let presence = Arc::new(SlowPresence {
            inner: MemoryPresenceStore::new(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let state = AppState::new(presence.clone(), Arc::new(MemoryBroadcastTransport::new()));

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut dave = ChatSession::new("dave", tx, state.clone());
        let admitting = tokio::spawn(async move { dave.admit().await });
        presence.entered.notified().await;

        let stopping = {
            let state = state.clone();
            tokio::spawn(async move { shutdown(&state, None, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());

        presence.release.notify_one();
        let admitted = admitting.await.unwrap();
        stopping.await.unwrap();

        assert!(matches!(admitted, Err(ChatError::ShuttingDown)));
        assert!(state.registry.is_empty());
        assert!(presence.inner.is_empty());
    }
}
