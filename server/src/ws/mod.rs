pub mod actor;
pub mod handler;

use axum::extract::ws::{CloseFrame, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};

use crate::error::ChatError;

/// Type alias for the sender half of a WebSocket connection's channel.
/// The connection's writer task owns the receiving half and forwards every
/// frame to the socket.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Outbound stream handle for one local session.
///
/// Clones share the same retirement flag, so whichever holder retires the
/// session first is the only one that performs the cleanup.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: ConnectionSender,
    retired: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(outbound: ConnectionSender) -> Self {
        Self {
            outbound,
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a text frame for the client.
    pub fn send_text(&self, text: &str) -> Result<(), ChatError> {
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| ChatError::StreamClosed)
    }

    /// Queue a close frame. The writer task stops after forwarding it.
    pub fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }

    /// Mark the session retired. Returns true only for the first caller.
    pub fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Whether both handles feed the same connection.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}

/// Process-local registry of sessions hosted by this instance, keyed by
/// username. Used by the subscriber loop for fan-out.
///
/// Every operation, iteration included, runs under one mutex.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    emptied: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        // The map holds no invariant a panicking holder could break halfway.
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session. An existing entry for the same username is kept and
    /// false is returned.
    pub fn register(&self, username: &str, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions();
        if sessions.contains_key(username) {
            return false;
        }
        sessions.insert(username.to_string(), handle);
        tracing::debug!(
            username = %username,
            sessions = sessions.len(),
            "Session registered"
        );
        true
    }

    /// Remove the entry for `username` if it belongs to `handle`. An entry
    /// registered by a later session under the same name is left alone.
    pub fn unregister(&self, username: &str, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions();
        let owned = sessions
            .get(username)
            .is_some_and(|current| current.same_session(handle));
        let removed = owned && sessions.remove(username).is_some();
        if removed {
            tracing::debug!(
                username = %username,
                sessions = sessions.len(),
                "Session unregistered"
            );
        }
        if sessions.is_empty() {
            self.inner.emptied.notify_waiters();
        }
        removed
    }

    /// Apply `deliver` to every session except `excluded`.
    ///
    /// A failing delivery is logged and does not stop the remaining ones.
    /// Returns the number of successful deliveries.
    pub fn for_each_except<F>(&self, excluded: &str, mut deliver: F) -> usize
    where
        F: FnMut(&str, &SessionHandle) -> Result<(), ChatError>,
    {
        let sessions = self.sessions();
        let mut delivered = 0;
        for (username, handle) in sessions.iter() {
            if username == excluded {
                continue;
            }
            match deliver(username, handle) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        username = %username,
                        error = %e,
                        "Fan-out delivery failed"
                    );
                }
            }
        }
        delivered
    }

    pub fn contains(&self, username: &str) -> bool {
        self.sessions().contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Sorted usernames of all local sessions.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions().keys().cloned().collect();
        names.sort();
        names
    }

    /// Copy of every entry, for work that must not hold the lock.
    pub fn snapshot(&self) -> Vec<(String, SessionHandle)> {
        self.sessions()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect()
    }

    /// Resolve once no session is registered.
    pub async fn wait_until_empty(&self) {
        loop {
            let emptied = self.inner.emptied.notified();
            tokio::pin!(emptied);
            // Register interest before checking, so an unregister between the
            // check and the await is not missed.
            emptied.as_mut().enable();
            if self.is_empty() {
                return;
            }
            emptied.await;
        }
    }
}
