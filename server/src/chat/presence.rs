//! Presence store: the cluster-wide set of usernames held by active sessions.
//!
//! Admission checks `exists` and then calls `add`. The two calls are not
//! atomic, so two instances admitting the same name at the same moment can
//! both succeed. That window is accepted; there is no distributed lock.

use async_trait::async_trait;
use dashmap::DashSet;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::chat::connection::{connect_manager, open_client};
use crate::config::Config;
use crate::error::ChatError;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Whether the username is held by an active session.
    async fn exists(&self, username: &str) -> Result<bool, ChatError>;

    /// Record the username as active. Idempotent.
    async fn add(&self, username: &str) -> Result<(), ChatError>;

    /// Forget the username. Idempotent; failures are logged, never returned.
    async fn remove(&self, username: &str);

    /// Release the client. Later calls fail with `StoreUnavailable`.
    async fn close(&self);
}

/// Redis set backed presence store, shared by every instance.
pub struct RedisPresenceStore {
    conn: Mutex<Option<ConnectionManager>>,
    key: String,
}

impl RedisPresenceStore {
    /// Connect and verify the connection. Called once at startup.
    pub async fn connect(config: &Config) -> Result<Self, ChatError> {
        let client =
            open_client(config).map_err(|e| ChatError::StoreUnavailable(e.to_string()))?;
        let conn = connect_manager(&client)
            .await
            .map_err(|e| ChatError::StoreUnavailable(e.to_string()))?;

        tracing::info!(key = %config.users_key, "Connected presence store to Redis");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            key: config.users_key.clone(),
        })
    }

    fn connection(&self) -> Result<ConnectionManager, ChatError> {
        self.conn
            .lock()
            .map_err(|_| ChatError::StoreUnavailable("connection lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| ChatError::StoreUnavailable("client closed".to_string()))
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn exists(&self, username: &str) -> Result<bool, ChatError> {
        let mut conn = self.connection()?;
        conn.sismember(&self.key, username)
            .await
            .map_err(|e| ChatError::StoreUnavailable(e.to_string()))
    }

    async fn add(&self, username: &str) -> Result<(), ChatError> {
        let mut conn = self.connection()?;
        conn.sadd::<_, _, ()>(&self.key, username)
            .await
            .map_err(|e| ChatError::StoreUnavailable(e.to_string()))
    }

    async fn remove(&self, username: &str) {
        let mut conn = match self.connection() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(username = %username, error = %e, "Failed to remove user");
                return;
            }
        };
        match conn.srem::<_, _, ()>(&self.key, username).await {
            Ok(()) => tracing::info!(username = %username, "Removed user from presence store"),
            Err(e) => tracing::warn!(username = %username, error = %e, "Failed to remove user"),
        }
    }

    async fn close(&self) {
        let taken = match self.conn.lock() {
            Ok(mut conn) => conn.take(),
            Err(_) => None,
        };
        if taken.is_some() {
            tracing::info!("Presence store client closed");
        }
    }
}

/// In-process presence store for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryPresenceStore {
    users: DashSet<String>,
    closed: AtomicBool,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains(username)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn check_open(&self) -> Result<(), ChatError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChatError::StoreUnavailable("client closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn exists(&self, username: &str) -> Result<bool, ChatError> {
        self.check_open()?;
        Ok(self.users.contains(username))
    }

    async fn add(&self, username: &str) -> Result<(), ChatError> {
        self.check_open()?;
        self.users.insert(username.to_string());
        Ok(())
    }

    async fn remove(&self, username: &str) {
        if let Err(e) = self.check_open() {
            tracing::warn!(username = %username, error = %e, "Failed to remove user");
            return;
        }
        self.users.remove(username);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
