//! Per-connection chat session: admission, message intake and retirement.
//!
//! A session moves `Admitting -> Active -> Closed` exactly once. It never
//! writes chat text to other sessions; everything it says goes out on the
//! broadcast transport and comes back through the subscriber loop.

use axum::extract::ws::close_code;

use crate::chat::broadcast::publish_or_log;
use crate::chat::messages::{name_taken_notice, welcome_notice, ChatMessage, RETRY_NOTICE};
use crate::error::ChatError;
use crate::state::AppState;
use crate::ws::{ConnectionSender, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Admitting,
    Active,
    Closed,
}

pub struct ChatSession {
    username: String,
    handle: SessionHandle,
    state: SessionState,
    app: AppState,
}

impl ChatSession {
    pub fn new(username: impl Into<String>, outbound: ConnectionSender, app: AppState) -> Self {
        Self {
            username: username.into(),
            handle: SessionHandle::new(outbound),
            state: SessionState::Admitting,
            app,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Admit the username. On failure the client is told why, its stream is
    /// closed and the session ends in `Closed` without having registered.
    pub async fn admit(&mut self) -> Result<(), ChatError> {
        if self.state != SessionState::Admitting {
            return Err(ChatError::StreamClosed);
        }

        // Shutdown waits for this token before draining the registry.
        let _admitting = self.app.admissions.token();

        match self.try_admit().await {
            Ok(()) => {
                self.state = SessionState::Active;
                tracing::info!(username = %self.username, "User joined");
                Ok(())
            }
            Err(err) => {
                let (notice, code) = match &err {
                    ChatError::NameTaken(name) => (name_taken_notice(name), close_code::POLICY),
                    _ => (RETRY_NOTICE.to_string(), close_code::AGAIN),
                };
                if err.is_retryable() {
                    tracing::warn!(
                        username = %self.username,
                        error = %err,
                        "Unable to determine whether user exists"
                    );
                } else {
                    tracing::info!(username = %self.username, error = %err, "Admission refused");
                }
                self.notify_peer(&notice);
                self.handle.close(code, "admission refused");
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    async fn try_admit(&self) -> Result<(), ChatError> {
        if self.app.shutdown.is_cancelled() {
            return Err(ChatError::ShuttingDown);
        }
        let presence = &self.app.presence;

        if presence.exists(&self.username).await? {
            return Err(ChatError::NameTaken(self.username.clone()));
        }
        presence.add(&self.username).await?;

        // Two local connections can pass the presence check together; the
        // registry decides which one keeps the name. The presence entry
        // belongs to the winner, so it stays.
        if !self
            .app
            .registry
            .register(&self.username, self.handle.clone())
        {
            return Err(ChatError::NameTaken(self.username.clone()));
        }

        // Shutdown may have drained the registry while this session was
        // between `add` and `register`; nothing would retire it afterwards.
        if self.app.shutdown.is_cancelled() {
            self.app.registry.unregister(&self.username, &self.handle);
            presence.remove(&self.username).await;
            return Err(ChatError::ShuttingDown);
        }

        self.notify_peer(&welcome_notice(&self.username));
        publish_or_log(&*self.app.transport, &ChatMessage::joined(&self.username)).await;
        Ok(())
    }

    /// Publish one inbound payload as a chat message from this session.
    pub async fn relay(&self, body: impl Into<String>) {
        if self.state != SessionState::Active {
            return;
        }
        publish_or_log(
            &*self.app.transport,
            &ChatMessage::text(&self.username, body),
        )
        .await;
    }

    /// Retire an active session. Safe to call more than once and safe to race
    /// with the shutdown sequence; the cleanup runs once.
    pub async fn disconnect(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        self.state = SessionState::Closed;
        retire(&self.app, &self.username, &self.handle).await;
    }

    fn notify_peer(&self, msg: &str) {
        if let Err(e) = self.handle.send_text(msg) {
            tracing::debug!(username = %self.username, error = %e, "Failed to write message");
        }
    }
}

/// Remove a session from every place it is recorded: the registry, the
/// presence store, the broadcast (`left` announcement) and its own stream.
///
/// The registry entry goes first. Once the presence entry is gone a new
/// session may claim the name, and it must not find this one still
/// registered.
///
/// Each step runs even if an earlier one failed. Returns false when another
/// caller already retired this session.
pub async fn retire(app: &AppState, username: &str, handle: &SessionHandle) -> bool {
    if !handle.retire() {
        return false;
    }

    app.registry.unregister(username, handle);
    app.presence.remove(username).await;
    publish_or_log(&*app.transport, &ChatMessage::left(username)).await;
    handle.close(close_code::NORMAL, "session closed");

    tracing::info!(username = %username, "User left");
    true
}
