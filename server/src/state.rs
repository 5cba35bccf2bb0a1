use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chat::broadcast::BroadcastTransport;
use crate::chat::presence::PresenceStore;
use crate::ws::actor::KeepAlive;
use crate::ws::SessionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
///
/// One instance per process. Every session and the subscriber loop receive
/// the same components through it.
#[derive(Clone)]
pub struct AppState {
    /// Sessions hosted by this instance
    pub registry: SessionRegistry,
    /// Cluster-wide set of active usernames
    pub presence: Arc<dyn PresenceStore>,
    /// Pub/sub channel shared by all instances
    pub transport: Arc<dyn BroadcastTransport>,
    /// Cancelled when the process starts shutting down
    pub shutdown: CancellationToken,
    /// Admissions in progress; shutdown waits for them before draining
    pub admissions: TaskTracker,
    /// Ping schedule for every connection
    pub keepalive: KeepAlive,
}

impl AppState {
    pub fn new(presence: Arc<dyn PresenceStore>, transport: Arc<dyn BroadcastTransport>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            presence,
            transport,
            shutdown: CancellationToken::new(),
            admissions: TaskTracker::new(),
            keepalive: KeepAlive::default(),
        }
    }

    pub fn with_keepalive(mut self, keepalive: KeepAlive) -> Self {
        self.keepalive = keepalive;
        self
    }
}
