//! Error taxonomy for the session lifecycle and broadcast engine.

/// Errors raised by the presence store, the broadcast transport and the
/// session registry.
///
/// None of these is fatal to the process once it is serving; the caller
/// decides whether the affected session ends or the failure is only logged.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The presence store is unreachable or returned an error.
    #[error("presence store unavailable: {0}")]
    StoreUnavailable(String),

    /// The requested username is already held by an active session.
    #[error("username {0} is already taken")]
    NameTaken(String),

    /// Publishing to or subscribing on the broadcast transport failed.
    #[error("broadcast transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The peer's stream is gone. Expected at the end of every session.
    #[error("stream closed")]
    StreamClosed,

    /// The instance stopped admitting sessions.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Writing to one peer's outbound stream failed during fan-out.
    #[error("failed to deliver message to {0}")]
    DeliveryFailure(String),
}

impl ChatError {
    /// Whether the connecting client should be told to retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::TransportUnavailable(_) | Self::ShuttingDown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(ChatError::StoreUnavailable("down".into()).is_retryable());
        assert!(ChatError::TransportUnavailable("down".into()).is_retryable());
        assert!(ChatError::ShuttingDown.is_retryable());
        assert!(!ChatError::NameTaken("alice".into()).is_retryable());
        assert!(!ChatError::StreamClosed.is_retryable());
    }

    #[test]
    fn test_name_taken_mentions_name() {
        let err = ChatError::NameTaken("alice".into());
        assert!(err.to_string().contains("alice"));
    }
}
