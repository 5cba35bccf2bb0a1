//! Chat message envelope carried on the broadcast transport, and the
//! client-facing notices that never leave this instance.

use serde::{Deserialize, Serialize};

/// Envelope published on the broadcast transport.
///
/// Encoded as a single line of JSON so the author survives any characters in
/// the username or body, including the `": "` used by the rendered form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatMessage {
    Joined { author: String },
    Left { author: String },
    Text { author: String, body: String },
}

impl ChatMessage {
    pub fn joined(author: &str) -> Self {
        Self::Joined {
            author: author.to_string(),
        }
    }

    pub fn left(author: &str) -> Self {
        Self::Left {
            author: author.to_string(),
        }
    }

    pub fn text(author: &str, body: impl Into<String>) -> Self {
        Self::Text {
            author: author.to_string(),
            body: body.into(),
        }
    }

    pub fn author(&self) -> &str {
        match self {
            Self::Joined { author } | Self::Left { author } | Self::Text { author, .. } => author,
        }
    }

    /// Serialize for the transport.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a transport payload.
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// The text frame written to client streams during fan-out.
    pub fn render(&self) -> String {
        match self {
            Self::Joined { author } => format!("{}: has joined the chat!", author),
            Self::Left { author } => format!("{}: has left the chat!", author),
            Self::Text { author, body } => format!("{}: {}", author, body),
        }
    }
}

/// Sent to a newly admitted client.
pub fn welcome_notice(username: &str) -> String {
    format!("Welcome {}!", username)
}

/// Sent when the requested username is held by another session.
pub fn name_taken_notice(username: &str) -> String {
    format!(
        "username {} is already taken. please retry with a different name",
        username
    )
}

/// Sent when admission could not be completed.
pub const RETRY_NOTICE: &str = "failed to connect. please try again";
