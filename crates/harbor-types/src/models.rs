use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated principal attached to a request or a gateway
/// connection. Minted from access-token claims, never from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
}

/// A chat message as it travels over the wire and sits in the log.
/// `username` is `None` for server-authored system messages
/// ("X joined" / "X left"). Timestamps are Unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub text: String,
    pub system: bool,
    pub created_at: i64,
}

impl ChatMessage {
    pub fn user(room: &str, username: &str, text: String, client_id: Option<String>, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.to_string(),
            client_id,
            username: Some(username.to_string()),
            text,
            system: false,
            created_at: now_ms,
        }
    }

    pub fn system(room: &str, text: String, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.to_string(),
            client_id: None,
            username: None,
            text,
            system: true,
            created_at: now_ms,
        }
    }
}
