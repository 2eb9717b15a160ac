//! Database row types — these map directly to SQLite rows.
//! Distinct from the harbor-types wire models to keep the DB layer
//! independent; ids stay strings until the gateway/API boundary.

use harbor_types::models::ChatMessage;
use tracing::warn;
use uuid::Uuid;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub pass_hash: String,
    pub created_at: i64,
}

pub struct RefreshTokenRow {
    pub token: String,
    pub user_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked_at: Option<i64>,
}

impl RefreshTokenRow {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at
    }

    /// Usable iff not revoked and not expired.
    pub fn is_usable(&self, now_ms: i64) -> bool {
        !self.is_revoked() && !self.is_expired(now_ms)
    }
}

pub struct PendingRegistrationRow {
    pub email: String,
    pub code_hash: String,
    pub expires_at: i64,
    pub username: String,
    pub pass_hash: String,
}

pub struct MessageRow {
    pub id: String,
    pub room: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub text: String,
    pub system: bool,
    pub created_at: i64,
}

impl MessageRow {
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            id: self.id.parse().unwrap_or_else(|e| {
                warn!("Corrupt message id '{}': {}", self.id, e);
                Uuid::default()
            }),
            room: self.room,
            client_id: self.client_id,
            username: self.username,
            text: self.text,
            system: self.system,
            created_at: self.created_at,
        }
    }
}
