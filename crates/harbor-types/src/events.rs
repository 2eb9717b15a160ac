use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ChatMessage;

/// Commands sent FROM client TO server over the gateway WebSocket.
/// `room` may be omitted; the server falls back to the connection's current
/// room, then to "general".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Join a room (leaving the previous one, if any).
    JoinRoom { room: Option<String> },

    /// Send a chat message. `client_id` is echoed back in the delivery
    /// acknowledgment so the sender can reconcile its optimistic echo.
    SendMessage {
        room: Option<String>,
        text: String,
        client_id: Option<String>,
    },

    /// Advisory read marker: everything up to `read_up_to` has been seen.
    ReadUpTo {
        room: Option<String>,
        read_up_to: String,
    },

    /// Typing indicator on/off.
    Typing {
        room: Option<String>,
        is_typing: bool,
    },
}

/// Events sent FROM server TO client over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Recent messages for the room just joined, oldest first. Sent exactly
    /// once per join, before any live broadcast for that room.
    RoomHistory {
        room: String,
        messages: Vec<ChatMessage>,
    },

    /// Join confirmation, with the room's current member list.
    RoomJoined { room: String, users: Vec<String> },

    /// Full member list, broadcast after every membership change.
    RoomUsers { room: String, users: Vec<String> },

    /// A new message (chat or system) was appended to the room.
    MessageNew { message: ChatMessage },

    /// Sender-only acknowledgment that a message was persisted and fanned
    /// out; carries the client-supplied id back.
    MessageDelivered {
        client_id: Option<String>,
        message_id: Uuid,
    },

    /// Another member's read marker moved.
    MessageSeen {
        room: String,
        username: String,
        read_up_to: String,
    },

    /// Another member started or stopped typing.
    Typing {
        room: String,
        username: String,
        is_typing: bool,
    },

    /// Command-level failure; the connection stays open.
    Error { code: String, message: String },
}
