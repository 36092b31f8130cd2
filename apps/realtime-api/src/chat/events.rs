//! Chat opcodes, event payloads, and wire-format messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_SUBSCRIBE: u8 = 3;
pub const OP_UNSUBSCRIBE: u8 = 4;
pub const OP_MESSAGE_SEND: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_REACTION_SEND: u8 = 7;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct ChatFrame {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl ChatFrame {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub principal_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

#[derive(Debug, Deserialize)]
pub struct SubscribePayload {
    pub chat_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageSendPayload {
    pub chat_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionSendPayload {
    pub chat_id: String,
    pub message_id: i64,
    pub emoji: String,
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const CHAT_SUBSCRIBED: &'static str = "CHAT_SUBSCRIBED";
    pub const CHAT_UNSUBSCRIBED: &'static str = "CHAT_UNSUBSCRIBED";
    pub const CHAT_MESSAGE: &'static str = "CHAT_MESSAGE";
    pub const CHAT_REACTION: &'static str = "CHAT_REACTION";
    pub const SEND_REJECTED: &'static str = "SEND_REJECTED";
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// A payload kind flowing through the pipeline. Messages and reactions share
/// one generic pipeline; the constants carry the per-kind wiring (dispatch
/// name on the wire, kind label in logs).
pub trait EventPayload: Clone + Send + Sync + Serialize + 'static {
    /// Kind label used in logs and metrics fields.
    const KIND: &'static str;
    /// Dispatch event name delivered to subscribers.
    const DISPATCH: &'static str;
}

/// A chat message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
}

impl EventPayload for MessagePayload {
    const KIND: &'static str = "message";
    const DISPATCH: &'static str = EventName::CHAT_MESSAGE;
}

/// An emoji reaction to an existing message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: i64,
    pub emoji: String,
}

impl EventPayload for ReactionPayload {
    const KIND: &'static str = "reaction";
    const DISPATCH: &'static str = EventName::CHAT_REACTION;
}

/// An event accepted into the pipeline. Immutable once queued; the
/// server-assigned snowflake `event_id` defines arrival order within a chat.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<P> {
    pub event_id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub sent_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: P,
}

/// An event handed to a delivery session's outbound channel. Shared between
/// all recipients of one fan-out cycle; each session serializes its own frame
/// so it can stamp a per-session sequence number.
#[derive(Debug)]
pub struct OutboundEvent {
    pub event_name: &'static str,
    pub data: Value,
}
