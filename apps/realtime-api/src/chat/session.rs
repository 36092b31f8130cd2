//! Per-connection delivery session state and the session → channel map.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::events::OutboundEvent;

/// Capacity of each session's outbound channel. Absorbs short bursts; a
/// session that stays backlogged past this bound is treated as dead.
pub const SESSION_SEND_BUFFER: usize = 64;

/// State for a single WebSocket connection.
///
/// Owned exclusively by the connection that created it. The registry and the
/// session map hold only its identifier and channel sender, never the session
/// itself.
pub struct DeliverySession {
    /// Unique session identifier (`ses_` prefixed ULID).
    pub session_id: String,
    /// Authenticated principal this connection belongs to.
    pub principal_id: String,
    /// Chats this session joined, mirroring the registry for fast teardown.
    rooms: Mutex<HashSet<String>>,
    /// Monotonically increasing sequence number for dispatch frames.
    seq: AtomicU64,
}

impl DeliverySession {
    pub fn new(session_id: String, principal_id: String) -> Self {
        Self {
            session_id,
            principal_id,
            rooms: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch frame.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a joined chat. Returns false if it was already present.
    pub fn join_room(&self, chat_id: &str) -> bool {
        self.rooms.lock().insert(chat_id.to_string())
    }

    /// Forget a joined chat.
    pub fn leave_room(&self, chat_id: &str) {
        self.rooms.lock().remove(chat_id);
    }

    /// Drain and return the local room set. Used during teardown.
    pub fn take_rooms(&self) -> HashSet<String> {
        std::mem::take(&mut *self.rooms.lock())
    }

    #[cfg(test)]
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }
}

/// Outcome of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The event was handed to the session's outbound channel.
    Delivered,
    /// The session's channel is full; it has stopped draining.
    Backlogged,
    /// The session's channel is closed or was never registered.
    Gone,
}

/// Shared map from session identifier to outbound delivery channel.
///
/// This is the transport seam the distributor uses: "send event E to session
/// S" without ever touching the session object.
pub struct SessionMap {
    channels: DashMap<String, mpsc::Sender<Arc<OutboundEvent>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Register a session's outbound channel. Called at connect time.
    pub fn insert(&self, session_id: &str, tx: mpsc::Sender<Arc<OutboundEvent>>) {
        self.channels.insert(session_id.to_string(), tx);
    }

    /// Remove a session's channel. Called on teardown and when the
    /// distributor declares a session dead.
    pub fn remove(&self, session_id: &str) {
        self.channels.remove(session_id);
    }

    /// Push an event to a session without blocking.
    pub fn try_deliver(&self, session_id: &str, event: Arc<OutboundEvent>) -> DeliveryOutcome {
        let Some(tx) = self.channels.get(session_id) else {
            return DeliveryOutcome::Gone;
        };
        match tx.try_send(event) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => DeliveryOutcome::Backlogged,
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Gone,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Arc<OutboundEvent> {
        Arc::new(OutboundEvent {
            event_name: "CHAT_MESSAGE",
            data: serde_json::json!({}),
        })
    }

    #[test]
    fn seq_is_monotonic_from_one() {
        let session = DeliverySession::new("ses_1".to_string(), "prn_a".to_string());
        assert_eq!(session.next_seq(), 1);
        assert_eq!(session.next_seq(), 2);
        assert_eq!(session.next_seq(), 3);
    }

    #[test]
    fn join_room_reports_first_join_only() {
        let session = DeliverySession::new("ses_1".to_string(), "prn_a".to_string());
        assert!(session.join_room("chat_1"));
        assert!(!session.join_room("chat_1"));
        session.leave_room("chat_1");
        assert!(session.join_room("chat_1"));
    }

    #[test]
    fn take_rooms_empties_the_set() {
        let session = DeliverySession::new("ses_1".to_string(), "prn_a".to_string());
        session.join_room("chat_1");
        session.join_room("chat_2");

        let rooms = session.take_rooms();
        assert_eq!(rooms.len(), 2);
        assert_eq!(session.room_count(), 0);
    }

    #[tokio::test]
    async fn deliver_to_unknown_session_is_gone() {
        let map = SessionMap::new();
        assert_eq!(map.try_deliver("ses_x", event()), DeliveryOutcome::Gone);
    }

    #[tokio::test]
    async fn deliver_to_full_channel_is_backlogged() {
        let map = SessionMap::new();
        let (tx, _rx) = mpsc::channel(1);
        map.insert("ses_1", tx);

        assert_eq!(map.try_deliver("ses_1", event()), DeliveryOutcome::Delivered);
        assert_eq!(map.try_deliver("ses_1", event()), DeliveryOutcome::Backlogged);
    }

    #[tokio::test]
    async fn deliver_to_closed_channel_is_gone() {
        let map = SessionMap::new();
        let (tx, rx) = mpsc::channel(1);
        map.insert("ses_1", tx);
        drop(rx);

        assert_eq!(map.try_deliver("ses_1", event()), DeliveryOutcome::Gone);
    }
}
