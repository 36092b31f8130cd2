//! Subscription registry: which delivery sessions are listening to which chats.
//!
//! The registry is the only state shared across all connection tasks. It
//! holds identifiers, never session objects, so the network layer keeps sole
//! ownership of each live connection. The trait is the seam for a remote
//! shared store; `MemoryRegistry` covers a single-instance deployment.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::RegistryError;

/// Retry budget for `drop_session`. A failed drop risks ghost subscriptions
/// that the distributor keeps trying to deliver to.
const DROP_SESSION_RETRIES: u32 = 3;
const DROP_SESSION_BACKOFF_MS: u64 = 100;

/// Durable, shared mapping between chats and subscribed delivery sessions.
///
/// Both indices (chat → sessions, session → chats) are kept in step by every
/// operation. Subscribe is idempotent; unsubscribe and drop are no-ops for
/// absent tuples. Safe under arbitrary interleaving: each tuple has a single
/// owning session, so last-write-wins per tuple is acceptable.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    /// Record `(chat, session, principal)`. Subscribing twice equals
    /// subscribing once.
    async fn subscribe(
        &self,
        chat_id: &str,
        session_id: &str,
        principal_id: &str,
    ) -> Result<(), RegistryError>;

    /// Remove the tuple from both indices. No-op if absent.
    async fn unsubscribe(&self, chat_id: &str, session_id: &str) -> Result<(), RegistryError>;

    /// All sessions currently subscribed to a chat. Called by the distributor
    /// on every fan-out cycle.
    async fn sessions_for(&self, chat_id: &str) -> Result<Vec<String>, RegistryError>;

    /// Remove a session from every chat it subscribed to. Invoked on
    /// disconnect, on every exit path.
    async fn drop_session(&self, session_id: &str) -> Result<(), RegistryError>;
}

/// Call `drop_session` with bounded backoff. Registry writes are otherwise
/// fire-and-forget, but a leaked session keeps receiving fan-out lookups, so
/// the drop is worth retrying before we give up and log the leak.
pub async fn drop_session_with_retry(registry: &dyn SubscriptionRegistry, session_id: &str) {
    let mut delay = Duration::from_millis(DROP_SESSION_BACKOFF_MS);
    for attempt in 1..=DROP_SESSION_RETRIES {
        match registry.drop_session(session_id).await {
            Ok(()) => return,
            Err(err) if attempt < DROP_SESSION_RETRIES => {
                tracing::warn!(%session_id, %err, attempt, "drop_session failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                tracing::error!(
                    %session_id,
                    %err,
                    "drop_session failed after retries; ghost subscriptions may remain"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// DashMap-backed registry for a single process instance.
///
/// `chats` maps chat → (session → principal); `sessions` maps session → chat
/// set for fast teardown. DashMap gives shard-level concurrency, which is all
/// the interleaving safety the contract asks for.
pub struct MemoryRegistry {
    chats: DashMap<String, HashMap<String, String>>,
    sessions: DashMap<String, HashSet<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            chats: DashMap::new(),
            sessions: DashMap::new(),
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionRegistry for MemoryRegistry {
    async fn subscribe(
        &self,
        chat_id: &str,
        session_id: &str,
        principal_id: &str,
    ) -> Result<(), RegistryError> {
        self.chats
            .entry(chat_id.to_string())
            .or_default()
            .insert(session_id.to_string(), principal_id.to_string());
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(chat_id.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, chat_id: &str, session_id: &str) -> Result<(), RegistryError> {
        if let Some(mut listeners) = self.chats.get_mut(chat_id) {
            listeners.remove(session_id);
        }
        if let Some(mut chats) = self.sessions.get_mut(session_id) {
            chats.remove(chat_id);
        }
        Ok(())
    }

    async fn sessions_for(&self, chat_id: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .chats
            .get(chat_id)
            .map(|listeners| listeners.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn drop_session(&self, session_id: &str) -> Result<(), RegistryError> {
        let chats = self
            .sessions
            .remove(session_id)
            .map(|(_, chats)| chats)
            .unwrap_or_default();
        for chat_id in chats {
            if let Some(mut listeners) = self.chats.get_mut(&chat_id) {
                listeners.remove(session_id);
            }
        }
        Ok(())
    }
}
