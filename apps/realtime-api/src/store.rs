//! Durable-store seam for batched event persistence.
//!
//! The pipeline never talks SQL; it hands ordered batches to a
//! [`BatchWriter`] and interprets success or failure. Backed by the platform
//! database in production and an in-memory store in tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chat::events::{Envelope, EventPayload, MessagePayload, ReactionPayload};
use crate::error::StoreError;

/// Batched write of one event kind. One flush cycle calls this exactly once;
/// the batch is either fully persisted or reported failed as a unit.
#[async_trait]
pub trait BatchWriter<P: EventPayload>: Send + Sync {
    async fn write_batch(&self, batch: &[Envelope<P>]) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory event store for tests and single-instance development.
pub struct MemoryStore {
    messages: Mutex<Vec<Envelope<MessagePayload>>>,
    reactions: Mutex<Vec<Envelope<ReactionPayload>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of all persisted messages, in write order.
    pub fn messages(&self) -> Vec<Envelope<MessagePayload>> {
        self.messages.lock().clone()
    }

    /// Snapshot of all persisted reactions, in write order.
    pub fn reactions(&self) -> Vec<Envelope<ReactionPayload>> {
        self.reactions.lock().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchWriter<MessagePayload> for MemoryStore {
    async fn write_batch(&self, batch: &[Envelope<MessagePayload>]) -> Result<(), StoreError> {
        self.messages.lock().extend_from_slice(batch);
        Ok(())
    }
}

#[async_trait]
impl BatchWriter<ReactionPayload> for MemoryStore {
    async fn write_batch(&self, batch: &[Envelope<ReactionPayload>]) -> Result<(), StoreError> {
        self.reactions.lock().extend_from_slice(batch);
        Ok(())
    }
}
