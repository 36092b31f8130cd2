//! Pipeline error taxonomy.
//!
//! Failures local to one session (bad payload, denied capability) never show
//! up here — they are logged and reported only to that session. These types
//! cover the shared infrastructure: registry, durable store, capability
//! service, and the bounded queues.

use std::fmt;

/// Failure of a subscription-registry operation. The registry only fails when
/// its backing storage is unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    Unavailable(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Unavailable(detail) => {
                write!(f, "subscription registry unavailable: {detail}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Failure of a durable-store batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(detail) => write!(f, "durable store unavailable: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Failure of a capability-gate lookup. A lookup failure is treated as a
/// denial by callers; it never aborts the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    Unavailable(String),
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityError::Unavailable(detail) => {
                write!(f, "capability service unavailable: {detail}")
            }
        }
    }
}

impl std::error::Error for CapabilityError {}

/// Rejection of a distribution-queue enqueue. Surfaced to the producer so it
/// can apply its per-kind policy (retry for messages, drop for reactions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    QueueFull,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::QueueFull => write!(f, "distribution queue full"),
        }
    }
}

impl std::error::Error for EnqueueError {}
