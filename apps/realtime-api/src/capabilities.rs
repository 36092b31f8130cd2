//! Capability gate consulted before any subscribe, unsubscribe, or publish.
//!
//! The real permission evaluation lives in an external service; this crate
//! only needs a yes/no answer for (principal, chat, action). Denials are
//! silent from every other client's perspective — the requester gets nothing
//! back beyond a debug log entry, so a denied probe cannot learn whether a
//! chat exists.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CapabilityError;

/// The action a principal is attempting against a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAction {
    /// Subscribe to (or unsubscribe from) the chat's live event stream.
    Subscribe,
    /// Publish a message or reaction into the chat.
    Send,
}

/// Abstraction over the permission-evaluation collaborator.
///
/// Backed by the external permission service in production and by
/// [`StaticCapabilities`] in tests and single-instance deployments.
#[async_trait]
pub trait ChatCapabilities: Send + Sync {
    async fn allows(
        &self,
        principal_id: &str,
        chat_id: &str,
        action: ChatAction,
    ) -> Result<bool, CapabilityError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Capability rules held in memory.
///
/// Chats are public by default: any authenticated principal may subscribe and
/// send. A chat registered as restricted only admits principals on its member
/// list (the chat's management mode, as this subsystem sees it).
pub struct StaticCapabilities {
    restricted: DashMap<String, HashSet<String>>,
}

impl StaticCapabilities {
    pub fn new() -> Self {
        Self {
            restricted: DashMap::new(),
        }
    }

    /// Mark a chat as restricted to the given principals.
    pub fn restrict(&self, chat_id: &str, members: impl IntoIterator<Item = String>) {
        self.restricted
            .insert(chat_id.to_string(), members.into_iter().collect());
    }
}

impl Default for StaticCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatCapabilities for StaticCapabilities {
    async fn allows(
        &self,
        principal_id: &str,
        chat_id: &str,
        _action: ChatAction,
    ) -> Result<bool, CapabilityError> {
        match self.restricted.get(chat_id) {
            Some(members) => Ok(members.contains(principal_id)),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn public_chat_allows_anyone() {
        let caps = StaticCapabilities::new();
        assert!(caps.allows("prn_a", "chat_1", ChatAction::Subscribe).await.unwrap());
        assert!(caps.allows("prn_b", "chat_1", ChatAction::Send).await.unwrap());
    }

    #[tokio::test]
    async fn restricted_chat_admits_only_members() {
        let caps = StaticCapabilities::new();
        caps.restrict("chat_1", vec!["prn_member".to_string()]);

        assert!(caps
            .allows("prn_member", "chat_1", ChatAction::Subscribe)
            .await
            .unwrap());
        assert!(!caps
            .allows("prn_outsider", "chat_1", ChatAction::Subscribe)
            .await
            .unwrap());
        assert!(!caps
            .allows("prn_outsider", "chat_1", ChatAction::Send)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn restriction_applies_per_chat() {
        let caps = StaticCapabilities::new();
        caps.restrict("chat_private", vec!["prn_member".to_string()]);

        // Other chats stay public.
        assert!(caps
            .allows("prn_outsider", "chat_public", ChatAction::Send)
            .await
            .unwrap());
    }
}
