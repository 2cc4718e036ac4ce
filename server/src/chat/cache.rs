//! Short-lived read-through cache of conversation snapshots.
//!
//! Entries expire lazily: a read older than the TTL deletes the entry and
//! reports a miss. There is no size bound; cardinality is whatever the live
//! traffic touches within one TTL.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::chat::models::Conversation;

/// Default snapshot lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
struct CacheEntry {
    conversation: Conversation,
    written_at: Instant,
}

#[derive(Debug)]
pub struct ConversationCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ConversationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        {
            let entry = self.entries.get(conversation_id)?;
            if entry.written_at.elapsed() < self.ttl {
                return Some(entry.conversation.clone());
            }
        }
        // Re-check under the shard write lock: a concurrent `set` may have
        // refreshed the entry since the read above.
        self.entries
            .remove_if(conversation_id, |_, entry| entry.written_at.elapsed() >= self.ttl);
        None
    }

    pub fn set(&self, conversation_id: &str, conversation: Conversation) {
        self.entries.insert(
            conversation_id.to_string(),
            CacheEntry {
                conversation,
                written_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, conversation_id: &str) {
        self.entries.remove(conversation_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
