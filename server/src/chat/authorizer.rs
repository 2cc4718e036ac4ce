use std::sync::Arc;

use crate::chat::cache::ConversationCache;
use crate::chat::models::Conversation;
use crate::error::ChatError;
use crate::store::{ChatStore, StoreResult};

/// Authorization gate for conversation-scoped actions.
///
/// Reads through the conversation cache and falls back to the store on a
/// miss, re-caching what it finds. The miss path is not single-flight: two
/// concurrent lookups of the same cold conversation both hit the store.
pub struct ParticipantAuthorizer {
    store: Arc<dyn ChatStore>,
    cache: Arc<ConversationCache>,
}

impl ParticipantAuthorizer {
    pub fn new(store: Arc<dyn ChatStore>, cache: Arc<ConversationCache>) -> Self {
        Self { store, cache }
    }

    /// Conversation snapshot from the cache, or from the store on a miss.
    pub async fn resolve(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        if let Some(conversation) = self.cache.get(conversation_id) {
            return Ok(Some(conversation));
        }
        let conversation = self.store.find_conversation(conversation_id).await?;
        if let Some(conversation) = &conversation {
            self.cache.set(conversation_id, conversation.clone());
        }
        Ok(conversation)
    }

    pub async fn is_participant(&self, user_id: &str, conversation_id: &str) -> StoreResult<bool> {
        Ok(self
            .resolve(conversation_id)
            .await?
            .is_some_and(|c| c.has_participant(user_id)))
    }

    /// Like `is_participant`, but fails instead of returning false, handing
    /// back the snapshot on success.
    pub async fn verify_or_fail(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .resolve(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        if !conversation.has_participant(user_id) {
            return Err(ChatError::Authorization {
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(conversation)
    }
}
