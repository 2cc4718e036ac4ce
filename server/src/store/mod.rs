//! Durable store interface consumed by the chat core.
//!
//! The protocol handler, authorizer and debouncer only ever see
//! `Arc<dyn ChatStore>`; `SqliteStore` is the shipped implementation.

use async_trait::async_trait;
use thiserror::Error;

use crate::chat::models::{Conversation, ConversationSummary, Message, User};

pub mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("integrity error: {0}")]
    Integrity(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_name(&self, name: &str) -> StoreResult<Option<User>>;
    async fn create_user(&self, name: &str, password_hash: &str) -> StoreResult<User>;
    async fn find_users(&self, user_ids: &[String]) -> StoreResult<Vec<User>>;
    async fn list_online_users(&self) -> StoreResult<Vec<User>>;
    /// Going offline also records `last_seen`.
    async fn set_online_status(&self, user_id: &str, online: bool) -> StoreResult<()>;

    async fn find_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>>;
    /// Two-participant conversation for the unordered pair, if any.
    async fn find_pair_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> StoreResult<Option<Conversation>>;
    /// Creates the pair conversation, or returns the existing one when a
    /// concurrent caller won the race. `initiator` is listed first.
    async fn create_conversation(&self, initiator: &str, other: &str) -> StoreResult<Conversation>;
    /// Conversations the user takes part in, most recently updated first.
    async fn list_conversations(&self, user_id: &str) -> StoreResult<Vec<ConversationSummary>>;

    /// Persists an unread message and bumps the conversation's `updated_at`.
    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> StoreResult<Message>;
    /// Message with its sender attached.
    async fn find_message(&self, message_id: &str) -> StoreResult<Option<Message>>;
    async fn mark_message_read(&self, message_id: &str) -> StoreResult<()>;
    /// Messages with senders attached, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>>;
}
