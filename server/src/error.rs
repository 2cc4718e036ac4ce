use thiserror::Error;

use crate::store::StoreError;

/// Failure of a single chat operation on an authenticated connection.
/// Handshake failures are `AuthError` and close the socket instead.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    Authorization {
        user_id: String,
        conversation_id: String,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Code carried by the `error` event sent to the client.
    pub fn code(&self) -> u16 {
        match self {
            Self::Authorization { .. } => 403,
            Self::NotFound(_) => 404,
            Self::InvalidRequest(_) => 400,
            Self::Store(_) => 500,
        }
    }

    /// Denials are the outcomes a client could use to probe for data it may
    /// not see; whether they are reported is governed by `DenialPolicy`.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::Authorization { .. } | Self::NotFound(_) | Self::InvalidRequest(_)
        )
    }

    /// Message safe to show the client. Store details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Store(_) => "Internal server error".to_string(),
            Self::Authorization { .. } => "Not a participant of this conversation".to_string(),
            other => other.to_string(),
        }
    }
}
