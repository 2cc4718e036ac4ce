pub mod jwt;
pub mod login;

use async_trait::async_trait;
use thiserror::Error;

use crate::ws::{CLOSE_TOKEN_EXPIRED, CLOSE_TOKEN_INVALID, CLOSE_TOKEN_MISSING};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential supplied")]
    MissingCredential,
    #[error("credential expired")]
    Expired,
    #[error("invalid credential: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

impl AuthError {
    /// WebSocket close code reported to the client.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::MissingCredential => CLOSE_TOKEN_MISSING,
            Self::Expired => CLOSE_TOKEN_EXPIRED,
            Self::Invalid(_) => CLOSE_TOKEN_INVALID,
        }
    }

    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing token",
            Self::Expired => "token expired",
            Self::Invalid(_) => "invalid token",
        }
    }
}

/// Validates a bearer credential and yields the subject user id.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<String, AuthError>;
}
