use std::sync::Arc;

use crate::chat::ChatProtocolHandler;
use crate::store::ChatStore;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Protocol handler owning every live connection
    pub chat: Arc<ChatProtocolHandler>,
    /// Durable store, shared with the handler
    pub store: Arc<dyn ChatStore>,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Arc<Vec<u8>>,
}
