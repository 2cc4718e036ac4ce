use crate::chat::events::ClientEvent;
use crate::chat::{ChatProtocolHandler, Session};

/// Handle an incoming text frame: decode one JSON event and dispatch it.
/// Frames that do not decode get an `error {code: 400}`; the connection
/// stays open.
pub async fn handle_text_message(text: &str, session: &Session, chat: &ChatProtocolHandler) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                user_id = %session.user_id,
                error = %e,
                "Failed to decode client event"
            );
            chat.send_error(session, 400, format!("Malformed event: {}", e));
            return;
        }
    };

    chat.dispatch(session, event).await;
}

/// The protocol is JSON text only.
pub fn handle_binary_message(data: &[u8], session: &Session, chat: &ChatProtocolHandler) {
    tracing::debug!(
        user_id = %session.user_id,
        len = data.len(),
        "Received binary frame (expected JSON text)"
    );
    chat.send_error(session, 400, "Binary frames are not supported");
}
