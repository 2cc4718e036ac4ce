//! JSON event frames carried over the WebSocket.
//!
//! Every frame is `{"event": "<name>", "data": <payload>}`; events without a
//! payload may omit `data`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::models::{Conversation, ConversationSummary, Message, UserSummary};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
    /// Client-side send time. Informational only; the stored timestamp is
    /// assigned by the server.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationRequest {
    pub user_id: String,
}

/// Events a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage(SendMessageRequest),
    JoinConversation(String),
    LeaveConversation(String),
    StartConversation(StartConversationRequest),
    MarkAsRead(String),
    GetMessages(String),
    GetConversations,
    GetAllMessages,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send_message",
            Self::JoinConversation(_) => "join_conversation",
            Self::LeaveConversation(_) => "leave_conversation",
            Self::StartConversation(_) => "start_conversation",
            Self::MarkAsRead(_) => "mark_as_read",
            Self::GetMessages(_) => "get_messages",
            Self::GetConversations => "get_conversations",
            Self::GetAllMessages => "get_all_messages",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessages {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// Events the server pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    UsersOnline(Vec<UserSummary>),
    ConversationsUpdated(Vec<ConversationSummary>),
    NewMessage(Message),
    ConversationStarted(Conversation),
    ConversationJoined(Conversation),
    ConversationMessages(ConversationMessages),
    MessagesHistory(Vec<Message>),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UsersOnline(_) => "users_online",
            Self::ConversationsUpdated(_) => "conversations_updated",
            Self::NewMessage(_) => "new_message",
            Self::ConversationStarted(_) => "conversation_started",
            Self::ConversationJoined(_) => "conversation_joined",
            Self::ConversationMessages(_) => "conversation_messages",
            Self::MessagesHistory(_) => "messages_history",
            Self::Error(_) => "error",
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }
}
