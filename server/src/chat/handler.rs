//! Connection lifecycle and event dispatch for the chat protocol.
//!
//! The handler is transport-agnostic: the WebSocket actor hands it a
//! credential and an outbound sender on connect, feeds it decoded
//! `ClientEvent`s in arrival order, and calls `disconnect` when the socket
//! goes away. Everything a client sees is pushed through the `RoomHub`.
//!
//! Every conversation-scoped event goes through the `ParticipantAuthorizer`
//! before the store is touched. Denials (not a participant, unknown
//! conversation or message, invalid request) are silent by default; with
//! `DenialPolicy::Explicit` the requester gets an `error` event. Store
//! failures always surface as `error {code: 500}` to the requester only.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AuthError, TokenVerifier};
use crate::chat::authorizer::ParticipantAuthorizer;
use crate::chat::cache::{ConversationCache, DEFAULT_CACHE_TTL};
use crate::chat::events::{
    ClientEvent, ConversationMessages, SendMessageRequest, ServerEvent, StartConversationRequest,
};
use crate::chat::notifier::{NotificationDebouncer, DEFAULT_DEBOUNCE};
use crate::chat::presence;
use crate::error::ChatError;
use crate::store::ChatStore;
use crate::ws::{ConnectionId, ConnectionRegistry, ConnectionSender, RoomHub, CLOSE_GOING_AWAY};

/// What the requester learns when an event is refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialPolicy {
    /// Drop the event without a reply.
    #[default]
    Silent,
    /// Reply with an `error` event carrying 403, 404 or 400.
    Explicit,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatSettings {
    pub cache_ttl: Duration,
    pub debounce: Duration,
    pub denials: DenialPolicy,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            debounce: DEFAULT_DEBOUNCE,
            denials: DenialPolicy::Silent,
        }
    }
}

/// An authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: String,
}

pub struct ChatProtocolHandler {
    store: Arc<dyn ChatStore>,
    verifier: Arc<dyn TokenVerifier>,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<ConversationCache>,
    authorizer: ParticipantAuthorizer,
    notifier: Arc<NotificationDebouncer>,
    hub: Arc<RoomHub>,
    denials: DenialPolicy,
}

impl ChatProtocolHandler {
    pub fn new(
        store: Arc<dyn ChatStore>,
        verifier: Arc<dyn TokenVerifier>,
        settings: ChatSettings,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Arc::new(RoomHub::new());
        let cache = Arc::new(ConversationCache::new(settings.cache_ttl));
        let authorizer = ParticipantAuthorizer::new(store.clone(), cache.clone());
        let notifier = Arc::new(NotificationDebouncer::new(
            store.clone(),
            registry.clone(),
            hub.clone(),
            settings.debounce,
        ));

        Self {
            store,
            verifier,
            registry,
            cache,
            authorizer,
            notifier,
            hub,
            denials: settings.denials,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    pub fn cache(&self) -> &ConversationCache {
        &self.cache
    }

    pub fn notifier(&self) -> &NotificationDebouncer {
        &self.notifier
    }

    // --- Lifecycle ---

    /// Authenticate a new connection and announce it.
    ///
    /// On failure nothing is registered and the caller is expected to close
    /// the socket with `AuthError::close_code`.
    pub async fn connect(
        &self,
        credential: Option<&str>,
        sender: ConnectionSender,
    ) -> Result<Session, AuthError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCredential)?;
        let user_id = self.verifier.verify(credential).await?;

        let session = Session {
            connection_id: Uuid::now_v7().to_string(),
            user_id,
        };
        self.hub.attach(&session.connection_id, sender);
        if let Some(previous) = self.registry.register(&session.user_id, &session.connection_id) {
            tracing::info!(
                user_id = %session.user_id,
                previous = %previous,
                "Session superseded by a new connection"
            );
        }

        tracing::info!(
            user_id = %session.user_id,
            connection_id = %session.connection_id,
            sessions = self.registry.len(),
            "User connected"
        );

        if let Err(e) = self.announce(&session).await {
            self.report(&session, "connect", e);
        }
        Ok(session)
    }

    async fn announce(&self, session: &Session) -> Result<(), ChatError> {
        self.store.set_online_status(&session.user_id, true).await?;
        presence::broadcast_online_users(self.store.as_ref(), &self.hub).await?;
        self.send_conversations(session).await
    }

    /// Tear down a connection. Presence only changes when this connection
    /// is still the user's registered session.
    pub async fn disconnect(&self, session: &Session) {
        let rooms = self.hub.detach(&session.connection_id);

        if !self
            .registry
            .unregister_connection(&session.user_id, &session.connection_id)
        {
            tracing::debug!(
                user_id = %session.user_id,
                connection_id = %session.connection_id,
                "Superseded connection closed, presence unchanged"
            );
            return;
        }

        if let Err(e) = self.store.set_online_status(&session.user_id, false).await {
            tracing::error!(user_id = %session.user_id, error = %e, "Failed to mark user offline");
        }

        // A reconnect may have registered and gone online while the offline
        // write was in flight. The live session wins.
        if self.registry.lookup(&session.user_id).is_some() {
            tracing::debug!(
                user_id = %session.user_id,
                "User reconnected during teardown, keeping presence"
            );
            if let Err(e) = self.store.set_online_status(&session.user_id, true).await {
                tracing::error!(user_id = %session.user_id, error = %e, "Failed to restore online status");
            }
            return;
        }

        if let Err(e) = presence::broadcast_online_users(self.store.as_ref(), &self.hub).await {
            tracing::error!(error = %e, "Failed to broadcast online users");
        }

        tracing::info!(
            user_id = %session.user_id,
            rooms = rooms.len(),
            "User disconnected"
        );
    }

    /// Stop pending work and ask every live connection to close.
    pub fn shutdown(&self) {
        self.notifier.clear();
        let sessions = self.registry.snapshot_all();
        for connection_id in sessions.values() {
            self.hub
                .close(connection_id, CLOSE_GOING_AWAY, "server shutting down");
        }
        self.cache.clear();
        tracing::info!(closed = sessions.len(), "Chat handler shut down");
    }

    // --- Dispatch ---

    /// Handle one client event to completion.
    pub async fn dispatch(&self, session: &Session, event: ClientEvent) {
        let name = event.name();
        tracing::debug!(user_id = %session.user_id, event = name, "Dispatching event");

        let result = match event {
            ClientEvent::SendMessage(req) => self.send_message(session, req).await,
            ClientEvent::JoinConversation(id) => self.join_conversation(session, &id).await,
            ClientEvent::LeaveConversation(id) => {
                self.leave_conversation(session, &id);
                Ok(())
            }
            ClientEvent::StartConversation(req) => self.start_conversation(session, req).await,
            ClientEvent::MarkAsRead(id) => self.mark_as_read(session, &id).await,
            ClientEvent::GetMessages(id) => self.get_messages(session, &id).await,
            ClientEvent::GetConversations => self.send_conversations(session).await,
            ClientEvent::GetAllMessages => self.get_all_messages(session).await,
        };

        if let Err(e) = result {
            self.report(session, name, e);
        }
    }

    fn report(&self, session: &Session, event: &str, err: ChatError) {
        if err.is_denial() {
            tracing::debug!(
                user_id = %session.user_id,
                event,
                error = %err,
                "Request denied"
            );
            if self.denials == DenialPolicy::Explicit {
                self.send_error(session, err.code(), err.client_message());
            }
            return;
        }

        tracing::error!(
            user_id = %session.user_id,
            event,
            error = %err,
            "Request failed"
        );
        self.send_error(session, err.code(), err.client_message());
    }

    pub fn send_error(&self, session: &Session, code: u16, message: impl Into<String>) {
        self.hub
            .send_to(&session.connection_id, &ServerEvent::error(code, message));
    }

    // --- Events ---

    pub async fn send_message(
        &self,
        session: &Session,
        req: SendMessageRequest,
    ) -> Result<(), ChatError> {
        let conversation = self
            .authorizer
            .verify_or_fail(&session.user_id, &req.conversation_id)
            .await?;
        if req.content.trim().is_empty() {
            return Err(ChatError::InvalidRequest("message content is empty".into()));
        }

        let created = self
            .store
            .create_message(&conversation.id, &session.user_id, &req.content)
            .await?;
        let message = self
            .store
            .find_message(&created.id)
            .await?
            .unwrap_or(created);

        let delivered = self
            .hub
            .publish(&conversation.id, &ServerEvent::NewMessage(message));
        tracing::debug!(
            conversation_id = %conversation.id,
            delivered,
            "Published new message"
        );

        self.cache.invalidate(&conversation.id);
        self.notifier.notify_participants(&conversation);
        Ok(())
    }

    pub async fn join_conversation(
        &self,
        session: &Session,
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        let conversation = self
            .authorizer
            .verify_or_fail(&session.user_id, conversation_id)
            .await?;
        self.hub.join(&session.connection_id, &conversation.id);
        self.hub
            .send_to(&session.connection_id, &ServerEvent::ConversationJoined(conversation));
        Ok(())
    }

    pub fn leave_conversation(&self, session: &Session, conversation_id: &str) {
        self.hub.leave(&session.connection_id, conversation_id);
    }

    pub async fn start_conversation(
        &self,
        session: &Session,
        req: StartConversationRequest,
    ) -> Result<(), ChatError> {
        let other = req.user_id;
        if other == session.user_id {
            return Err(ChatError::InvalidRequest(
                "cannot start a conversation with yourself".into(),
            ));
        }
        if self.store.find_user(&other).await?.is_none() {
            return Err(ChatError::NotFound(format!("user {}", other)));
        }

        let conversation = match self
            .store
            .find_pair_conversation(&session.user_id, &other)
            .await?
        {
            Some(existing) => existing,
            None => {
                let created = self
                    .store
                    .create_conversation(&session.user_id, &other)
                    .await?;
                tracing::info!(
                    conversation_id = %created.id,
                    initiator = %session.user_id,
                    other = %other,
                    "Conversation created"
                );
                created
            }
        };
        self.cache.set(&conversation.id, conversation.clone());

        let started = ServerEvent::ConversationStarted(conversation.clone());
        self.hub.join(&session.connection_id, &conversation.id);
        self.hub.send_to(&session.connection_id, &started);
        self.notifier
            .queue_notification(&session.user_id, &conversation.id);

        if let Some(other_connection) = self.registry.lookup(&other) {
            self.hub.join(&other_connection, &conversation.id);
            self.hub.send_to(&other_connection, &started);
            self.notifier.queue_notification(&other, &conversation.id);
        }
        Ok(())
    }

    pub async fn mark_as_read(&self, session: &Session, message_id: &str) -> Result<(), ChatError> {
        let message = self
            .store
            .find_message(message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        self.authorizer
            .verify_or_fail(&session.user_id, &message.conversation_id)
            .await?;

        self.store.mark_message_read(message_id).await?;
        self.cache.invalidate(&message.conversation_id);

        if let Some(conversation) = self.store.find_conversation(&message.conversation_id).await? {
            self.cache.set(&conversation.id, conversation.clone());
            self.notifier.notify_participants(&conversation);
        }
        Ok(())
    }

    pub async fn get_messages(
        &self,
        session: &Session,
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        let conversation = self
            .authorizer
            .verify_or_fail(&session.user_id, conversation_id)
            .await?;
        let messages = self.store.list_messages(&conversation.id).await?;
        self.hub.send_to(
            &session.connection_id,
            &ServerEvent::ConversationMessages(ConversationMessages {
                conversation_id: conversation.id,
                messages,
            }),
        );
        Ok(())
    }

    pub async fn send_conversations(&self, session: &Session) -> Result<(), ChatError> {
        let conversations = self.store.list_conversations(&session.user_id).await?;
        self.hub.send_to(
            &session.connection_id,
            &ServerEvent::ConversationsUpdated(conversations),
        );
        Ok(())
    }

    pub async fn get_all_messages(&self, session: &Session) -> Result<(), ChatError> {
        let conversations = self.store.list_conversations(&session.user_id).await?;
        let mut history = Vec::new();
        for conversation in &conversations {
            history.extend(self.store.list_messages(&conversation.id).await?);
        }
        self.hub
            .send_to(&session.connection_id, &ServerEvent::MessagesHistory(history));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::{issue_access_token, JwtVerifier};
    use crate::chat::models::User;
    use crate::db;
    use crate::store::SqliteStore;
    use crate::chat::models::{Conversation, ConversationSummary};
    use crate::store::StoreResult;
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use chrono::Utc;
    use tokio::sync::{mpsc, Notify};

    const SECRET: &[u8] = b"courier-test-secret-courier-test";
    const SETTLE: Duration = Duration::from_millis(150);

    struct Harness {
        handler: ChatProtocolHandler,
        store: SqliteStore,
    }

    struct Client {
        user: User,
        session: Session,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Client {
        fn events(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let Message::Text(text) = msg {
                    events.push(serde_json::from_str(text.as_str()).unwrap());
                }
            }
            events
        }

        fn last_conversations(&mut self) -> Vec<ConversationSummary> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::ConversationsUpdated(list) => Some(list),
                    _ => None,
                })
                .last()
                .expect("conversations_updated")
        }
    }

    fn harness(denials: DenialPolicy) -> Harness {
        harness_with(denials, Duration::from_millis(20))
    }

    fn harness_with(denials: DenialPolicy, debounce: Duration) -> Harness {
        let store = SqliteStore::new(db::init_in_memory().unwrap());
        let handler = ChatProtocolHandler::new(
            Arc::new(store.clone()),
            Arc::new(JwtVerifier::new(SECRET.to_vec())),
            ChatSettings {
                debounce,
                denials,
                ..ChatSettings::default()
            },
        );
        Harness { handler, store }
    }

    impl Harness {
        async fn client(&self, name: &str) -> Client {
            let user = match self.store.find_user_by_name(name).await.unwrap() {
                Some(user) => user,
                None => self.store.create_user(name, "hash").await.unwrap(),
            };
            let token = issue_access_token(SECRET, &user.id, &user.name).unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let session = self.handler.connect(Some(&token), tx).await.unwrap();
            Client { user, session, rx }
        }

        async fn start(&self, from: &Client, to: &Client) -> String {
            self.handler
                .dispatch(
                    &from.session,
                    ClientEvent::StartConversation(StartConversationRequest {
                        user_id: to.user.id.clone(),
                    }),
                )
                .await;
            self.store
                .find_pair_conversation(&from.user.id, &to.user.id)
                .await
                .unwrap()
                .expect("conversation")
                .id
        }

        async fn send(&self, from: &Client, conversation_id: &str, content: &str) {
            self.handler
                .dispatch(
                    &from.session,
                    ClientEvent::SendMessage(SendMessageRequest {
                        conversation_id: conversation_id.to_string(),
                        content: content.to_string(),
                        timestamp: Utc::now(),
                    }),
                )
                .await;
        }
    }

    #[tokio::test]
    async fn connect_announces_presence_and_conversation_list() {
        let h = harness(DenialPolicy::Silent);
        let mut alice = h.client("alice").await;

        let events = alice.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ServerEvent::UsersOnline(users) => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, alice.user.id);
                assert!(users[0].online);
            }
            other => panic!("expected users_online, got {:?}", other),
        }
        assert_eq!(events[1], ServerEvent::ConversationsUpdated(vec![]));

        let mut bob = h.client("bob").await;
        bob.events();
        let events = alice.events();
        assert!(matches!(&events[..], [ServerEvent::UsersOnline(users)] if users.len() == 2));
    }

    #[tokio::test]
    async fn rejected_credentials_register_nothing() {
        let h = harness(DenialPolicy::Silent);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = h.handler.connect(None, tx.clone()).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential));

        let err = h.handler.connect(Some("   "), tx.clone()).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential));

        let err = h.handler.connect(Some("not-a-token"), tx).await.unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));

        assert!(h.handler.registry().is_empty());
        assert_eq!(h.handler.hub().connection_count(), 0);
    }

    #[tokio::test]
    async fn two_user_conversation_flow() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let mut u2 = h.client("u2").await;
        u1.events();
        u2.events();

        let conversation_id = h.start(&u1, &u2).await;
        let initiator = u1.user.id.clone();
        for client in [&mut u1, &mut u2] {
            let started = client
                .events()
                .into_iter()
                .find(|e| matches!(e, ServerEvent::ConversationStarted(_)));
            match started {
                Some(ServerEvent::ConversationStarted(c)) => {
                    assert_eq!(c.id, conversation_id);
                    assert_eq!(c.participants.len(), 2);
                    assert_eq!(c.participants[0].id, initiator);
                }
                other => panic!("expected conversation_started, got {:?}", other),
            }
        }
        tokio::time::sleep(SETTLE).await;
        u1.events();
        u2.events();

        h.send(&u1, &conversation_id, "hi").await;
        for client in [&mut u1, &mut u2] {
            let events = client.events();
            match &events[..] {
                [ServerEvent::NewMessage(m)] => {
                    assert_eq!(m.content, "hi");
                    assert!(!m.is_read);
                    assert_eq!(m.sender.as_ref().map(|s| s.name.as_str()), Some("u1"));
                }
                other => panic!("expected one new_message, got {:?}", other),
            }
        }

        tokio::time::sleep(SETTLE).await;
        assert_eq!(u2.last_conversations()[0].unread_count, 1);
        assert_eq!(u1.last_conversations()[0].unread_count, 0);

        let message_id = h.store.list_messages(&conversation_id).await.unwrap()[0]
            .id
            .clone();
        h.handler
            .dispatch(&u2.session, ClientEvent::MarkAsRead(message_id))
            .await;

        tokio::time::sleep(SETTLE).await;
        let list = u2.last_conversations();
        assert_eq!(list[0].unread_count, 0);
        assert!(list[0].last_message.as_ref().unwrap().is_read);
        assert_eq!(u1.last_conversations().len(), 1);
    }

    #[tokio::test]
    async fn sender_marking_read_sees_zero_unread() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let u2 = h.client("u2").await;
        let conversation_id = h.start(&u1, &u2).await;
        h.send(&u1, &conversation_id, "hi").await;
        tokio::time::sleep(SETTLE).await;
        u1.events();

        let message_id = h.store.list_messages(&conversation_id).await.unwrap()[0]
            .id
            .clone();
        h.handler
            .dispatch(&u1.session, ClientEvent::MarkAsRead(message_id.clone()))
            .await;

        tokio::time::sleep(SETTLE).await;
        let list = u1.last_conversations();
        assert_eq!(list[0].id, conversation_id);
        assert_eq!(list[0].unread_count, 0);
        assert!(list[0].last_message.as_ref().unwrap().is_read);
        assert!(h.store.find_message(&message_id).await.unwrap().unwrap().is_read);
    }

    #[tokio::test]
    async fn rejoin_sends_snapshot_to_requester_only() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let mut u2 = h.client("u2").await;
        let conversation_id = h.start(&u1, &u2).await;
        h.handler
            .dispatch(&u2.session, ClientEvent::LeaveConversation(conversation_id.clone()))
            .await;
        tokio::time::sleep(SETTLE).await;
        u1.events();
        u2.events();
        assert!(!h
            .handler
            .hub()
            .subscribers(&conversation_id)
            .contains(&u2.session.connection_id));

        h.handler
            .dispatch(&u2.session, ClientEvent::JoinConversation(conversation_id.clone()))
            .await;

        match &u2.events()[..] {
            [ServerEvent::ConversationJoined(c)] => {
                assert_eq!(c.id, conversation_id);
                assert_eq!(c.participants.len(), 2);
            }
            other => panic!("expected one conversation_joined, got {:?}", other),
        }
        assert!(h
            .handler
            .hub()
            .subscribers(&conversation_id)
            .contains(&u2.session.connection_id));
        assert!(u1.events().is_empty());
    }

    #[tokio::test]
    async fn burst_of_messages_notifies_once_per_user() {
        let window = Duration::from_millis(300);
        let h = harness_with(DenialPolicy::Silent, window);
        let mut u1 = h.client("u1").await;
        let mut u2 = h.client("u2").await;
        let conversation_id = h.start(&u1, &u2).await;
        tokio::time::sleep(window * 2).await;
        u1.events();
        u2.events();

        for i in 0..5 {
            h.send(&u1, &conversation_id, &format!("m{}", i)).await;
        }
        tokio::time::sleep(window * 2).await;

        let updates = u2
            .events()
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ConversationsUpdated(_)))
            .count();
        assert_eq!(updates, 1);
    }

    #[tokio::test]
    async fn non_participant_send_is_dropped_silently() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let u2 = h.client("u2").await;
        let mut intruder = h.client("mallory").await;
        let conversation_id = h.start(&u1, &u2).await;
        tokio::time::sleep(SETTLE).await;
        u1.events();
        intruder.events();

        h.send(&intruder, &conversation_id, "let me in").await;
        h.handler
            .dispatch(
                &intruder.session,
                ClientEvent::JoinConversation(conversation_id.clone()),
            )
            .await;
        h.handler
            .dispatch(
                &intruder.session,
                ClientEvent::GetMessages(conversation_id.clone()),
            )
            .await;
        tokio::time::sleep(SETTLE).await;

        assert!(h.store.list_messages(&conversation_id).await.unwrap().is_empty());
        assert!(intruder.events().is_empty());
        assert!(u1.events().is_empty());
        assert!(h.handler.hub().rooms_of(&intruder.session.connection_id).is_empty());
    }

    #[tokio::test]
    async fn explicit_policy_reports_denials() {
        let h = harness(DenialPolicy::Explicit);
        let u1 = h.client("u1").await;
        let u2 = h.client("u2").await;
        let mut intruder = h.client("mallory").await;
        let conversation_id = h.start(&u1, &u2).await;
        intruder.events();

        h.send(&intruder, &conversation_id, "let me in").await;
        h.send(&intruder, "no-such-conversation", "hello").await;
        h.handler
            .dispatch(
                &intruder.session,
                ClientEvent::StartConversation(StartConversationRequest {
                    user_id: intruder.user.id.clone(),
                }),
            )
            .await;

        let codes: Vec<u16> = intruder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Error(payload) => Some(payload.code),
                _ => None,
            })
            .collect();
        assert_eq!(codes, vec![403, 404, 400]);
    }

    #[tokio::test]
    async fn store_failure_reaches_only_the_originator() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let mut u2 = h.client("u2").await;
        let conversation_id = h.start(&u1, &u2).await;
        h.handler
            .dispatch(&u2.session, ClientEvent::JoinConversation(conversation_id.clone()))
            .await;
        tokio::time::sleep(SETTLE).await;
        u1.events();
        u2.events();

        h.store
            .db()
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE messages")
            .unwrap();
        h.send(&u1, &conversation_id, "hi").await;

        match &u1.events()[..] {
            [ServerEvent::Error(payload)] => {
                assert_eq!(payload.code, 500);
                assert_eq!(payload.message, "Internal server error");
            }
            other => panic!("expected one error event, got {:?}", other),
        }
        tokio::time::sleep(SETTLE).await;
        assert!(u2.events().is_empty());
    }

    #[tokio::test]
    async fn start_conversation_is_idempotent_for_a_pair() {
        let h = harness(DenialPolicy::Silent);
        let u1 = h.client("u1").await;
        let u2 = h.client("u2").await;

        let first = h.start(&u1, &u2).await;
        let second = h.start(&u1, &u2).await;
        let third = h.start(&u2, &u1).await;
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(h.store.list_conversations(&u1.user.id).await.unwrap().len(), 1);
        assert!(h.handler.cache().get(&first).is_some());
    }

    #[tokio::test]
    async fn offline_peer_is_not_subscribed() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let offline = h.store.create_user("offline", "hash").await.unwrap();
        u1.events();

        h.handler
            .dispatch(
                &u1.session,
                ClientEvent::StartConversation(StartConversationRequest {
                    user_id: offline.id.clone(),
                }),
            )
            .await;

        let conversation = h
            .store
            .find_pair_conversation(&u1.user.id, &offline.id)
            .await
            .unwrap()
            .expect("conversation");
        assert_eq!(
            h.handler.hub().subscribers(&conversation.id),
            vec![u1.session.connection_id.clone()]
        );
    }

    #[tokio::test]
    async fn history_events_are_ordered() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let u2 = h.client("u2").await;
        let u3 = h.client("u3").await;
        let first = h.start(&u1, &u2).await;
        let second = h.start(&u1, &u3).await;
        h.send(&u1, &first, "one").await;
        h.send(&u1, &first, "two").await;
        h.send(&u1, &second, "three").await;
        tokio::time::sleep(SETTLE).await;
        u1.events();

        h.handler
            .dispatch(&u1.session, ClientEvent::GetMessages(first.clone()))
            .await;
        match &u1.events()[..] {
            [ServerEvent::ConversationMessages(cm)] => {
                assert_eq!(cm.conversation_id, first);
                let contents: Vec<_> = cm.messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["one", "two"]);
            }
            other => panic!("expected conversation_messages, got {:?}", other),
        }

        h.handler
            .dispatch(&u1.session, ClientEvent::GetAllMessages)
            .await;
        match &u1.events()[..] {
            [ServerEvent::MessagesHistory(all)] => assert_eq!(all.len(), 3),
            other => panic!("expected messages_history, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn leave_stops_room_delivery() {
        let h = harness(DenialPolicy::Silent);
        let u1 = h.client("u1").await;
        let mut u2 = h.client("u2").await;
        let conversation_id = h.start(&u1, &u2).await;
        tokio::time::sleep(SETTLE).await;

        h.handler
            .dispatch(&u2.session, ClientEvent::LeaveConversation(conversation_id.clone()))
            .await;
        u2.events();
        h.send(&u1, &conversation_id, "anyone?").await;

        assert!(!u2
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::NewMessage(_))));
    }

    #[tokio::test]
    async fn disconnect_marks_offline_and_rebroadcasts() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let u2 = h.client("u2").await;
        u1.events();

        h.handler.disconnect(&u2.session).await;

        match &u1.events()[..] {
            [ServerEvent::UsersOnline(users)] => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, u1.user.id);
            }
            other => panic!("expected users_online, got {:?}", other),
        }
        let stored = h.store.find_user(&u2.user.id).await.unwrap().unwrap();
        assert!(!stored.online);
        assert!(stored.last_seen.is_some());
        assert!(h.handler.registry().lookup(&u2.user.id).is_none());
    }

    #[tokio::test]
    async fn superseded_connection_does_not_evict_replacement() {
        let h = harness(DenialPolicy::Silent);
        let first = h.client("u1").await;
        let second = h.client("u1").await;
        assert_ne!(first.session.connection_id, second.session.connection_id);

        h.handler.disconnect(&first.session).await;

        assert_eq!(
            h.handler.registry().lookup(&second.user.id),
            Some(second.session.connection_id.clone())
        );
        assert!(h.store.find_user(&second.user.id).await.unwrap().unwrap().online);
    }

    /// Holds `set_online_status(false)` until released, so a reconnect can
    /// land while the old connection is still tearing down.
    struct OfflineGate {
        inner: SqliteStore,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ChatStore for OfflineGate {
        async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
            self.inner.find_user(user_id).await
        }
        async fn find_user_by_name(&self, name: &str) -> StoreResult<Option<User>> {
            self.inner.find_user_by_name(name).await
        }
        async fn create_user(&self, name: &str, password_hash: &str) -> StoreResult<User> {
            self.inner.create_user(name, password_hash).await
        }
        async fn find_users(&self, user_ids: &[String]) -> StoreResult<Vec<User>> {
            self.inner.find_users(user_ids).await
        }
        async fn list_online_users(&self) -> StoreResult<Vec<User>> {
            self.inner.list_online_users().await
        }
        async fn set_online_status(&self, user_id: &str, online: bool) -> StoreResult<()> {
            if !online {
                self.release.notified().await;
            }
            self.inner.set_online_status(user_id, online).await
        }
        async fn find_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
            self.inner.find_conversation(id).await
        }
        async fn find_pair_conversation(
            &self,
            user_a: &str,
            user_b: &str,
        ) -> StoreResult<Option<Conversation>> {
            self.inner.find_pair_conversation(user_a, user_b).await
        }
        async fn create_conversation(&self, initiator: &str, other: &str) -> StoreResult<Conversation> {
            self.inner.create_conversation(initiator, other).await
        }
        async fn list_conversations(&self, user_id: &str) -> StoreResult<Vec<ConversationSummary>> {
            self.inner.list_conversations(user_id).await
        }
        async fn create_message(
            &self,
            conversation_id: &str,
            sender_id: &str,
            content: &str,
        ) -> StoreResult<crate::chat::models::Message> {
            self.inner.create_message(conversation_id, sender_id, content).await
        }
        async fn find_message(&self, id: &str) -> StoreResult<Option<crate::chat::models::Message>> {
            self.inner.find_message(id).await
        }
        async fn mark_message_read(&self, id: &str) -> StoreResult<()> {
            self.inner.mark_message_read(id).await
        }
        async fn list_messages(&self, id: &str) -> StoreResult<Vec<crate::chat::models::Message>> {
            self.inner.list_messages(id).await
        }
    }

    #[tokio::test]
    async fn reconnect_during_teardown_keeps_user_online() {
        let inner = SqliteStore::new(db::init_in_memory().unwrap());
        let release = Arc::new(Notify::new());
        let handler = ChatProtocolHandler::new(
            Arc::new(OfflineGate {
                inner: inner.clone(),
                release: release.clone(),
            }),
            Arc::new(JwtVerifier::new(SECRET.to_vec())),
            ChatSettings::default(),
        );
        let user = inner.create_user("u1", "hash").await.unwrap();
        let token = issue_access_token(SECRET, &user.id, &user.name).unwrap();

        let (tx, _old_rx) = mpsc::unbounded_channel();
        let old = handler.connect(Some(&token), tx).await.unwrap();

        // The old connection's offline write stalls until the new one is live
        let (tx, mut new_rx) = mpsc::unbounded_channel();
        let ((), new) = tokio::join!(handler.disconnect(&old), async {
            let session = handler.connect(Some(&token), tx).await.unwrap();
            release.notify_one();
            session
        });

        assert_eq!(
            handler.registry().lookup(&user.id),
            Some(new.connection_id.clone())
        );
        assert!(inner.find_user(&user.id).await.unwrap().unwrap().online);
        while let Ok(msg) = new_rx.try_recv() {
            if let Message::Text(text) = msg {
                if let ServerEvent::UsersOnline(users) = serde_json::from_str(text.as_str()).unwrap() {
                    assert!(users.iter().any(|u| u.id == user.id), "saw {:?}", users);
                }
            }
        }
    }

    #[tokio::test]
    async fn shutdown_closes_live_connections() {
        let h = harness(DenialPolicy::Silent);
        let mut u1 = h.client("u1").await;
        let u2 = h.client("u2").await;
        h.start(&u1, &u2).await;
        while u1.rx.try_recv().is_ok() {}

        h.handler.shutdown();

        assert!(!h.handler.notifier().is_scheduled());
        assert!(h.handler.cache().is_empty());
        match u1.rx.try_recv() {
            Ok(Message::Close(Some(frame))) => assert_eq!(frame.code, CLOSE_GOING_AWAY),
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
