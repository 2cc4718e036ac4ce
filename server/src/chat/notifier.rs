//! Debounced delivery of `conversations_updated`.
//!
//! Conversation-changing events only record "user U should see a fresh list".
//! One process-wide timer collects everything queued inside the window; when
//! it fires, every queued user who is still connected gets their full
//! conversation list re-read from the store and pushed once.
//!
//! The window is shared by all users, so a burst from unrelated
//! conversations rides the same timer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::chat::events::ServerEvent;
use crate::chat::models::Conversation;
use crate::store::ChatStore;
use crate::ws::{ConnectionRegistry, RoomHub};

/// Default coalescing window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
enum FlushState {
    #[default]
    Idle,
    Scheduled(AbortHandle),
}

#[derive(Debug, Default)]
struct Pending {
    queue: HashMap<String, HashSet<String>>,
    state: FlushState,
}

impl Pending {
    /// Record a signal. Returns true when this call moves the state out of
    /// `Idle`, i.e. the caller must schedule the flush.
    fn enqueue(&mut self, user_id: &str, conversation_id: &str) -> bool {
        self.queue
            .entry(user_id.to_string())
            .or_default()
            .insert(conversation_id.to_string());
        matches!(self.state, FlushState::Idle)
    }

    /// Take everything queued so far and return to `Idle`.
    fn take(&mut self) -> HashMap<String, HashSet<String>> {
        self.state = FlushState::Idle;
        std::mem::take(&mut self.queue)
    }
}

pub struct NotificationDebouncer {
    pending: Mutex<Pending>,
    delay: Duration,
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    hub: Arc<RoomHub>,
}

impl NotificationDebouncer {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        hub: Arc<RoomHub>,
        delay: Duration,
    ) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            delay,
            store,
            registry,
            hub,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue_notification(self: &Arc<Self>, user_id: &str, conversation_id: &str) {
        let mut pending = self.lock();
        if !pending.enqueue(user_id, conversation_id) {
            return;
        }

        let this = Arc::clone(self);
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.flush().await;
        });
        pending.state = FlushState::Scheduled(task.abort_handle());
        tracing::trace!(delay_ms = delay.as_millis() as u64, "Notification flush scheduled");
    }

    pub fn notify_participants(self: &Arc<Self>, conversation: &Conversation) {
        for participant in conversation.participant_ids() {
            self.queue_notification(participant, &conversation.id);
        }
    }

    /// Deliver everything queued so far. Normally driven by the timer.
    pub async fn flush(&self) {
        let queue = self.lock().take();
        if queue.is_empty() {
            return;
        }

        let mut delivered = 0usize;
        for (user_id, conversation_ids) in queue {
            let Some(connection_id) = self.registry.lookup(&user_id) else {
                tracing::trace!(user_id = %user_id, "Skipping notification for offline user");
                continue;
            };
            match self.store.list_conversations(&user_id).await {
                Ok(conversations) => {
                    if self
                        .hub
                        .send_to(&connection_id, &ServerEvent::ConversationsUpdated(conversations))
                    {
                        delivered += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        changed = conversation_ids.len(),
                        error = %e,
                        "Failed to load conversations for notification"
                    );
                }
            }
        }
        tracing::debug!(delivered, "Flushed conversation notifications");
    }

    /// Cancel the scheduled flush and drop anything still queued.
    pub fn clear(&self) {
        let mut pending = self.lock();
        if let FlushState::Scheduled(handle) = std::mem::take(&mut pending.state) {
            handle.abort();
        }
        let dropped = pending.queue.len();
        pending.queue.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded pending notifications");
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.lock().state, FlushState::Scheduled(_))
    }

    pub fn pending_users(&self) -> usize {
        self.lock().queue.len()
    }
}
