//! Online-user list broadcast.
//!
//! Presence is held by the store (`is_online` / `last_seen`); every change
//! re-sends the full `users_online` list to every live connection.

use crate::chat::events::ServerEvent;
use crate::store::{ChatStore, StoreResult};
use crate::ws::RoomHub;

/// Read the online users from the store and push them to everyone.
/// Returns the number of connections the list was handed to.
pub async fn broadcast_online_users(store: &dyn ChatStore, hub: &RoomHub) -> StoreResult<usize> {
    let users = store
        .list_online_users()
        .await?
        .iter()
        .map(|u| u.summary())
        .collect::<Vec<_>>();
    let online = users.len();
    let delivered = hub.broadcast_all(&ServerEvent::UsersOnline(users));
    tracing::debug!(online, delivered, "Broadcast online users");
    Ok(delivered)
}
