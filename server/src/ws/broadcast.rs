//! Room-scoped fan-out for connected WebSocket clients.
//!
//! The hub owns every connection's outbound sender, a room → subscribers
//! index, and the reverse connection → rooms index used to tear down all of
//! a connection's subscriptions at once. Delivery is fire-and-forget over
//! unbounded channels: no acknowledgment, no backpressure.

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use std::collections::HashSet;

use super::{ConnectionId, ConnectionSender};
use crate::chat::events::ServerEvent;

#[derive(Debug, Default)]
pub struct RoomHub {
    senders: DashMap<ConnectionId, ConnectionSender>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
    memberships: DashMap<ConnectionId, HashSet<String>>,
}

/// Serialize a server event into a text frame.
fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::warn!(event = event.name(), error = %e, "Failed to serialize event");
            None
        }
    }
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a connection reachable through the hub.
    pub fn attach(&self, connection_id: &str, sender: ConnectionSender) {
        self.senders.insert(connection_id.to_string(), sender);
    }

    /// Drop a connection and every room subscription it holds.
    /// Returns the rooms it was subscribed to.
    pub fn detach(&self, connection_id: &str) -> Vec<String> {
        self.senders.remove(connection_id);
        let rooms = self
            .memberships
            .remove(connection_id)
            .map(|(_, rooms)| rooms)
            .unwrap_or_default();
        for room in &rooms {
            self.remove_subscriber(room, connection_id);
        }
        rooms.into_iter().collect()
    }

    pub fn is_attached(&self, connection_id: &str) -> bool {
        self.senders.contains_key(connection_id)
    }

    /// Subscribe a connection to a room. Unknown connections are ignored.
    pub fn join(&self, connection_id: &str, room: &str) -> bool {
        if !self.is_attached(connection_id) {
            return false;
        }
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
        self.memberships
            .entry(connection_id.to_string())
            .or_default()
            .insert(room.to_string());

        // `detach` may have run between the check and the inserts.
        if !self.is_attached(connection_id) {
            self.leave(connection_id, room);
            self.memberships
                .remove_if(connection_id, |_, rooms| rooms.is_empty());
            return false;
        }
        true
    }

    pub fn leave(&self, connection_id: &str, room: &str) {
        if let Some(mut rooms) = self.memberships.get_mut(connection_id) {
            rooms.remove(room);
        }
        self.remove_subscriber(room, connection_id);
    }

    fn remove_subscriber(&self, room: &str, connection_id: &str) {
        if let Some(mut subscribers) = self.rooms.get_mut(room) {
            subscribers.remove(connection_id);
        }
        self.rooms.remove_if(room, |_, subscribers| subscribers.is_empty());
    }

    pub fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        self.memberships
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribers(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send an event to one connection. Returns false if it is gone.
    pub fn send_to(&self, connection_id: &str, event: &ServerEvent) -> bool {
        let Some(msg) = encode(event) else {
            return false;
        };
        self.deliver(connection_id, msg)
    }

    fn deliver(&self, connection_id: &str, msg: Message) -> bool {
        match self.senders.get(connection_id) {
            Some(sender) => sender.send(msg).is_ok(),
            None => false,
        }
    }

    /// Publish an event to every current subscriber of a room.
    /// Returns the number of connections it was handed to.
    pub fn publish(&self, room: &str, event: &ServerEvent) -> usize {
        let subscribers = self.subscribers(room);
        if subscribers.is_empty() {
            return 0;
        }
        let Some(msg) = encode(event) else {
            return 0;
        };
        let delivered = subscribers
            .iter()
            .filter(|conn| self.deliver(conn, msg.clone()))
            .count();
        tracing::debug!(room = %room, event = event.name(), delivered, "Published to room");
        delivered
    }

    /// Send an event to every attached connection.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let Some(msg) = encode(event) else {
            return 0;
        };
        let mut delivered = 0;
        for entry in self.senders.iter() {
            if entry.value().send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Ask a connection's writer to send a Close frame and stop.
    pub fn close(&self, connection_id: &str, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        self.deliver(connection_id, Message::Close(Some(frame)));
    }

    pub fn connection_count(&self) -> usize {
        self.senders.len()
    }
}
