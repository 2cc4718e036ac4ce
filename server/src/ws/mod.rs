pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;
pub mod registry;

use tokio::sync::mpsc;

pub use broadcast::RoomHub;
pub use registry::ConnectionRegistry;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Server-assigned identity of one live WebSocket (UUIDv7 string).
pub type ConnectionId = String;

/// Close codes sent when the handshake credential is rejected.
pub const CLOSE_TOKEN_MISSING: u16 = 4000;
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
pub const CLOSE_TOKEN_INVALID: u16 = 4002;
/// Sent to every live connection on server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
