pub mod authorizer;
pub mod cache;
pub mod events;
pub mod handler;
pub mod models;
pub mod notifier;
pub mod presence;

pub use handler::{ChatProtocolHandler, ChatSettings, DenialPolicy, Session};
