//! Media session coordinator for multi-party video calls.

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod room;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
mod testing;

pub use channel::MessageChannel;
pub use config::SessionConfig;
pub use connection::{ChannelState, ChannelStatus};
pub use error::{Error, Result};
pub use session::{Collaborators, Session, SessionStatus};
pub use transport::{Payload, WebSocketConnector};
