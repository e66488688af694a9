//! Server Listener Boundary
//!
//! The narrow interface through which the connection layer reports
//! lifecycle and action events outward, plus a broadcast-channel
//! implementation for subscribers that only need to observe.

pub mod channel;
pub mod listener;
pub mod types;

pub use channel::ChannelListener;
pub use listener::ServerListener;
pub use types::{ServerEvent, TriggeredAction};
