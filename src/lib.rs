//! macropad-server
//!
//! Connection layer of a macro-pad server: accepts TCP clients, runs a
//! framed handshake and action protocol with each of them, and reports
//! everything through a `ServerListener`.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod management;
pub mod metrics;
pub mod protocol;
pub mod shutdown;

pub use config::Config;
pub use connection::{Acceptor, ConnectionRegistry};
pub use error::{ProtocolError, ServerError};
pub use events::{ChannelListener, ServerEvent, ServerListener};
pub use shutdown::ShutdownCoordinator;

/// Common error type for application plumbing
pub type Result<T> = anyhow::Result<T>;
