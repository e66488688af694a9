//! Macro-Pad Wire Protocol
//!
//! Versioned, length-prefixed framing and the message set exchanged with
//! client devices.

pub mod codec;
pub mod constants;
pub mod types;

pub use codec::{FrameReader, FrameWriter};
pub use constants::*;
pub use types::*;
