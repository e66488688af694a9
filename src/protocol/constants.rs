//! Wire Protocol Constants

// Frame header
pub const FRAME_MAGIC: u16 = 0x4D50;
pub const PROTOCOL_VERSION: u8 = 0x01;
pub const FRAME_HEADER_LEN: usize = 8;

// Default payload limit
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

// Handshake
pub const MSG_HANDSHAKE: u8 = 0x01;
pub const MSG_HANDSHAKE_ACCEPTED: u8 = 0x02;
pub const MSG_HANDSHAKE_REJECTED: u8 = 0x03;

// Actions
pub const MSG_NORMAL_ACTION: u8 = 0x10;
pub const MSG_TOGGLE_ACTION: u8 = 0x11;
pub const MSG_ACTION_ACK: u8 = 0x12;
pub const MSG_TOGGLE_ACK: u8 = 0x13;

// Liveness
pub const MSG_KEEP_ALIVE: u8 = 0x20;

// Server pushes
pub const MSG_GRID_UPDATE: u8 = 0x30;
pub const MSG_TOGGLE_STATE: u8 = 0x31;

// Teardown
pub const MSG_DISCONNECT: u8 = 0x7F;
