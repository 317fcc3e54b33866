//! Core types shared by every layer of the engine
//!
//! Errors, station addressing and configuration live here; protocol and
//! networking code build on top of these.

pub mod error;
pub mod serde;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{EngineConfig, SessionConfig, StationAddress};

/// UDP port mandated by the KeContact protocol, used by stations and clients alike
pub const UDP_PORT: u16 = 7090;

/// Receive buffer size; station reports stay well below this
pub const MAX_DATAGRAM_SIZE: usize = 2048;
