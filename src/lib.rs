//! KeContact: client engine for the KEBA KeContact UDP protocol
//!
//! Drives any number of charging stations over the single UDP port the
//! protocol mandates. Commands are paced and retried per station, inbound
//! reports are routed to the owning session, stations can be discovered by
//! broadcast, and an emulator plays the station side for tests.
pub mod core;
pub mod emulator;
pub mod engine;
pub mod network;
pub mod protocol;
pub mod station;
pub mod util;

// Re-export commonly used items
pub use crate::core::{EngineConfig, Error, Result, SessionConfig, StationAddress};
pub use crate::engine::{Engine, EngineEvent};
pub use crate::protocol::{Command, Report, StationInfo};
pub use crate::station::{Response, Station, StationSnapshot, StationState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
