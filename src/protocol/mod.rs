//! KeContact protocol implementation
//!
//! Typed commands with their wire encoding, numbered reports, payload
//! classification and model detection. Everything here is free of I/O.

pub mod codec;
pub mod command;
pub mod info;
pub mod report;

pub use self::codec::{Payload, StationCodec};
pub use self::command::{Command, Completion, Failsafe, Rfid, DEFAULT_RFID_CLASS};
pub use self::info::{Service, StationInfo};
pub use self::report::{
    ChargingState, InfoReport, MeterReport, PlugState, PushUpdate, Report, SessionReport,
    StateReport,
};

/// Report numbers polled for charging session history start here
pub const FIRST_SESSION_REPORT: u16 = 100;

/// Last charging session history report
pub const LAST_SESSION_REPORT: u16 = 130;
