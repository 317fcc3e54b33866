use std::net::SocketAddr;

use serde::Serialize;

use crate::core::StationAddress;
use crate::station::StationState;

/// Diagnostics published by the engine
///
/// Nothing here affects command outcomes; parse failures, stale reports and
/// unknown peers are absorbed by the engine and only surface on this channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineEvent {
    StationAdded(StationAddress),
    StationRemoved(StationAddress),
    StateChanged {
        address: StationAddress,
        from: StationState,
        to: StationState,
    },
    /// Datagram from an address without a session while auto setup is off
    UnknownPeer {
        source: SocketAddr,
        kind: &'static str,
    },
    ParseError {
        source: SocketAddr,
        raw: String,
        reason: String,
    },
    /// Report older than the stored one of the same number, dropped
    StaleReport {
        address: StationAddress,
        number: u16,
        uptime: u64,
        stored_uptime: u64,
    },
    /// A session's inbound queue was full and a datagram was dropped
    InboundOverflow(StationAddress),
}
