//! Per-station sessions
//!
//! Every station gets one task that owns its command queue, timers and
//! stored reports. The rest of the engine talks to it through a [`Station`]
//! handle and an inbound queue fed by the dispatcher.

mod handle;
mod session;

pub use self::handle::Station;
pub(crate) use self::session::{Inbound, Session};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::core::StationAddress;
use crate::protocol::{
    Command, Failsafe, MeterReport, PushUpdate, Report, StateReport, StationInfo,
};
use crate::util::format_uptime;

/// Reports requested by a data poll: state, plus meter and history where the model has them
pub fn poll_reports(info: Option<&StationInfo>) -> Vec<u16> {
    let mut numbers = vec![2];
    if info.map_or(true, |info| info.meter_integrated) {
        numbers.push(3);
    }
    if info.map_or(true, |info| info.data_logger_integrated) {
        numbers.push(crate::protocol::FIRST_SESSION_REPORT);
    }
    numbers
}

/// Lifecycle of a station session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StationState {
    /// Created, no report received yet
    Unestablished,
    /// Reports arrive within the liveness window
    Active,
    /// No report within the liveness window
    Degraded,
    /// Removed; the handle no longer accepts commands
    TornDown,
}

impl fmt::Display for StationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StationState::Unestablished => "unestablished",
            StationState::Active => "active",
            StationState::Degraded => "degraded",
            StationState::TornDown => "torn down",
        };
        f.write_str(name)
    }
}

/// Successful outcome of a command
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `TCH-OK`
    Ack,
    /// The requested report
    Report(Report),
    /// Firmware text answering `i`
    Identity(String),
}

/// Subscriber callback, invoked from the session task after every update
pub type Callback = Arc<dyn Fn(&StationSnapshot) + Send + Sync>;

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct StationSnapshot {
    pub address: StationAddress,
    pub state: StationState,
    /// Latest accepted report per number
    pub reports: BTreeMap<u16, Report>,
    /// Fields pushed by the station since the session started
    pub pushed: PushUpdate,
    pub info: Option<StationInfo>,
    /// Failsafe last acknowledged by the station
    pub failsafe: Option<Failsafe>,
    pub queue_depth: usize,
    pub in_flight: Option<Command>,
    pub polling: bool,
    pub last_activity: Option<Instant>,
    /// Wall-clock time of the last report or push
    pub last_update: Option<DateTime<Utc>>,
}

impl StationSnapshot {
    pub(crate) fn new(address: StationAddress) -> Self {
        StationSnapshot {
            address,
            state: StationState::Unestablished,
            reports: BTreeMap::new(),
            pushed: PushUpdate::default(),
            info: None,
            failsafe: None,
            queue_depth: 0,
            in_flight: None,
            polling: false,
            last_activity: None,
            last_update: None,
        }
    }

    pub fn report(&self, number: u16) -> Option<&Report> {
        self.reports.get(&number)
    }

    /// Report 2, if received
    pub fn state_report(&self) -> Option<&StateReport> {
        match self.reports.get(&2) {
            Some(Report::State(report)) => Some(report),
            _ => None,
        }
    }

    /// Report 3, if received
    pub fn meter_report(&self) -> Option<&MeterReport> {
        match self.reports.get(&3) {
            Some(Report::Meter(report)) => Some(report),
            _ => None,
        }
    }

    /// Station uptime of the newest report, formatted
    pub fn uptime(&self) -> Option<String> {
        self.reports
            .values()
            .map(Report::uptime)
            .max()
            .map(format_uptime)
    }
}
