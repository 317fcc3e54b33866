use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ProtocolPeer;
use crate::core::Result;
use crate::protocol::{
    Command, Failsafe, InfoReport, MeterReport, PlugState, PushUpdate, Report, SessionReport,
    StateReport, FIRST_SESSION_REPORT, LAST_SESSION_REPORT,
};

const ACK: &str = "TCH-OK :done";
const NAK: &str = "TCH-ERR";

/// Identity and electrical characteristics of an emulated station
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub product: String,
    pub serial: String,
    pub firmware: String,
    /// Hardware current limit in mA
    pub max_current_ma: u32,
    /// Phase voltage in V
    pub voltage: u32,
    /// Phases the vehicle draws from
    pub phases: u32,
    /// Silence after `ena 0`
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub quiet_period: Duration,
    /// Charging needs `start` first
    pub authorization: bool,
    /// Plug state at power-on
    pub plug: u8,
    /// Push a state update after every command that changes it
    pub push_updates: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            product: "KC-P30-EC240422-E00".to_string(),
            serial: "15017355".to_string(),
            firmware: "P30 v 3.10.16 (200623-091032)".to_string(),
            max_current_ma: 32_000,
            voltage: 230,
            phases: 3,
            quiet_period: Duration::from_secs(2),
            authorization: false,
            plug: PlugState::STATION | PlugState::LOCKED | PlugState::VEHICLE,
            push_updates: false,
        }
    }
}

/// Simulated KeContact station
///
/// Time only advances through the `now` handed to [`ProtocolPeer::respond`];
/// the meter moves one simulated second per handled request while charging.
#[derive(Debug)]
pub struct EmulatedStation {
    profile: DeviceProfile,
    boot: Option<Instant>,
    enabled: bool,
    authorized: bool,
    rfid_tag: String,
    rfid_class: String,
    plug: u8,
    user_current_ma: u32,
    timer: Option<(u32, Instant)>,
    energy_limit: u64,
    /// Energy of the latest session in Ws
    energy_ws: f64,
    /// Lifetime energy in Ws
    total_ws: f64,
    output: u8,
    x2_source: u8,
    x2: bool,
    failsafe: Failsafe,
    last_control: Option<Instant>,
    failsafe_tripped: bool,
    quiet_until: Option<Instant>,
    display: Option<String>,
    session: Option<SessionReport>,
    history: VecDeque<SessionReport>,
    next_session_id: u64,
}

impl EmulatedStation {
    pub fn new(profile: DeviceProfile) -> Self {
        EmulatedStation {
            user_current_ma: profile.max_current_ma,
            plug: profile.plug,
            profile,
            boot: None,
            enabled: true,
            authorized: false,
            rfid_tag: String::new(),
            rfid_class: String::new(),
            timer: None,
            energy_limit: 0,
            energy_ws: 0.0,
            total_ws: 0.0,
            output: 0,
            x2_source: 0,
            x2: true,
            failsafe: Failsafe::disabled(false),
            last_control: None,
            failsafe_tripped: false,
            quiet_until: None,
            display: None,
            session: None,
            history: VecDeque::new(),
            next_session_id: 1,
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Text last sent with `display`
    pub fn display_text(&self) -> Option<&str> {
        self.display.as_deref()
    }

    /// Connects or disconnects the vehicle
    pub fn set_plug(&mut self, plug: u8) {
        self.plug = plug;
    }

    fn uptime(&self, now: Instant) -> u64 {
        self.boot
            .map_or(0, |boot| now.saturating_duration_since(boot).as_secs())
    }

    fn present_energy(&self) -> u64 {
        (self.energy_ws / 360.0) as u64
    }

    fn total_energy(&self) -> u64 {
        (self.total_ws / 360.0) as u64
    }

    fn limit_reached(&self) -> bool {
        self.energy_limit > 0 && self.present_energy() >= self.energy_limit
    }

    fn authorization_pending(&self) -> bool {
        self.profile.authorization && !self.authorized
    }

    fn max_current(&self) -> u32 {
        let mut current = self.profile.max_current_ma.min(self.user_current_ma);
        if self.failsafe_tripped {
            current = current.min(self.failsafe.fallback_ma);
        }
        current
    }

    fn enable_sys(&self) -> bool {
        self.enabled && !self.authorization_pending() && !self.limit_reached()
    }

    fn charging_state(&self) -> u8 {
        let plug = PlugState(self.plug);
        if !plug.at_vehicle() || !self.enabled || self.authorization_pending() {
            1
        } else if self.max_current() == 0 || self.limit_reached() {
            2
        } else {
            3
        }
    }

    fn is_charging(&self) -> bool {
        self.charging_state() == 3
    }

    /// Applies everything due at `now`, then runs the meter for one second
    fn advance(&mut self, now: Instant) {
        let boot = *self.boot.get_or_insert(now);

        if let Some((milliamps, due)) = self.timer {
            if now >= due {
                debug!("Emulated timer current of {} mA applied", milliamps);
                self.user_current_ma = milliamps;
                self.timer = None;
            }
        }

        if self.failsafe.is_enabled() && !self.failsafe_tripped {
            let since = self.last_control.unwrap_or(boot);
            if now.saturating_duration_since(since)
                >= Duration::from_secs(u64::from(self.failsafe.timeout_secs))
            {
                debug!(
                    "Emulated failsafe tripped, falling back to {} mA",
                    self.failsafe.fallback_ma
                );
                self.failsafe_tripped = true;
            }
        }

        if self.is_charging() {
            self.open_session(now);
            let amps = f64::from(self.max_current()) / 1000.0;
            let watts = amps * f64::from(self.profile.voltage) * f64::from(self.profile.phases);
            self.energy_ws += watts;
            self.total_ws += watts;
        } else {
            self.close_session(now);
        }
    }

    fn open_session(&mut self, now: Instant) {
        if self.session.is_some() {
            return;
        }
        let sec = self.uptime(now);
        self.energy_ws = 0.0;
        self.session = Some(SessionReport {
            number: FIRST_SESSION_REPORT,
            session_id: self.next_session_id,
            curr_hw: self.profile.max_current_ma,
            e_start: self.total_energy(),
            started_secs: sec,
            rfid_tag: self.rfid_tag.clone(),
            rfid_class: self.rfid_class.clone(),
            serial: self.profile.serial.clone(),
            ..Default::default()
        });
        self.next_session_id += 1;
    }

    fn close_session(&mut self, now: Instant) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.e_pres = self.present_energy();
        session.ended_secs = self.uptime(now).max(session.started_secs + 1);
        session.reason = if self.enabled { 1 } else { 10 };
        self.history.push_front(session);
        self.history
            .truncate(usize::from(LAST_SESSION_REPORT - FIRST_SESSION_REPORT));
    }

    fn control(&mut self, now: Instant) {
        self.last_control = Some(now);
        self.failsafe_tripped = false;
    }

    fn execute(&mut self, command: Command, now: Instant) -> Vec<String> {
        match command {
            Command::Identify => vec![format!("\"Firmware\":\"{}\"", self.profile.firmware)],
            Command::Report(number) => self.report(number, now).into_iter().collect(),
            Command::Enable(on) => {
                self.control(now);
                self.enabled = on;
                if !on {
                    self.quiet_until = Some(now + self.profile.quiet_period);
                }
                self.acknowledge_change()
            }
            Command::SetCurrent { milliamps } => {
                self.control(now);
                self.user_current_ma = milliamps;
                self.timer = None;
                self.acknowledge_change()
            }
            Command::SetCurrentTimed {
                milliamps,
                delay_secs,
            } => {
                self.control(now);
                if delay_secs == 0 {
                    self.user_current_ma = milliamps;
                    self.timer = None;
                } else {
                    self.timer = Some((milliamps, now + Duration::from_secs(u64::from(delay_secs))));
                }
                self.acknowledge_change()
            }
            Command::SetEnergy { tenth_wh } => {
                self.control(now);
                self.energy_limit = tenth_wh;
                self.acknowledge_change()
            }
            Command::SetOutput(value) => {
                self.output = value;
                vec![ACK.to_string()]
            }
            Command::SetFailsafe(failsafe) => {
                self.control(now);
                self.failsafe = failsafe;
                vec![ACK.to_string()]
            }
            Command::Start(rfid) => {
                self.authorized = true;
                if let Some(rfid) = rfid {
                    self.rfid_tag = rfid.tag;
                    self.rfid_class = rfid.class;
                }
                self.acknowledge_change()
            }
            Command::Stop(_) => {
                self.authorized = false;
                self.acknowledge_change()
            }
            Command::Display { text, .. } => {
                self.display = Some(text);
                vec![ACK.to_string()]
            }
            Command::Unlock => {
                if self.enabled {
                    debug!("Emulated unlock refused while enabled");
                    return vec![NAK.to_string()];
                }
                self.plug &= !PlugState::LOCKED;
                vec![ACK.to_string()]
            }
            Command::X2Source(source) => {
                self.x2_source = source;
                vec![ACK.to_string()]
            }
            Command::X2(three_phases) => {
                if self.x2_source != 4 {
                    debug!("Emulated x2 refused, source is {}", self.x2_source);
                    return vec![NAK.to_string()];
                }
                self.x2 = three_phases;
                vec![ACK.to_string()]
            }
        }
    }

    fn acknowledge_change(&self) -> Vec<String> {
        let mut replies = vec![ACK.to_string()];
        if self.profile.push_updates {
            let update = PushUpdate {
                state: Some(self.charging_state()),
                enable_sys: Some(u8::from(self.enable_sys())),
                max_curr: Some(self.max_current()),
                ..Default::default()
            };
            match serde_json::to_string(&update) {
                Ok(json) => replies.push(json),
                Err(e) => warn!("Unable to encode push update: {}", e),
            }
        }
        replies
    }

    fn report(&self, number: u16, now: Instant) -> Option<String> {
        let sec = self.uptime(now);
        let serial = self.profile.serial.clone();

        let report = match number {
            1 => Report::Info(InfoReport {
                product: self.profile.product.clone(),
                serial,
                firmware: self.profile.firmware.clone(),
                sec,
                ..Default::default()
            }),
            2 => Report::State(StateReport {
                state: self.charging_state(),
                plug: self.plug,
                auth_on: u8::from(self.profile.authorization),
                auth_required: u8::from(self.authorization_pending()),
                enable_sys: u8::from(self.enable_sys()),
                enable_user: u8::from(self.enabled),
                max_curr: self.max_current(),
                max_curr_percent: self.max_current() * 1000 / self.profile.max_current_ma.max(1),
                curr_hw: self.profile.max_current_ma,
                curr_user: self.user_current_ma,
                curr_fs: self.failsafe.fallback_ma,
                tmo_fs: self.failsafe.timeout_secs,
                curr_timer: self.timer.map_or(0, |(milliamps, _)| milliamps),
                tmo_ct: self.timer.map_or(0, |(_, due)| {
                    due.saturating_duration_since(now).as_secs() as u32
                }),
                setenergy: self.energy_limit,
                output: u32::from(self.output),
                x2_source: self.x2_source,
                x2: u8::from(self.x2),
                serial,
                sec,
                ..Default::default()
            }),
            3 => {
                let charging = self.is_charging();
                let current = if charging { self.max_current() } else { 0 };
                let phase = |n: u32| if n <= self.profile.phases { current } else { 0 };
                let watts = f64::from(current) / 1000.0
                    * f64::from(self.profile.voltage)
                    * f64::from(self.profile.phases);
                Report::Meter(MeterReport {
                    u1: self.profile.voltage,
                    u2: self.profile.voltage,
                    u3: self.profile.voltage,
                    i1: phase(1),
                    i2: phase(2),
                    i3: phase(3),
                    p: (watts * 1000.0) as u64,
                    pf: if charging { 1000 } else { 0 },
                    e_pres: self.present_energy(),
                    e_total: self.total_energy(),
                    serial,
                    sec,
                })
            }
            FIRST_SESSION_REPORT..=LAST_SESSION_REPORT => {
                let index = usize::from(number - FIRST_SESSION_REPORT);
                let mut sessions = self.session.iter().chain(self.history.iter());
                let mut report = sessions.nth(index).cloned().unwrap_or_default();
                if report.ended_secs == 0 && report.session_id != 0 {
                    report.e_pres = self.present_energy();
                }
                report.number = number;
                report.serial = serial;
                report.sec = sec;
                Report::Session(report)
            }
            _ => return Some(NAK.to_string()),
        };

        match report.to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("Unable to encode emulated report {}: {}", number, e);
                None
            }
        }
    }
}

impl Default for EmulatedStation {
    fn default() -> Self {
        EmulatedStation::new(DeviceProfile::default())
    }
}

impl ProtocolPeer for EmulatedStation {
    fn respond(&mut self, request: &str, now: Instant) -> Vec<String> {
        if self.quiet_until.map_or(false, |until| now < until) {
            debug!("Emulated station busy disabling, ignoring {:?}", request);
            return Vec::new();
        }
        self.quiet_until = None;
        self.advance(now);

        let command: Result<Command> = request.trim().parse();
        match command {
            Ok(command) => self.execute(command, now),
            Err(e) => {
                debug!("Emulated station rejects {:?}: {}", request, e);
                vec![NAK.to_string()]
            }
        }
    }
}
