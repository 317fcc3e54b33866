use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{Error, Result};

/// Operating state reported in `State`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingState {
    Starting,
    NotReady,
    Ready,
    Charging,
    Error,
    AuthorizationRejected,
    Unknown(u8),
}

impl From<u8> for ChargingState {
    fn from(value: u8) -> Self {
        match value {
            0 => ChargingState::Starting,
            1 => ChargingState::NotReady,
            2 => ChargingState::Ready,
            3 => ChargingState::Charging,
            4 => ChargingState::Error,
            5 => ChargingState::AuthorizationRejected,
            other => ChargingState::Unknown(other),
        }
    }
}

impl fmt::Display for ChargingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargingState::Starting => f.write_str("starting"),
            ChargingState::NotReady => f.write_str("not ready for charging"),
            ChargingState::Ready => f.write_str("ready for charging"),
            ChargingState::Charging => f.write_str("charging"),
            ChargingState::Error => f.write_str("error"),
            ChargingState::AuthorizationRejected => f.write_str("authorization rejected"),
            ChargingState::Unknown(value) => write!(f, "undefined state {}", value),
        }
    }
}

/// Plug bit field: bit 0 cable at the station, bit 1 locked, bit 2 cable at the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlugState(pub u8);

impl PlugState {
    pub const STATION: u8 = 0b001;
    pub const LOCKED: u8 = 0b010;
    pub const VEHICLE: u8 = 0b100;

    pub fn at_station(&self) -> bool {
        self.0 & Self::STATION != 0
    }

    pub fn locked(&self) -> bool {
        self.0 & Self::LOCKED != 0
    }

    pub fn at_vehicle(&self) -> bool {
        self.0 & Self::VEHICLE != 0
    }
}

/// Report 1: product and firmware identification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoReport {
    #[serde(rename = "Product")]
    pub product: String,
    #[serde(rename = "Serial")]
    pub serial: String,
    #[serde(rename = "Firmware")]
    pub firmware: String,
    #[serde(rename = "COM-module")]
    pub com_module: u8,
    #[serde(rename = "Backend")]
    pub backend: u8,
    #[serde(rename = "Sec")]
    pub sec: u64,
}

/// Report 2: operating state, setpoints and failsafe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateReport {
    #[serde(rename = "State")]
    pub state: u8,
    #[serde(rename = "Error1")]
    pub error1: u32,
    #[serde(rename = "Error2")]
    pub error2: u32,
    #[serde(rename = "Plug")]
    pub plug: u8,
    #[serde(rename = "AuthON")]
    pub auth_on: u8,
    #[serde(rename = "Authreq")]
    pub auth_required: u8,
    #[serde(rename = "Enable sys")]
    pub enable_sys: u8,
    #[serde(rename = "Enable user")]
    pub enable_user: u8,
    /// mA
    #[serde(rename = "Max curr")]
    pub max_curr: u32,
    /// 0.1 %
    #[serde(rename = "Max curr %")]
    pub max_curr_percent: u32,
    /// mA, 0 when not reported
    #[serde(rename = "Curr HW")]
    pub curr_hw: u32,
    /// mA
    #[serde(rename = "Curr user")]
    pub curr_user: u32,
    /// mA
    #[serde(rename = "Curr FS")]
    pub curr_fs: u32,
    /// s
    #[serde(rename = "Tmo FS")]
    pub tmo_fs: u32,
    /// mA
    #[serde(rename = "Curr timer")]
    pub curr_timer: u32,
    /// s
    #[serde(rename = "Tmo CT")]
    pub tmo_ct: u32,
    /// 0.1 Wh
    #[serde(rename = "Setenergy")]
    pub setenergy: u64,
    #[serde(rename = "Output")]
    pub output: u32,
    #[serde(rename = "Input")]
    pub input: u32,
    #[serde(rename = "X2 phaseSwitch source")]
    pub x2_source: u8,
    #[serde(rename = "X2 phaseSwitch")]
    pub x2: u8,
    #[serde(rename = "Serial")]
    pub serial: String,
    #[serde(rename = "Sec")]
    pub sec: u64,
}

impl StateReport {
    pub fn charging_state(&self) -> ChargingState {
        ChargingState::from(self.state)
    }

    pub fn plug_state(&self) -> PlugState {
        PlugState(self.plug)
    }

    pub fn is_charging(&self) -> bool {
        self.charging_state() == ChargingState::Charging
    }

    pub fn enabled(&self) -> bool {
        self.enable_user != 0
    }

    pub fn authorization_required(&self) -> bool {
        self.auth_required == 1
    }

    pub fn max_current_amps(&self) -> f64 {
        f64::from(self.max_curr) / 1000.0
    }

    pub fn max_current_percent(&self) -> f64 {
        f64::from(self.max_curr_percent) / 10.0
    }

    /// Hardware limit in A; `None` when the station does not report it
    pub fn hardware_current_amps(&self) -> Option<f64> {
        (self.curr_hw != 0).then(|| f64::from(self.curr_hw) / 1000.0)
    }

    pub fn user_current_amps(&self) -> f64 {
        f64::from(self.curr_user) / 1000.0
    }

    pub fn failsafe_current_amps(&self) -> f64 {
        f64::from(self.curr_fs) / 1000.0
    }

    pub fn failsafe_enabled(&self) -> bool {
        self.tmo_fs > 0
    }

    pub fn timer_current_amps(&self) -> f64 {
        f64::from(self.curr_timer) / 1000.0
    }

    /// Energy limit in kWh, 0 when unlimited
    pub fn energy_limit_kwh(&self) -> f64 {
        self.setenergy as f64 / 10_000.0
    }
}

/// Report 3: meter readings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterReport {
    /// V
    #[serde(rename = "U1")]
    pub u1: u32,
    #[serde(rename = "U2")]
    pub u2: u32,
    #[serde(rename = "U3")]
    pub u3: u32,
    /// mA
    #[serde(rename = "I1")]
    pub i1: u32,
    #[serde(rename = "I2")]
    pub i2: u32,
    #[serde(rename = "I3")]
    pub i3: u32,
    /// mW
    #[serde(rename = "P")]
    pub p: u64,
    /// 0.1 %
    #[serde(rename = "PF")]
    pub pf: u32,
    /// 0.1 Wh, energy of the present session
    #[serde(rename = "E pres")]
    pub e_pres: u64,
    /// 0.1 Wh
    #[serde(rename = "E total")]
    pub e_total: u64,
    #[serde(rename = "Serial")]
    pub serial: String,
    #[serde(rename = "Sec")]
    pub sec: u64,
}

impl MeterReport {
    pub fn voltages(&self) -> [u32; 3] {
        [self.u1, self.u2, self.u3]
    }

    pub fn currents_amps(&self) -> [f64; 3] {
        [self.i1, self.i2, self.i3].map(|ma| f64::from(ma) / 1000.0)
    }

    pub fn power_kw(&self) -> f64 {
        self.p as f64 / 1_000_000.0
    }

    pub fn power_factor(&self) -> f64 {
        f64::from(self.pf) / 1000.0
    }

    pub fn present_energy_kwh(&self) -> f64 {
        self.e_pres as f64 / 10_000.0
    }

    pub fn total_energy_kwh(&self) -> f64 {
        self.e_total as f64 / 10_000.0
    }

    /// Number of phases carrying more than 2 W and their mean voltage
    pub fn active_phases(&self) -> Option<(u32, f64)> {
        let mut phases = 0;
        let mut voltage = 0.0;
        for (amps, volts) in self.currents_amps().iter().zip(self.voltages()) {
            if amps * f64::from(volts) > 2.0 {
                phases += 1;
                voltage += f64::from(volts);
            }
        }
        (phases > 0).then(|| (phases, voltage / f64::from(phases)))
    }
}

/// Reports 100 to 130: charging session history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionReport {
    #[serde(skip)]
    pub number: u16,
    #[serde(rename = "Session ID")]
    pub session_id: u64,
    #[serde(rename = "Curr HW")]
    pub curr_hw: u32,
    #[serde(rename = "E start")]
    pub e_start: u64,
    #[serde(rename = "E pres")]
    pub e_pres: u64,
    #[serde(rename = "started[s]")]
    pub started_secs: u64,
    #[serde(rename = "ended[s]")]
    pub ended_secs: u64,
    #[serde(rename = "started")]
    pub started: String,
    #[serde(rename = "ended")]
    pub ended: String,
    #[serde(rename = "reason")]
    pub reason: u32,
    #[serde(rename = "RFID tag")]
    pub rfid_tag: String,
    #[serde(rename = "RFID class")]
    pub rfid_class: String,
    #[serde(rename = "Serial")]
    pub serial: String,
    #[serde(rename = "Sec")]
    pub sec: u64,
}

impl SessionReport {
    pub fn start_energy_kwh(&self) -> f64 {
        self.e_start as f64 / 10_000.0
    }

    pub fn present_energy_kwh(&self) -> f64 {
        self.e_pres as f64 / 10_000.0
    }

    /// Whether the session is still running
    pub fn is_open(&self) -> bool {
        self.ended_secs == 0
    }
}

/// A numbered report; each number carries its own field set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Info(InfoReport),
    State(StateReport),
    Meter(MeterReport),
    Session(SessionReport),
}

impl Report {
    /// Report number as carried in `ID`
    pub fn number(&self) -> u16 {
        match self {
            Report::Info(_) => 1,
            Report::State(_) => 2,
            Report::Meter(_) => 3,
            Report::Session(report) => report.number,
        }
    }

    /// Station uptime in seconds when the report was produced
    pub fn uptime(&self) -> u64 {
        match self {
            Report::Info(report) => report.sec,
            Report::State(report) => report.sec,
            Report::Meter(report) => report.sec,
            Report::Session(report) => report.sec,
        }
    }

    pub fn serial(&self) -> &str {
        match self {
            Report::Info(report) => &report.serial,
            Report::State(report) => &report.serial,
            Report::Meter(report) => &report.serial,
            Report::Session(report) => &report.serial,
        }
    }

    /// Parses a JSON report; `ID` may be a string or a number
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| Error::parse(raw, e.to_string()))?;
        Self::from_value(value).map_err(|e| match e {
            Error::Parse { reason, .. } => Error::parse(raw, reason),
            other => other,
        })
    }

    pub(crate) fn from_value(value: Value) -> Result<Self> {
        let id = value
            .get("ID")
            .ok_or_else(|| Error::parse(value.to_string(), "report has no ID"))?;
        let number = match id {
            Value::String(s) => s.trim().parse::<u16>().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            _ => None,
        }
        .ok_or_else(|| Error::parse(value.to_string(), format!("invalid report ID {}", id)))?;

        let raw = value.to_string();
        let invalid = |e: serde_json::Error| Error::parse(raw.clone(), e.to_string());
        match number {
            1 => Ok(Report::Info(serde_json::from_value(value).map_err(invalid)?)),
            2 => Ok(Report::State(serde_json::from_value(value).map_err(invalid)?)),
            3 => Ok(Report::Meter(serde_json::from_value(value).map_err(invalid)?)),
            100..=130 => {
                let mut report: SessionReport = serde_json::from_value(value).map_err(invalid)?;
                report.number = number;
                Ok(Report::Session(report))
            }
            other => Err(Error::parse(raw, format!("unknown report number {}", other))),
        }
    }

    /// Wire form of the report with `ID` as a string
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            Report::Info(report) => serde_json::to_value(report),
            Report::State(report) => serde_json::to_value(report),
            Report::Meter(report) => serde_json::to_value(report),
            Report::Session(report) => serde_json::to_value(report),
        }
        .map_err(|e| Error::invalid_state(format!("Failed to serialize report: {}", e)))?;

        let mut object = Map::new();
        object.insert("ID".to_string(), Value::String(self.number().to_string()));
        if let Value::Object(fields) = value {
            object.extend(fields);
        }
        Ok(Value::Object(object).to_string())
    }
}

/// Fields a station pushes on its own, without an `ID`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushUpdate {
    #[serde(rename = "State", skip_serializing_if = "Option::is_none")]
    pub state: Option<u8>,
    #[serde(rename = "Plug", skip_serializing_if = "Option::is_none")]
    pub plug: Option<u8>,
    #[serde(rename = "Input", skip_serializing_if = "Option::is_none")]
    pub input: Option<u32>,
    #[serde(rename = "Enable sys", skip_serializing_if = "Option::is_none")]
    pub enable_sys: Option<u8>,
    #[serde(rename = "Max curr", skip_serializing_if = "Option::is_none")]
    pub max_curr: Option<u32>,
    #[serde(rename = "E pres", skip_serializing_if = "Option::is_none")]
    pub e_pres: Option<u64>,
}

impl PushUpdate {
    pub fn is_empty(&self) -> bool {
        self == &PushUpdate::default()
    }

    /// Overlays the fields present in `other`
    pub fn merge(&mut self, other: &PushUpdate) {
        self.state = other.state.or(self.state);
        self.plug = other.plug.or(self.plug);
        self.input = other.input.or(self.input);
        self.enable_sys = other.enable_sys.or(self.enable_sys);
        self.max_curr = other.max_curr.or(self.max_curr);
        self.e_pres = other.e_pres.or(self.e_pres);
    }

    /// Patches the pushed fields into a stored report 2; returns whether anything changed
    pub fn apply_to_state(&self, report: &mut StateReport) -> bool {
        let before = report.clone();
        if let Some(state) = self.state {
            report.state = state;
        }
        if let Some(plug) = self.plug {
            report.plug = plug;
        }
        if let Some(input) = self.input {
            report.input = input;
        }
        if let Some(enable_sys) = self.enable_sys {
            report.enable_sys = enable_sys;
        }
        if let Some(max_curr) = self.max_curr {
            report.max_curr = max_curr;
        }
        *report != before
    }

    /// Patches the pushed energy into a stored report 3
    pub fn apply_to_meter(&self, report: &mut MeterReport) -> bool {
        match self.e_pres {
            Some(e_pres) if e_pres != report.e_pres => {
                report.e_pres = e_pres;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT_2: &str = r#"{"ID": "2","State": 3,"Error1": 0,"Error2": 0,"Plug": 7,"AuthON": 0,"Authreq": 0,"Enable sys": 1,"Enable user": 1,"Max curr": 16000,"Max curr %": 1000,"Curr HW": 32000,"Curr user": 16000,"Curr FS": 6000,"Tmo FS": 30,"Curr timer": 0,"Tmo CT": 0,"Setenergy": 125000,"Output": 0,"Input": 0,"X2 phaseSwitch source": 0,"X2 phaseSwitch": 0,"Serial": "15017355","Sec": 4294967296}"#;

    const REPORT_3: &str = r#"{"ID": "3","U1": 230,"U2": 229,"U3": 231,"I1": 16000,"I2": 16000,"I3": 0,"P": 7360000,"PF": 998,"E pres": 52500,"E total": 9999999,"Serial": "15017355","Sec": 1200}"#;

    #[test]
    fn test_state_report_scaling() {
        let report = Report::from_json(REPORT_2).unwrap();
        assert_eq!(report.number(), 2);
        assert_eq!(report.uptime(), 4_294_967_296);
        let Report::State(state) = report else {
            panic!("expected report 2");
        };
        assert_eq!(state.charging_state(), ChargingState::Charging);
        assert!(state.plug_state().at_station());
        assert!(state.plug_state().locked());
        assert!(state.plug_state().at_vehicle());
        assert_eq!(state.max_current_amps(), 16.0);
        assert_eq!(state.max_current_percent(), 100.0);
        assert_eq!(state.hardware_current_amps(), Some(32.0));
        assert_eq!(state.failsafe_current_amps(), 6.0);
        assert!(state.failsafe_enabled());
        assert_eq!(state.energy_limit_kwh(), 12.5);
    }

    #[test]
    fn test_meter_report_scaling() {
        let Report::Meter(meter) = Report::from_json(REPORT_3).unwrap() else {
            panic!("expected report 3");
        };
        assert_eq!(meter.power_kw(), 7.36);
        assert_eq!(meter.power_factor(), 0.998);
        assert_eq!(meter.present_energy_kwh(), 5.25);
        assert_eq!(meter.currents_amps(), [16.0, 16.0, 0.0]);
        assert_eq!(meter.active_phases(), Some((2, 229.5)));
    }

    #[test]
    fn test_numeric_id_and_session_report() {
        let report = Report::from_json(
            r#"{"ID": 101,"Session ID": 35,"Curr HW": 20000,"E start": 29532,"E pres": 0,"started[s]": 1698,"ended[s]": 0,"RFID tag": "e3f76b8d00000000","Serial": "16914905","Sec": 1704}"#,
        )
        .unwrap();
        assert_eq!(report.number(), 101);
        let Report::Session(session) = report else {
            panic!("expected a session report");
        };
        assert!(session.is_open());
        assert_eq!(session.start_energy_kwh(), 2.9532);
    }

    #[test]
    fn test_invalid_reports() {
        assert!(matches!(
            Report::from_json(r#"{"ID": "7", "Sec": 1}"#),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            Report::from_json(r#"{"ID": "2", "State": "x"}"#),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(Report::from_json("{\"ID\""), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_to_json_carries_id() {
        let report = Report::Info(InfoReport {
            product: "KC-P30-EC240422-E00".to_string(),
            serial: "15017355".to_string(),
            firmware: "P30 v 3.10.16".to_string(),
            sec: 12,
            ..Default::default()
        });
        let json = report.to_json().unwrap();
        assert!(json.contains(r#""ID":"1""#));
        assert_eq!(Report::from_json(&json).unwrap(), report);
    }

    #[test]
    fn test_push_update_patches_fields() {
        let Report::State(mut state) = Report::from_json(REPORT_2).unwrap() else {
            panic!("expected report 2");
        };
        let update: PushUpdate = serde_json::from_str(r#"{"State": 2, "Plug": 5}"#).unwrap();
        assert!(update.apply_to_state(&mut state));
        assert_eq!(state.charging_state(), ChargingState::Ready);
        assert!(!state.plug_state().locked());
        assert!(!update.apply_to_state(&mut state));

        let update: PushUpdate = serde_json::from_str(r#"{"E pres": 60000}"#).unwrap();
        let mut meter = MeterReport::default();
        assert!(update.apply_to_meter(&mut meter));
        assert_eq!(meter.present_energy_kwh(), 6.0);
    }
}
