use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::command::Command;
use super::report::InfoReport;
use crate::core::{Error, Result, StationAddress};

/// Optional station capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    SetFailsafe,
    SetCurrent,
    SetChargingPower,
    SetEnergy,
    SetOutput,
    Display,
    Start,
    Stop,
    PhaseSwitch,
}

impl Service {
    /// Service a command depends on, if it is not universally available
    pub fn required_by(command: &Command) -> Option<Service> {
        match command {
            Command::SetEnergy { .. } => Some(Service::SetEnergy),
            Command::SetOutput(_) => Some(Service::SetOutput),
            Command::Display { .. } => Some(Service::Display),
            Command::Start(_) => Some(Service::Start),
            Command::Stop(_) => Some(Service::Stop),
            Command::X2Source(_) | Command::X2(_) => Some(Service::PhaseSwitch),
            _ => None,
        }
    }
}

/// Model and feature detection from report 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationInfo {
    pub address: StationAddress,
    pub serial: String,
    pub firmware: String,
    pub product: String,
    /// `KEBA`, `BMW`, or the raw product prefix
    pub manufacturer: String,
    pub model: String,
    pub meter_integrated: bool,
    pub authorization_integrated: bool,
    pub data_logger_integrated: bool,
    pub phase_switch_x2: bool,
    pub services: BTreeSet<Service>,
}

impl StationInfo {
    pub fn from_report(address: StationAddress, report: &InfoReport) -> Result<Self> {
        if report.serial.is_empty() {
            return Err(Error::parse(&report.product, "report 1 carries no serial"));
        }
        if report.firmware.is_empty() {
            return Err(Error::parse(&report.product, "report 1 carries no firmware"));
        }

        let parts: Vec<&str> = report.product.split('-').collect();
        if parts.len() < 4 {
            return Err(Error::parse(
                &report.product,
                "product string has fewer than four parts",
            ));
        }
        let (version, features) = (parts[2], parts[3]);

        let mut info = StationInfo {
            address,
            serial: report.serial.clone(),
            firmware: report.firmware.clone(),
            product: report.product.clone(),
            manufacturer: parts[0].to_string(),
            model: parts[1].to_string(),
            meter_integrated: false,
            authorization_integrated: false,
            data_logger_integrated: false,
            phase_switch_x2: false,
            services: [
                Service::SetFailsafe,
                Service::SetCurrent,
                Service::SetChargingPower,
            ]
            .into_iter()
            .collect(),
        };

        match parts[0] {
            "KC" => {
                info.manufacturer = "KEBA".to_string();
                info.services.insert(Service::SetOutput);
                info.phase_switch_x2 = true;

                if info.model == "P30" {
                    info.authorization_integrated = true;
                    info.data_logger_integrated = true;
                    if report.product.contains("KC-P30-EC220112-000-DE") {
                        info.model = "P30-DE".to_string();
                    } else {
                        info.services.insert(Service::Display);
                        info.meter_integrated = true;
                    }
                } else if info.model == "P20" {
                    if version.ends_with("10") || version.ends_with("20") || version.ends_with("30")
                    {
                        info.meter_integrated = true;
                    }
                    if features.contains('R') {
                        info.authorization_integrated = true;
                    }
                }
            }
            "BMW" => {
                if report.product.contains("BMW-10-EC2405B2-E1R") {
                    info.model = "Wallbox Connect".to_string();
                } else if report.product.contains("BMW-10-EC240522-E1R")
                    || report.product.contains("BMW-10-ESS40022-E1R")
                {
                    info.model = "Wallbox Plus".to_string();
                }
                info.meter_integrated = true;
                info.authorization_integrated = true;
                info.data_logger_integrated = true;
            }
            other => warn!("Unable to identify model of product {} ({})", report.product, other),
        }

        if info.meter_integrated {
            info.services.insert(Service::SetEnergy);
        }
        if info.authorization_integrated {
            info.services.insert(Service::Start);
            info.services.insert(Service::Stop);
        }
        if info.phase_switch_x2 {
            info.services.insert(Service::PhaseSwitch);
        }

        Ok(info)
    }

    pub fn has_display(&self) -> bool {
        self.services.contains(&Service::Display)
    }

    /// Whether the station accepts the command
    pub fn supports(&self, command: &Command) -> bool {
        Service::required_by(command).map_or(true, |service| self.services.contains(&service))
    }

    /// Whether `currtime` is understood; P20 only knows `curr`
    pub fn supports_current_timer(&self) -> bool {
        !self.model.contains("P20")
    }
}

impl PartialEq for StationInfo {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for StationInfo {}

impl fmt::Display for StationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}, {}) at {}",
            self.manufacturer, self.model, self.serial, self.firmware, self.address
        )
    }
}
