use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result, SessionConfig};

/// RFID class sent with `start` when none is given (white card)
pub const DEFAULT_RFID_CLASS: &str = "01010400000000000000";

/// Maximum number of characters the station display accepts
pub const DISPLAY_TEXT_LIMIT: usize = 23;

/// Lowest non-zero charging current in mA
pub const MIN_CURRENT_MA: u32 = 6_000;

/// Highest charging current in mA
pub const MAX_CURRENT_MA: u32 = 63_000;

/// Upper bound (exclusive) of the `currtime` delay in seconds
pub const MAX_CURRENT_DELAY: u32 = 860_400;

/// Lowest non-zero energy limit in 0.1 Wh (1 kWh)
pub const MIN_ENERGY: u64 = 10_000;

/// Upper bound (exclusive) of the energy limit in 0.1 Wh (10000 kWh)
pub const MAX_ENERGY: u64 = 100_000_000;

/// Failsafe parameters configured on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failsafe {
    /// Seconds without control traffic before the fallback applies; 0 disables
    pub timeout_secs: u32,
    /// Fallback current in mA
    pub fallback_ma: u32,
    /// Keep the setting across reboots
    pub persist: bool,
}

impl Failsafe {
    /// Failsafe switched off
    pub fn disabled(persist: bool) -> Self {
        Failsafe {
            timeout_secs: 0,
            fallback_ma: 0,
            persist,
        }
    }

    /// Whether the watchdog is armed
    pub fn is_enabled(&self) -> bool {
        self.timeout_secs > 0
    }

    /// Fallback current in A
    pub fn fallback_amps(&self) -> f64 {
        f64::from(self.fallback_ma) / 1000.0
    }
}

/// RFID credentials for `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rfid {
    /// 8 byte tag as hex
    pub tag: String,
    /// 10 byte class as hex
    pub class: String,
}

impl Rfid {
    /// Tag with the default class
    pub fn new(tag: impl Into<String>) -> Self {
        Rfid {
            tag: tag.into(),
            class: DEFAULT_RFID_CLASS.to_string(),
        }
    }
}

/// What resolves an in-flight command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `TCH-OK`/`TCH-ERR`
    Ack,
    /// A fresh report with this number
    Report(u16),
    /// The `"Firmware"` identity line
    Identity,
}

/// A command understood by KeContact stations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// `i`: identity request, also used for discovery
    Identify,
    /// `report N`
    Report(u16),
    /// `ena 0|1`
    Enable(bool),
    /// `curr <mA>`
    SetCurrent {
        /// Current in mA
        milliamps: u32,
    },
    /// `currtime <mA> <s>`
    SetCurrentTimed {
        /// Current in mA
        milliamps: u32,
        /// Seconds until the current applies
        delay_secs: u32,
    },
    /// `setenergy <0.1 Wh>`
    SetEnergy {
        /// Limit in 0.1 Wh, 0 disables
        tenth_wh: u64,
    },
    /// `output <n>`
    SetOutput(u8),
    /// `failsafe <s> <mA> <persist>`
    SetFailsafe(Failsafe),
    /// `start [<tag> <class>]`
    Start(Option<Rfid>),
    /// `stop [<tag>]`
    Stop(Option<String>),
    /// `display 1 <min> <max> 0 <text>`
    Display {
        /// Text, at most 23 printable ASCII characters
        text: String,
        /// Minimum display time in seconds
        min_secs: u32,
        /// Maximum display time in seconds
        max_secs: u32,
    },
    /// `unlock`
    Unlock,
    /// `x2src <n>`
    X2Source(u8),
    /// `x2 0|1`
    X2(bool),
}

fn to_milli(value: f64, field: &'static str) -> Result<u32> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::validation(field, format!("{} is not a valid value", value)));
    }
    let scaled = (value * 1000.0).round();
    if scaled > f64::from(u32::MAX) {
        return Err(Error::validation(field, format!("{} is out of range", value)));
    }
    Ok(scaled as u32)
}

fn check_current(milliamps: u32, field: &'static str) -> Result<()> {
    if milliamps != 0 && !(MIN_CURRENT_MA..=MAX_CURRENT_MA).contains(&milliamps) {
        return Err(Error::validation(
            field,
            format!("{} mA is not 0 or between 6 and 63 A", milliamps),
        ));
    }
    Ok(())
}

fn check_hex(value: &str, digits: usize, field: &'static str) -> Result<()> {
    if value.len() != digits || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::validation(
            field,
            format!("`{}` is not a {} byte hex string", value, digits / 2),
        ));
    }
    Ok(())
}

impl Command {
    /// `report N`
    pub fn report(number: u16) -> Result<Self> {
        let command = Command::Report(number);
        command.validate()?;
        Ok(command)
    }

    /// `curr` with the current given in A
    pub fn set_current(amps: f64) -> Result<Self> {
        let command = Command::SetCurrent {
            milliamps: to_milli(amps, "current")?,
        };
        command.validate()?;
        Ok(command)
    }

    /// `currtime` with the current given in A
    pub fn set_current_timed(amps: f64, delay_secs: u32) -> Result<Self> {
        let command = Command::SetCurrentTimed {
            milliamps: to_milli(amps, "current")?,
            delay_secs,
        };
        command.validate()?;
        Ok(command)
    }

    /// `setenergy` with the limit given in kWh
    pub fn set_energy(kwh: f64) -> Result<Self> {
        if !kwh.is_finite() || kwh < 0.0 {
            return Err(Error::validation("energy", format!("{} kWh is not a valid value", kwh)));
        }
        let command = Command::SetEnergy {
            tenth_wh: (kwh * 10_000.0).round() as u64,
        };
        command.validate()?;
        Ok(command)
    }

    /// `failsafe` with the fallback current given in A
    pub fn failsafe(timeout_secs: u32, fallback_amps: f64, persist: bool) -> Result<Self> {
        let command = Command::SetFailsafe(Failsafe {
            timeout_secs,
            fallback_ma: to_milli(fallback_amps, "fallback_current")?,
            persist,
        });
        command.validate()?;
        Ok(command)
    }

    /// `display` with spaces allowed in the text
    pub fn display(text: impl Into<String>, min_secs: u32, max_secs: u32) -> Result<Self> {
        let command = Command::Display {
            text: text.into(),
            min_secs,
            max_secs,
        };
        command.validate()?;
        Ok(command)
    }

    /// Checks every parameter against the limits of the protocol
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::Identify | Command::Enable(_) | Command::Unlock | Command::X2(_) => Ok(()),
            Command::Report(number) => {
                if matches!(number, 1..=3 | 100..=130) {
                    Ok(())
                } else {
                    Err(Error::validation(
                        "report",
                        format!("report {} does not exist", number),
                    ))
                }
            }
            Command::SetCurrent { milliamps } => check_current(*milliamps, "current"),
            Command::SetCurrentTimed {
                milliamps,
                delay_secs,
            } => {
                check_current(*milliamps, "current")?;
                if *delay_secs >= MAX_CURRENT_DELAY {
                    return Err(Error::validation(
                        "delay",
                        format!("{} s is not below {} s", delay_secs, MAX_CURRENT_DELAY),
                    ));
                }
                Ok(())
            }
            Command::SetEnergy { tenth_wh } => {
                if *tenth_wh != 0 && !(MIN_ENERGY..MAX_ENERGY).contains(tenth_wh) {
                    return Err(Error::validation(
                        "energy",
                        "limit must be 0 or between 1 and 10000 kWh",
                    ));
                }
                Ok(())
            }
            Command::SetOutput(value) => {
                if matches!(value, 0 | 1 | 10..=150) {
                    Ok(())
                } else {
                    Err(Error::validation(
                        "output",
                        format!("{} is not 0, 1 or 10 to 150 pulses/kWh", value),
                    ))
                }
            }
            Command::SetFailsafe(failsafe) => {
                if failsafe.timeout_secs != 0 && !(10..=600).contains(&failsafe.timeout_secs) {
                    return Err(Error::validation(
                        "timeout",
                        format!(
                            "{} s is not 0 or between 10 and 600 s",
                            failsafe.timeout_secs
                        ),
                    ));
                }
                check_current(failsafe.fallback_ma, "fallback_current")
            }
            Command::Start(rfid) => match rfid {
                Some(rfid) => {
                    check_hex(&rfid.tag, 16, "rfid_tag")?;
                    check_hex(&rfid.class, 20, "rfid_class")
                }
                None => Ok(()),
            },
            Command::Stop(tag) => match tag {
                Some(tag) => check_hex(tag, 16, "rfid_tag"),
                None => Ok(()),
            },
            Command::Display {
                text,
                min_secs,
                max_secs,
            } => {
                if !text.chars().all(|c| c == ' ' || c.is_ascii_graphic()) || text.contains('$') {
                    return Err(Error::validation(
                        "text",
                        "only printable ASCII characters are supported",
                    ));
                }
                if text.len() > DISPLAY_TEXT_LIMIT {
                    return Err(Error::validation(
                        "text",
                        format!(
                            "{} characters exceed the display limit of {}",
                            text.len(),
                            DISPLAY_TEXT_LIMIT
                        ),
                    ));
                }
                if *min_secs > u32::from(u16::MAX) {
                    return Err(Error::validation("min_time", "must be at most 65535 s"));
                }
                if *max_secs > u32::from(u16::MAX) {
                    return Err(Error::validation("max_time", "must be at most 65535 s"));
                }
                Ok(())
            }
            Command::X2Source(source) => {
                if *source <= 4 {
                    Ok(())
                } else {
                    Err(Error::validation(
                        "source",
                        format!("{} is not a phase switch source (0-4)", source),
                    ))
                }
            }
        }
    }

    /// Keyword of the command on the wire
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Identify => "i",
            Command::Report(_) => "report",
            Command::Enable(_) => "ena",
            Command::SetCurrent { .. } => "curr",
            Command::SetCurrentTimed { .. } => "currtime",
            Command::SetEnergy { .. } => "setenergy",
            Command::SetOutput(_) => "output",
            Command::SetFailsafe(_) => "failsafe",
            Command::Start(_) => "start",
            Command::Stop(_) => "stop",
            Command::Display { .. } => "display",
            Command::Unlock => "unlock",
            Command::X2Source(_) => "x2src",
            Command::X2(_) => "x2",
        }
    }

    /// Reply that resolves this command
    pub fn completion(&self) -> Completion {
        match self {
            Command::Identify => Completion::Identity,
            Command::Report(number) => Completion::Report(*number),
            _ => Completion::Ack,
        }
    }

    /// Whether the command changes the station rather than reading from it
    pub fn is_state_changing(&self) -> bool {
        !matches!(self, Command::Identify | Command::Report(_))
    }

    /// Silence the station needs after this command resolved
    pub fn quiet_period(&self, config: &SessionConfig) -> Duration {
        let hold = match self {
            Command::Enable(false) => config.disable_quiet_period,
            Command::Start(_) | Command::Stop(_) => config.authorization_quiet_period,
            _ => Duration::ZERO,
        };
        hold.max(config.command_spacing)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Identify | Command::Unlock => f.write_str(self.keyword()),
            Command::Report(number) => write!(f, "report {}", number),
            Command::Enable(on) => write!(f, "ena {}", u8::from(*on)),
            Command::SetCurrent { milliamps } => write!(f, "curr {}", milliamps),
            Command::SetCurrentTimed {
                milliamps,
                delay_secs,
            } => write!(f, "currtime {} {}", milliamps, delay_secs),
            Command::SetEnergy { tenth_wh } => write!(f, "setenergy {}", tenth_wh),
            Command::SetOutput(value) => write!(f, "output {}", value),
            Command::SetFailsafe(failsafe) => write!(
                f,
                "failsafe {} {} {}",
                failsafe.timeout_secs,
                failsafe.fallback_ma,
                u8::from(failsafe.persist)
            ),
            Command::Start(None) => f.write_str("start"),
            Command::Start(Some(rfid)) => write!(f, "start {} {}", rfid.tag, rfid.class),
            Command::Stop(None) => f.write_str("stop"),
            Command::Stop(Some(tag)) => write!(f, "stop {}", tag),
            Command::Display {
                text,
                min_secs,
                max_secs,
            } => write!(
                f,
                "display 1 {} {} 0 {}",
                min_secs,
                max_secs,
                text.replace(' ', "$")
            ),
            Command::X2Source(source) => write!(f, "x2src {}", source),
            Command::X2(on) => write!(f, "x2 {}", u8::from(*on)),
        }
    }
}

fn arg<T: FromStr>(args: &[&str], index: usize, field: &'static str) -> Result<T> {
    let raw = args
        .get(index)
        .ok_or_else(|| Error::validation(field, "missing"))?;
    raw.parse()
        .map_err(|_| Error::validation(field, format!("`{}` is not a valid value", raw)))
}

fn flag(args: &[&str], index: usize, field: &'static str) -> Result<bool> {
    match arg::<u8>(args, index, field)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::validation(field, format!("{} is not 0 or 1", other))),
    }
}

impl FromStr for Command {
    type Err = Error;

    /// Parses a wire command as sent by a client
    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = s.split_whitespace();
        let keyword = tokens
            .next()
            .ok_or_else(|| Error::validation("command", "empty command"))?;
        let args: Vec<&str> = tokens.collect();

        let command = match keyword {
            "i" => Command::Identify,
            "report" => Command::Report(arg(&args, 0, "report")?),
            "ena" => Command::Enable(flag(&args, 0, "enable")?),
            "curr" => Command::SetCurrent {
                milliamps: arg(&args, 0, "current")?,
            },
            "currtime" => Command::SetCurrentTimed {
                milliamps: arg(&args, 0, "current")?,
                delay_secs: arg(&args, 1, "delay")?,
            },
            "setenergy" => Command::SetEnergy {
                tenth_wh: arg(&args, 0, "energy")?,
            },
            "output" => Command::SetOutput(arg(&args, 0, "output")?),
            "failsafe" => Command::SetFailsafe(Failsafe {
                timeout_secs: arg(&args, 0, "timeout")?,
                fallback_ma: arg(&args, 1, "fallback_current")?,
                persist: flag(&args, 2, "persist")?,
            }),
            "start" => match args.as_slice() {
                [] => Command::Start(None),
                [tag] => Command::Start(Some(Rfid::new(*tag))),
                [tag, class, ..] => Command::Start(Some(Rfid {
                    tag: tag.to_string(),
                    class: class.to_string(),
                })),
            },
            "stop" => Command::Stop(args.first().map(|tag| tag.to_string())),
            "display" => Command::Display {
                min_secs: arg(&args, 1, "min_time")?,
                max_secs: arg(&args, 2, "max_time")?,
                text: args
                    .get(4..)
                    .map(|rest| rest.join(" ").replace('$', " "))
                    .unwrap_or_default(),
            },
            "unlock" => Command::Unlock,
            "x2src" => Command::X2Source(arg(&args, 0, "source")?),
            "x2" => Command::X2(flag(&args, 0, "x2")?),
            other => {
                return Err(Error::validation(
                    "command",
                    format!("unknown command `{}`", other),
                ))
            }
        };

        command.validate()?;
        Ok(command)
    }
}
