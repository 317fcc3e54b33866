use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};
use crate::network::DiscoveryConfig;

/// Network address of a charging station; the identity key of its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationAddress(SocketAddr);

impl StationAddress {
    /// Creates an address on the protocol port
    pub fn new(ip: IpAddr) -> Self {
        StationAddress(SocketAddr::new(ip, super::UDP_PORT))
    }

    /// Creates an address on an explicit port
    pub fn with_port(ip: IpAddr, port: u16) -> Self {
        StationAddress(SocketAddr::new(ip, port))
    }

    /// Returns the host part
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port part
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns the socket address datagrams are sent to
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for StationAddress {
    fn from(addr: SocketAddr) -> Self {
        StationAddress(addr)
    }
}

impl From<IpAddr> for StationAddress {
    fn from(ip: IpAddr) -> Self {
        StationAddress::new(ip)
    }
}

impl FromStr for StationAddress {
    type Err = Error;

    /// Accepts either `host` (protocol port implied) or `host:port`
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(StationAddress(addr));
        }
        s.parse::<IpAddr>()
            .map(StationAddress::new)
            .map_err(|_| Error::validation("address", format!("`{}` is not an IP address", s)))
    }
}

impl fmt::Display for StationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.port() == super::UDP_PORT {
            write!(f, "{}", self.0.ip())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Timing and pacing parameters of a station session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time to wait for a reply before retransmitting
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub response_timeout: Duration,
    /// Retransmissions after the first attempt before a command times out
    pub max_retries: u32,
    /// Minimum gap between two commands to the same station
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub command_spacing: Duration,
    /// Silence after `ena 0` while the station runs its disable sequence
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub disable_quiet_period: Duration,
    /// Silence after `start`/`stop`
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub authorization_quiet_period: Duration,
    /// Regular polling interval
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub poll_interval: Duration,
    /// Polling interval right after a state-changing command
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub fast_poll_interval: Duration,
    /// Silence after which an active session is considered degraded
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub liveness_window: Duration,
    /// Largest backwards jump of a report's uptime still treated as reordering
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub stale_tolerance: Duration,
    /// Capacity of the per-session inbound queue
    pub inbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            response_timeout: Duration::from_secs(1),
            max_retries: 3,
            command_spacing: Duration::from_millis(100),
            disable_quiet_period: Duration::from_secs(2),
            authorization_quiet_period: Duration::from_secs(1),
            poll_interval: Duration::from_secs(5),
            fast_poll_interval: Duration::from_secs(1),
            liveness_window: Duration::from_secs(15),
            stale_tolerance: Duration::from_secs(60),
            inbound_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Total number of transmissions a command gets
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Number of fast polls after a state-changing command
    pub fn fast_poll_burst(&self) -> u32 {
        let fast = self.fast_poll_interval.as_secs_f64();
        if fast <= 0.0 {
            return 0;
        }
        (self.poll_interval.as_secs_f64() * 2.0 / fast) as u32
    }

    /// Checks the timings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout.is_zero() {
            return Err(Error::config("response_timeout must be greater than zero"));
        }
        if self.poll_interval.is_zero() || self.fast_poll_interval.is_zero() {
            return Err(Error::config("polling intervals must be greater than zero"));
        }
        if self.fast_poll_interval > self.poll_interval {
            return Err(Error::config(
                "fast_poll_interval must not exceed poll_interval",
            ));
        }
        if self.liveness_window < self.poll_interval {
            return Err(Error::config(
                "liveness_window must cover at least one poll_interval",
            ));
        }
        if self.inbound_capacity == 0 {
            return Err(Error::config("inbound_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local address of the shared socket
    pub bind_addr: SocketAddr,
    /// Port stations listen on
    pub station_port: u16,
    /// Create sessions for datagrams from unknown stations
    pub auto_setup: bool,
    /// Time a station gets to answer `report 1` during setup
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub setup_timeout: Duration,
    /// Capacity of the diagnostics event channel
    pub event_capacity: usize,
    /// Per-session timings
    pub session: SessionConfig,
    /// Discovery parameters
    pub discovery: DiscoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            bind_addr: SocketAddr::new(IpAddr::from([0, 0, 0, 0]), super::UDP_PORT),
            station_port: super::UDP_PORT,
            auto_setup: false,
            setup_timeout: Duration::from_secs(3),
            event_capacity: 256,
            session: SessionConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Checks the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.setup_timeout.is_zero() {
            return Err(Error::config("setup_timeout must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event_capacity must be at least 1"));
        }
        if self.discovery.window.is_zero() {
            return Err(Error::config("discovery window must be greater than zero"));
        }
        self.session.validate()
    }

    /// Parses a JSON configuration, filling gaps with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Invalid engine configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Address of a station given only its host
    pub fn station_address(&self, ip: IpAddr) -> StationAddress {
        StationAddress::with_port(ip, self.station_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_address_parsing() {
        let addr: StationAddress = "192.168.1.20".parse().unwrap();
        assert_eq!(addr.port(), crate::core::UDP_PORT);
        assert_eq!(addr.to_string(), "192.168.1.20");

        let addr: StationAddress = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(addr.port(), 4000);
        assert_eq!(addr.to_string(), "127.0.0.1:4000");

        let err = "wallbox.local".parse::<StationAddress>().unwrap_err();
        assert_eq!(err.field(), Some("address"));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr.port(), 7090);
        assert_eq!(config.session.max_attempts(), 4);
        assert_eq!(config.session.fast_poll_burst(), 10);
    }

    #[test]
    fn test_config_from_json() {
        let config = EngineConfig::from_json(
            r#"{"auto_setup": true, "session": {"response_timeout": 0.25, "max_retries": 1}}"#,
        )
        .unwrap();
        assert!(config.auto_setup);
        assert_eq!(config.session.response_timeout, Duration::from_millis(250));
        assert_eq!(config.session.max_attempts(), 2);
        assert_eq!(config.session.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_inconsistent_config_rejected() {
        let mut config = SessionConfig::default();
        config.fast_poll_interval = Duration::from_secs(10);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SessionConfig::default();
        config.liveness_window = Duration::from_secs(1);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
