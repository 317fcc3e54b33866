use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Dispatcher, Transport};
use crate::core::{Error, Result, StationAddress};
use crate::protocol::{Command, StationCodec};

/// Configuration for station discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long replies are collected after the identify requests went out
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub window: Duration,
    /// Identify request targets; the broadcast address of every interface when empty
    pub targets: Vec<SocketAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            window: Duration::from_secs(3),
            targets: Vec::new(),
        }
    }
}

/// A station that answered the identify request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredStation {
    pub address: StationAddress,
    pub firmware: String,
}

/// Outcome of one discovery run
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryResult {
    /// Distinct responders, ordered by address
    pub stations: Vec<DiscoveredStation>,
    /// The run was cut short; `stations` holds what arrived until then
    pub cancelled: bool,
}

/// Sends `i` to every target and collects identity replies for `window`
///
/// Replies are observed through the dispatcher, so the shared socket keeps
/// serving station sessions during the run. Each address is reported once.
pub async fn run(
    transport: &Transport,
    dispatcher: &Dispatcher,
    targets: &[SocketAddr],
    window: Duration,
    cancel: &CancellationToken,
) -> Result<DiscoveryResult> {
    if targets.is_empty() {
        return Err(Error::transport("no discovery targets"));
    }

    // Listen before probing so no early reply is missed
    let mut sightings = dispatcher.watch_identities();
    let request = StationCodec::new().encode_command(&Command::Identify)?;

    let sends = join_all(targets.iter().map(|target| transport.send(*target, &request))).await;
    let mut reached = 0;
    for (target, outcome) in targets.iter().zip(sends) {
        match outcome {
            Ok(()) => {
                debug!("Identify request sent to {}", target);
                reached += 1;
            }
            Err(e) => warn!("Identify request to {} failed: {}", target, e),
        }
    }
    if reached == 0 {
        return Err(Error::transport("identify request could not be sent to any target"));
    }

    let deadline = Instant::now() + window;
    let mut found = BTreeMap::new();
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            _ = sleep_until(deadline) => break,
            sighting = sightings.recv() => match sighting {
                Some(sighting) => {
                    let address = StationAddress::from(sighting.source);
                    if !found.contains_key(&address) {
                        debug!("Station {} answered: {}", address, sighting.firmware);
                    }
                    found.entry(address).or_insert(sighting.firmware);
                }
                None => break,
            },
        }
    }

    let stations: Vec<DiscoveredStation> = found
        .into_iter()
        .map(|(address, firmware)| DiscoveredStation { address, firmware })
        .collect();
    info!(
        "Discovery finished with {} station(s){}",
        stations.len(),
        if cancelled { " (cancelled)" } else { "" }
    );

    Ok(DiscoveryResult {
        stations,
        cancelled,
    })
}
