use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{Datagram, Transport};
use crate::core::{Error, SessionConfig, StationAddress};
use crate::engine::EngineEvent;
use crate::protocol::{Command, Payload, StationCodec};
use crate::station::{Inbound, Session, Station};

/// A station answering `i`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub source: SocketAddr,
    pub firmware: String,
}

struct SessionEntry {
    station: Station,
    inbound: mpsc::Sender<Inbound>,
}

/// Session table keyed by station address; routes inbound datagrams without awaiting
pub struct Dispatcher {
    sessions: DashMap<StationAddress, SessionEntry>,
    identity_sinks: DashMap<u64, mpsc::UnboundedSender<Sighting>>,
    next_sink: AtomicU64,
    codec: StationCodec,
    transport: Transport,
    config: SessionConfig,
    auto_setup: bool,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        transport: Transport,
        config: SessionConfig,
        auto_setup: bool,
        events: broadcast::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Dispatcher {
            sessions: DashMap::new(),
            identity_sinks: DashMap::new(),
            next_sink: AtomicU64::new(0),
            codec: StationCodec::new(),
            transport,
            config,
            auto_setup,
            events,
            cancel,
        }
    }

    /// Returns the session for `address`, creating it when absent
    ///
    /// The boolean is `true` when this call created the session.
    pub fn open(&self, address: StationAddress, polling: bool) -> (Station, bool) {
        let station = match self.sessions.entry(address) {
            Entry::Occupied(entry) => return (entry.get().station.clone(), false),
            Entry::Vacant(entry) => {
                let (station, inbound) = Session::spawn(
                    address,
                    self.config.clone(),
                    self.transport.clone(),
                    self.events.clone(),
                    self.cancel.child_token(),
                    polling,
                );
                entry.insert(SessionEntry {
                    station: station.clone(),
                    inbound,
                });
                station
            }
        };

        info!("Session for {} created", address);
        let _ = self.events.send(EngineEvent::StationAdded(address));
        (station, true)
    }

    pub fn get(&self, address: &StationAddress) -> Option<Station> {
        self.sessions.get(address).map(|entry| entry.station.clone())
    }

    pub fn stations(&self) -> Vec<Station> {
        let mut stations: Vec<Station> = self
            .sessions
            .iter()
            .map(|entry| entry.station.clone())
            .collect();
        stations.sort_by_key(Station::address);
        stations
    }

    /// Removes the session and cancels its task; outstanding commands resolve as cancelled
    pub fn remove(&self, address: &StationAddress) -> bool {
        match self.sessions.remove(address) {
            Some((address, entry)) => {
                entry.station.close();
                info!("Session for {} removed", address);
                let _ = self.events.send(EngineEvent::StationRemoved(address));
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        let addresses: Vec<StationAddress> = self.sessions.iter().map(|e| *e.key()).collect();
        for address in addresses {
            self.remove(&address);
        }
    }

    /// Receives every identity reply until the receiver is dropped
    pub fn watch_identities(&self) -> mpsc::UnboundedReceiver<Sighting> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sink.fetch_add(1, Ordering::Relaxed);
        self.identity_sinks.insert(id, tx);
        rx
    }

    /// Routes one datagram to its session
    pub fn dispatch(&self, datagram: Datagram) {
        let payload = match self.codec.decode_payload(&datagram.payload) {
            Ok(payload) => payload,
            Err(Error::Parse { raw, reason }) => {
                debug!("Unparseable datagram from {}: {} ({:?})", datagram.source, reason, raw);
                let _ = self.events.send(EngineEvent::ParseError {
                    source: datagram.source,
                    raw,
                    reason,
                });
                return;
            }
            Err(e) => {
                debug!("Dropping datagram from {}: {}", datagram.source, e);
                return;
            }
        };

        match &payload {
            Payload::Echo => return,
            Payload::Identity(firmware) => {
                let sighting = Sighting {
                    source: datagram.source,
                    firmware: firmware.clone(),
                };
                self.identity_sinks
                    .retain(|_, sink| sink.send(sighting.clone()).is_ok());
            }
            _ => {}
        }

        let address = StationAddress::from(datagram.source);
        let inbound = match self.sessions.get(&address) {
            Some(entry) => entry.inbound.clone(),
            None => match self.unknown_peer(address, &payload) {
                Some(inbound) => inbound,
                None => return,
            },
        };

        let kind = payload.kind();
        let message = Inbound {
            payload,
            received_at: datagram.received_at,
            timestamp: datagram.timestamp,
        };
        match inbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Inbound queue of {} is full, dropping {}", address, kind);
                let _ = self.events.send(EngineEvent::InboundOverflow(address));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Session for {} is gone, dropping {}", address, kind);
            }
        }
    }

    fn unknown_peer(
        &self,
        address: StationAddress,
        payload: &Payload,
    ) -> Option<mpsc::Sender<Inbound>> {
        // Discovery replies are expected from stations without a session
        if matches!(payload, Payload::Identity(_)) {
            return None;
        }

        if !self.auto_setup {
            info!("Datagram from unknown peer {} ({})", address, payload.kind());
            let _ = self.events.send(EngineEvent::UnknownPeer {
                source: address.socket_addr(),
                kind: payload.kind(),
            });
            return None;
        }

        let (station, created) = self.open(address, false);
        if created {
            if let Err(e) = station.submit_detached(Command::Report(1)) {
                warn!("Unable to identify {}: {}", address, e);
            }
        }
        self.sessions.get(&address).map(|entry| entry.inbound.clone())
    }
}
