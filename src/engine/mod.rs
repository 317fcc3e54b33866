//! Public entry point of the crate
//!
//! An [`Engine`] owns the shared socket, the session table and the
//! diagnostics channel. Stations are set up explicitly, or implicitly when
//! auto setup is enabled, and are driven through their [`Station`] handles.

mod event;

pub use self::event::EngineEvent;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::core::{EngineConfig, Error, Result, StationAddress};
use crate::network::{self, broadcast_targets, Dispatcher, DiscoveryResult, Transport};
use crate::protocol::{Command, Report};
use crate::station::{Response, Station, StationSnapshot};

/// Client engine for any number of stations sharing one UDP socket
pub struct Engine {
    config: EngineConfig,
    transport: Transport,
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
    receiver: JoinHandle<()>,
    _guard: DropGuard,
}

impl Engine {
    /// Binds the shared socket and starts receiving
    ///
    /// Must be called from within a tokio runtime. A bind failure is returned
    /// as [`Error::Transport`].
    pub fn bind(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let transport = Transport::bind(config.bind_addr)?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            config.session.clone(),
            config.auto_setup,
            events.clone(),
            cancel.child_token(),
        ));
        let receiver = transport.spawn_receiver(dispatcher.clone(), cancel.child_token());

        Ok(Engine {
            config,
            transport,
            dispatcher,
            events,
            _guard: cancel.clone().drop_guard(),
            cancel,
            receiver,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Creates the session for `address` and identifies the station
    ///
    /// Sends `report 1` and waits up to `setup_timeout`. A station that moved
    /// to a new address replaces the session still held for its old one. An
    /// address that already has a session returns the existing handle.
    pub async fn setup_station(&self, address: StationAddress, periodic: bool) -> Result<Station> {
        let (station, created) = self.dispatcher.open(address, false);
        if !created {
            debug!("{} is already set up", address);
            if periodic {
                station.set_polling(true).await?;
            }
            return Ok(station);
        }

        let info = match timeout(self.config.setup_timeout, station.report(1)).await {
            Ok(Ok(Report::Info(_))) => station.info(),
            Ok(Ok(other)) => {
                self.dispatcher.remove(&address);
                return Err(Error::setup(format!(
                    "{} answered report 1 with report {}",
                    address,
                    other.number()
                )));
            }
            Ok(Err(e)) => {
                self.dispatcher.remove(&address);
                return Err(Error::setup(format!("{} did not identify itself: {}", address, e)));
            }
            Err(_) => {
                self.dispatcher.remove(&address);
                return Err(Error::setup(format!(
                    "{} did not answer within {:?}",
                    address, self.config.setup_timeout
                )));
            }
        };
        let Some(info) = info else {
            self.dispatcher.remove(&address);
            return Err(Error::setup(format!("{} sent an unrecognized product", address)));
        };

        for other in self.dispatcher.stations() {
            if other.address() == address {
                continue;
            }
            if other.info().map_or(false, |known| known == info) {
                warn!(
                    "Station {} moved from {} to {}, replacing the old session",
                    info.serial,
                    other.address(),
                    address
                );
                self.dispatcher.remove(&other.address());
            }
        }

        if periodic {
            station.set_polling(true).await?;
        }
        info!("Station {} set up: {}", address, info);
        Ok(station)
    }

    pub fn station(&self, address: &StationAddress) -> Option<Station> {
        self.dispatcher.get(address)
    }

    /// Every station with a session, ordered by address
    pub fn stations(&self) -> Vec<Station> {
        self.dispatcher.stations()
    }

    pub async fn send_command(&self, station: &Station, command: Command) -> Result<Response> {
        station.send(command).await
    }

    pub async fn subscribe<F>(&self, station: &Station, callback: F) -> Result<()>
    where
        F: Fn(&StationSnapshot) + Send + Sync + 'static,
    {
        station.subscribe(callback).await
    }

    /// Broadcasts `i` on every interface and collects replies for `window`
    ///
    /// Uses the configured discovery targets instead when there are any.
    pub async fn discover(&self, window: Duration) -> Result<DiscoveryResult> {
        let targets = if self.config.discovery.targets.is_empty() {
            broadcast_targets(self.config.station_port)?
        } else {
            self.config.discovery.targets.clone()
        };
        let cancel = self.cancel.child_token();
        self.discover_targets(&targets, window, &cancel).await
    }

    /// Discovery against explicit targets; cancelling returns what arrived so far
    pub async fn discover_targets(
        &self,
        targets: &[SocketAddr],
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryResult> {
        network::discovery::run(&self.transport, &self.dispatcher, targets, window, cancel).await
    }

    /// Removes the session; its outstanding commands resolve as cancelled
    pub fn teardown(&self, address: &StationAddress) -> bool {
        self.dispatcher.remove(address)
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Tears down every session and stops receiving
    pub async fn shutdown(self) {
        let Engine {
            dispatcher,
            cancel,
            receiver,
            ..
        } = self;

        dispatcher.remove_all();
        cancel.cancel();
        if let Err(e) = receiver.await {
            warn!("Receive task ended abnormally: {}", e);
        }
        info!("Engine stopped");
    }
}
