//! Station side of the protocol, for tests without hardware
//!
//! An [`Emulator`] binds its own UDP endpoint and answers every datagram
//! through a [`ProtocolPeer`]: either a simulated [`EmulatedStation`] or a
//! [`TracePeer`] replaying recorded traffic.

mod station;
mod trace;

pub use self::station::{DeviceProfile, EmulatedStation};
pub use self::trace::{Exchange, TracePeer};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

use crate::core::{Error, Result, MAX_DATAGRAM_SIZE};
use crate::network::Transport;

/// Anything that can play the station side of an exchange
pub trait ProtocolPeer: Send + 'static {
    /// Replies to one request datagram, in sending order; empty for silence
    fn respond(&mut self, request: &str, now: Instant) -> Vec<String>;
}

/// Loss simulation of an emulator endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Probability of dropping an inbound datagram
    pub drop_rate: f64,
    /// Seed for reproducible loss
    pub seed: Option<u64>,
}

impl EmulatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(Error::config(format!(
                "drop_rate {} is not between 0 and 1",
                self.drop_rate
            )));
        }
        Ok(())
    }
}

/// A request as seen by the emulator
#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    pub source: SocketAddr,
    pub request: String,
    pub at: Instant,
    /// Lost to the drop rate or the mute switch
    pub dropped: bool,
}

#[derive(Default)]
struct Shared {
    received: Mutex<Vec<ReceivedCommand>>,
    muted: AtomicBool,
}

impl Shared {
    fn log(&self) -> MutexGuard<'_, Vec<ReceivedCommand>> {
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// UDP endpoint driven by a [`ProtocolPeer`]
pub struct Emulator {
    transport: Transport,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl Emulator {
    /// Binds `addr` and starts answering
    pub fn bind<P: ProtocolPeer>(addr: SocketAddr, peer: P, config: EmulatorConfig) -> Result<Self> {
        config.validate()?;

        let transport = Transport::bind(addr)?;
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let task = tokio::spawn(serve(
            transport.clone(),
            peer,
            config.drop_rate,
            rng,
            shared.clone(),
            cancel.clone(),
        ));
        info!("Emulator listening on {}", transport.local_addr()?);

        Ok(Emulator {
            transport,
            shared,
            _guard: cancel.clone().drop_guard(),
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Drops every inbound datagram while set
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    /// Every request received so far, in arrival order
    pub fn received(&self) -> Vec<ReceivedCommand> {
        self.shared.log().clone()
    }

    /// Requests that reached the peer
    pub fn handled(&self) -> Vec<String> {
        self.shared
            .log()
            .iter()
            .filter(|r| !r.dropped)
            .map(|r| r.request.clone())
            .collect()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Emulator task ended abnormally: {}", e);
        }
    }
}

async fn serve<P: ProtocolPeer>(
    transport: Transport,
    mut peer: P,
    drop_rate: f64,
    mut rng: StdRng,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, source) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.recv(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("Emulator receive failed: {}", e);
                    continue;
                }
            },
        };

        let at = Instant::now();
        let request = String::from_utf8_lossy(&buf[..len]).trim().to_string();
        let dropped = shared.muted.load(Ordering::Relaxed)
            || (drop_rate > 0.0 && rng.gen_bool(drop_rate));
        shared.log().push(ReceivedCommand {
            source,
            request: request.clone(),
            at,
            dropped,
        });
        if dropped {
            debug!("Emulator dropped {:?} from {}", request, source);
            continue;
        }

        for response in peer.respond(&request, at) {
            trace!("Emulator answers {} with {:?}", source, response);
            if let Err(e) = transport.send(source, response.as_bytes()).await {
                warn!("Emulator reply to {} failed: {}", source, e);
            }
        }
    }

    debug!("Emulator stopped");
}
