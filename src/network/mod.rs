//! Network layer: the shared UDP socket and everything routed through it
//!
//! One [`Transport`] carries every station session, discovery run and
//! emulated station. Inbound datagrams go to the [`Dispatcher`], which
//! classifies them and hands them to the owning session without blocking.

mod dispatcher;
pub mod discovery;
mod interfaces;
mod transport;

pub use self::discovery::{DiscoveredStation, DiscoveryConfig, DiscoveryResult};
pub use self::dispatcher::{Dispatcher, Sighting};
pub use self::interfaces::{broadcast_targets, directed_broadcast};
pub use self::transport::{Datagram, Transport};
