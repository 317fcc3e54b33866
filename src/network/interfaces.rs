use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::SockaddrStorage;
use tracing::debug;

use crate::core::{Error, Result};

fn ipv4(addr: Option<&SockaddrStorage>) -> Option<Ipv4Addr> {
    addr.and_then(|addr| addr.as_sockaddr_in())
        .map(|sin| Ipv4Addr::from(sin.ip()))
}

/// Broadcast address of a network given one host address and its mask
pub fn directed_broadcast(addr: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(netmask))
}

/// Broadcast addresses of every non-loopback IPv4 interface, on `port`
pub fn broadcast_targets(port: u16) -> Result<Vec<SocketAddr>> {
    let interfaces = getifaddrs()
        .map_err(|e| Error::transport(format!("Failed to enumerate interfaces: {}", e)))?;

    let mut targets: Vec<SocketAddr> = Vec::new();
    for interface in interfaces {
        if !interface.flags.contains(InterfaceFlags::IFF_BROADCAST)
            || interface.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let Some(addr) = ipv4(interface.address.as_ref()) else {
            continue;
        };

        let broadcast = ipv4(interface.broadcast.as_ref())
            .or_else(|| ipv4(interface.netmask.as_ref()).map(|mask| directed_broadcast(addr, mask)));
        if let Some(broadcast) = broadcast {
            let target = SocketAddr::V4(SocketAddrV4::new(broadcast, port));
            if !targets.contains(&target) {
                debug!("Broadcasting on {} via {}", interface.interface_name, target);
                targets.push(target);
            }
        }
    }

    if targets.is_empty() {
        return Err(Error::transport("no broadcast-capable IPv4 interface found"));
    }
    Ok(targets)
}
