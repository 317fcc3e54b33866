use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::Dispatcher;
use crate::core::{Error, Result, MAX_DATAGRAM_SIZE};

/// An inbound datagram as seen by the dispatcher
#[derive(Debug, Clone)]
pub struct Datagram {
    pub source: SocketAddr,
    pub payload: Bytes,
    pub received_at: Instant,
    pub timestamp: DateTime<Utc>,
}

/// The single UDP socket every station, discovery run and emulator peer goes through
#[derive(Debug, Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
}

impl Transport {
    /// Binds the socket with broadcast enabled
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::transport(format!("Failed to create socket: {}", e)))?;
        socket
            .set_reuse_address(true)
            .and_then(|_| socket.set_broadcast(true))
            .and_then(|_| socket.set_nonblocking(true))
            .map_err(|e| Error::transport(format!("Failed to configure socket: {}", e)))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::transport(format!("Failed to bind {}: {}", addr, e)))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| Error::transport(format!("Failed to register socket: {}", e)))?;
        let transport = Transport {
            socket: Arc::new(socket),
        };
        info!("Listening on {}", transport.local_addr()?);
        Ok(transport)
    }

    /// Returns the local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::transport(format!("Failed to get local address: {}", e)))
    }

    /// Sends one datagram; a failure is returned to the caller, nothing is retried here
    pub async fn send(&self, target: SocketAddr, payload: &[u8]) -> Result<()> {
        let sent = self
            .socket
            .send_to(payload, target)
            .await
            .map_err(|e| Error::transport(format!("Failed to send to {}: {}", target, e)))?;
        if sent != payload.len() {
            return Err(Error::transport(format!(
                "Short send to {}: {} of {} bytes",
                target,
                sent,
                payload.len()
            )));
        }
        trace!("-> {} {:?}", target, String::from_utf8_lossy(payload));
        Ok(())
    }

    /// Waits for the next datagram
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await.map_err(Error::from)
    }

    /// Feeds every inbound datagram to the dispatcher until cancelled
    pub fn spawn_receiver(
        &self,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move { transport.receive_loop(dispatcher, cancel).await })
    }

    async fn receive_loop(self, dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.recv(&mut buf) => match received {
                    Ok((len, source)) => {
                        let payload = Bytes::copy_from_slice(&buf[..len]);
                        trace!("<- {} {:?}", source, String::from_utf8_lossy(&payload));
                        dispatcher.dispatch(Datagram {
                            source,
                            payload,
                            received_at: Instant::now(),
                            timestamp: Utc::now(),
                        });
                    }
                    // ICMP port unreachable surfaces here on some platforms
                    Err(e) => warn!("Receive failed: {}", e),
                },
            }
        }

        debug!("Receive loop stopped");
    }
}
