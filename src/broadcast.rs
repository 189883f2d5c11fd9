use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Periodically announce the master's HTTP port on the local network so
/// slaves can find it without configuration.
pub struct PortBroadcaster {
    listen_port: u16,
    target: SocketAddr,
    interval: Duration,
}

impl PortBroadcaster {
    pub fn new(listen_port: u16, broadcast_port: u16, interval: Duration) -> Self {
        Self {
            listen_port,
            target: SocketAddr::from((Ipv4Addr::BROADCAST, broadcast_port)),
            interval,
        }
    }

    /// The datagram payload: the port number in decimal.
    pub fn payload(&self) -> Vec<u8> {
        self.listen_port.to_string().into_bytes()
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!(error = %e, "Failed to bind broadcast socket");
                return;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            tracing::error!(error = %e, "Failed to enable broadcast");
            return;
        }

        let payload = self.payload();
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match socket.send_to(&payload, self.target).await {
                        Ok(_) => tracing::debug!(addr = %self.target, port = self.listen_port, "Broadcast master port"),
                        Err(e) => tracing::warn!(addr = %self.target, error = %e, "Broadcast failed"),
                    }
                }
            }
        }
    }
}
