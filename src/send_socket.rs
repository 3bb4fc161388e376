use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Abstraction for sending a datagram, introduced to facilitate mocking the
/// I/O part away for engine tests.
///
/// Send errors are logged and swallowed: this is a datagram transport, a lost
/// send is indistinguishable from a lost packet on the wire.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) {
        trace!("sending {} byte datagram to {:?}", packet.len(), to);

        if let Err(e) = self.send_to(packet, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}
