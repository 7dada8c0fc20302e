//! Datagram feed adapter.

use crate::broker::Broker;
use tokio::net::UdpSocket;

/// Larger than any frame the feed emits.
const MAX_DATAGRAM: usize = 2048;

/// Hand every datagram to the broker. Receive errors are logged, not fatal.
pub async fn serve(socket: UdpSocket, broker: Broker) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => broker.ingest_datagram(&buf[..len], from).await,
            Err(e) => tracing::warn!("Datagram receive error: {}", e),
        }
    }
}
