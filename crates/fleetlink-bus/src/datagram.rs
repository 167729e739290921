//! Bounded-size datagram link for peer beacons.
//!
//! Carries the same `vehicle_data` envelopes as the bus, but addressed by
//! socket address instead of topic. Datagrams are fire-and-forget; the
//! receive side filters by recipient at a higher layer.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc};

use crate::BusError;

/// Maximum payload accepted for a single datagram.
pub const MAX_DATAGRAM: usize = 2000;

/// Receive buffer size; slightly above [`MAX_DATAGRAM`] so an oversized
/// peer datagram is observed (and discarded) rather than truncated.
const RECV_BUFFER: usize = 2048;

/// Queue depth between the socket task and the consumer.
const RECV_QUEUE: usize = 256;

/// A received datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Peer the datagram came from.
    pub source: SocketAddr,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// One UDP endpoint: sends beacons to peers, receives beacons from them.
///
/// Binding spawns a socket task that forwards every received datagram into
/// the returned channel; the task exits when the consumer drops the
/// receiver.
#[derive(Debug, Clone)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
}

impl UdpLink {
    /// Bind a local endpoint and start receiving.
    pub async fn bind(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<Datagram>), BusError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (tx, rx) = mpsc::channel(RECV_QUEUE);

        let recv_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                let (len, source) = match recv_socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(error) => {
                        tracing::warn!(%error, "datagram receive failed, stopping link");
                        break;
                    },
                };
                if len > MAX_DATAGRAM {
                    tracing::debug!(%source, len, "discarding oversized datagram");
                    continue;
                }
                let datagram =
                    Datagram { source, payload: Bytes::copy_from_slice(&buf[..len]) };
                if tx.send(datagram).await.is_err() {
                    // Consumer is gone; nothing left to deliver to.
                    break;
                }
            }
        });

        Ok((Self { socket }, rx))
    }

    /// Local address the link is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one datagram to `peer`.
    pub async fn send_to(&self, peer: SocketAddr, payload: &[u8]) -> Result<(), BusError> {
        if payload.len() > MAX_DATAGRAM {
            return Err(BusError::PayloadTooLarge { size: payload.len(), max: MAX_DATAGRAM });
        }
        self.socket.send_to(payload, peer).await?;
        Ok(())
    }

    /// Send one datagram to every peer in `peers`.
    ///
    /// Delivery failures to individual peers are logged and skipped; loss
    /// is the expected condition on this path.
    pub async fn broadcast(&self, peers: &[SocketAddr], payload: &[u8]) -> Result<(), BusError> {
        if payload.len() > MAX_DATAGRAM {
            return Err(BusError::PayloadTooLarge { size: payload.len(), max: MAX_DATAGRAM });
        }
        for peer in peers {
            if let Err(error) = self.socket.send_to(payload, peer).await {
                tracing::debug!(%peer, %error, "datagram send failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn pair() -> (UdpLink, mpsc::Receiver<Datagram>, UdpLink, mpsc::Receiver<Datagram>) {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (a, a_rx) = UdpLink::bind(local).await.unwrap();
        let (b, b_rx) = UdpLink::bind(local).await.unwrap();
        (a, a_rx, b, b_rx)
    }

    #[tokio::test]
    async fn unicast_delivers_payload() {
        let (a, _a_rx, b, mut b_rx) = pair().await;

        a.send_to(b.local_addr().unwrap(), b"beacon 1").await.unwrap();

        let datagram = b_rx.recv().await.unwrap();
        assert_eq!(datagram.payload, Bytes::from_static(b"beacon 1"));
        assert_eq!(datagram.source, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let (a, _a_rx, b, mut b_rx) = pair().await;
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (c, mut c_rx) = UdpLink::bind(local).await.unwrap();

        let peers = [b.local_addr().unwrap(), c.local_addr().unwrap()];
        a.broadcast(&peers, b"hello all").await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap().payload, Bytes::from_static(b"hello all"));
        assert_eq!(c_rx.recv().await.unwrap().payload, Bytes::from_static(b"hello all"));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (a, _a_rx, b, _b_rx) = pair().await;
        let oversized = vec![0u8; MAX_DATAGRAM + 1];

        let err = a.send_to(b.local_addr().unwrap(), &oversized).await.unwrap_err();
        assert!(matches!(err, BusError::PayloadTooLarge { size, max }
            if size == MAX_DATAGRAM + 1 && max == MAX_DATAGRAM));
    }
}
