//! Datagram stand-in for the Ethernet link

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use super::{check_frame_size, Transceiver, ETHERNET_MTU};
use crate::error::{Error, Result};

/// Largest datagram accepted on receive
const RECV_BUFFER: usize = 65_536;

/// Pause after a failed receive
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Consecutive receive failures after which the link is considered gone
const MAX_RECV_ERRORS: u32 = 100;

/// Counts consecutive receive failures. A successful receive resets it.
#[derive(Debug, Default)]
struct RecvErrors {
    consecutive: u32,
}

impl RecvErrors {
    /// Record a failure; `false` once the budget is spent.
    fn record(&mut self, err: &std::io::Error) -> bool {
        self.consecutive += 1;
        if self.consecutive >= MAX_RECV_ERRORS {
            warn!("UDP link receive failed {} times in a row: {}", self.consecutive, err);
            return false;
        }
        debug!("UDP link receive failed, continuing: {}", err);
        true
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Point-to-point UDP link.
///
/// Only datagrams from the configured peer are accepted. Frames are capped
/// at the Ethernet MTU so a lab setup behaves like the real medium.
pub struct UdpTransceiver {
    /// Shared with the receive stream
    socket: Arc<UdpSocket>,
    /// Address of the other bridge side
    peer: SocketAddr,
    /// Largest frame handed to `send`
    mtu: usize,
}

impl UdpTransceiver {
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::Transport(format!("binding UDP link on {}: {}", local, e)))?;
        info!("UDP link bound to {} (peer {})", socket.local_addr()?, peer);

        Ok(Self {
            socket: Arc::new(socket),
            peer,
            mtu: ETHERNET_MTU,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transceiver for UdpTransceiver {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        check_frame_size(frame.len(), self.mtu)?;
        self.socket
            .send_to(frame, self.peer)
            .await
            .map_err(|e| Error::Transport(format!("UDP send to {} failed: {}", self.peer, e)))?;
        trace!("Sent {} bytes to {}", frame.len(), self.peer);
        Ok(())
    }

    fn receive_stream(&self) -> BoxStream<'static, Vec<u8>> {
        let socket = Arc::clone(&self.socket);
        let peer = self.peer;

        stream::unfold((socket, RecvErrors::default()), move |(socket, mut errors)| async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) if from == peer => {
                        errors.reset();
                        buf.truncate(len);
                        return Some((buf, (socket, errors)));
                    }
                    Ok((len, from)) => {
                        warn!("Dropped {} byte datagram from unexpected source {}", len, from);
                    }
                    Err(e) => {
                        if !errors.record(&e) {
                            return None;
                        }
                        tokio::time::sleep(RECV_ERROR_PAUSE).await;
                    }
                }
            }
        })
        .boxed()
    }

    fn max_frame_size(&self) -> usize {
        self.mtu
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

impl std::fmt::Debug for UdpTransceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransceiver")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound_pair() -> (UdpTransceiver, UdpTransceiver) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());
        (
            UdpTransceiver { socket: Arc::new(a), peer: b_addr, mtu: ETHERNET_MTU },
            UdpTransceiver { socket: Arc::new(b), peer: a_addr, mtu: ETHERNET_MTU },
        )
    }

    #[tokio::test]
    async fn test_udp_link_round_trip() {
        let (a, b) = bound_pair().await;
        let mut inbound = b.receive_stream();

        a.send(b"frame one").await.unwrap();
        assert_eq!(inbound.next().await.unwrap(), b"frame one".to_vec());
    }

    #[tokio::test]
    async fn test_foreign_datagrams_ignored() {
        let (a, b) = bound_pair().await;
        let mut inbound = b.receive_stream();

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"spoofed", b.local_addr().unwrap()).await.unwrap();
        a.send(b"genuine").await.unwrap();

        assert_eq!(inbound.next().await.unwrap(), b"genuine".to_vec());
    }

    #[tokio::test]
    async fn test_udp_mtu_enforced() {
        let (a, _b) = bound_pair().await;
        let err = a.send(&vec![0u8; ETHERNET_MTU + 1]).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_receive_errors_tolerated_until_budget() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let mut errors = RecvErrors::default();
        for _ in 1..MAX_RECV_ERRORS {
            assert!(errors.record(&err));
        }
        errors.reset();
        assert!(errors.record(&err));

        let mut errors = RecvErrors::default();
        assert!((1..MAX_RECV_ERRORS).all(|_| errors.record(&err)));
        assert!(!errors.record(&err));
    }
}
