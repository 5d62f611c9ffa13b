//! In-process link

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{check_frame_size, take_receiver, Transceiver, ETHERNET_MTU};
use crate::error::{Error, Result};

/// Frames queued per direction before `send` waits
const QUEUE_DEPTH: usize = 1024;

/// One end of a connected in-memory link.
///
/// Frames sent on one end come out of the other end's receive stream in
/// order and without loss. The frame size limit mirrors an Ethernet link
/// so chunking paths behave as they would on the wire.
pub struct MemoryLink {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    mtu: usize,
}

impl MemoryLink {
    pub fn pair() -> (MemoryLink, MemoryLink) {
        Self::pair_with_mtu(ETHERNET_MTU)
    }

    pub fn pair_with_mtu(mtu: usize) -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = mpsc::channel(QUEUE_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(QUEUE_DEPTH);
        (
            MemoryLink {
                outbound: a_tx,
                inbound: Mutex::new(Some(a_rx)),
                mtu,
            },
            MemoryLink {
                outbound: b_tx,
                inbound: Mutex::new(Some(b_rx)),
                mtu,
            },
        )
    }
}

#[async_trait]
impl Transceiver for MemoryLink {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        check_frame_size(frame.len(), self.mtu)?;
        self.outbound
            .send(frame.to_vec())
            .await
            .map_err(|_| Error::Transport("memory link peer dropped".to_string()))?;
        trace!(bytes = frame.len(), "memory link send");
        Ok(())
    }

    fn receive_stream(&self) -> BoxStream<'static, Vec<u8>> {
        take_receiver(&self.inbound, self.name())
    }

    fn max_frame_size(&self) -> usize {
        self.mtu
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryLink::pair();
        let mut inbound = b.receive_stream();

        for i in 0u8..10 {
            a.send(&[i; 4]).await.unwrap();
        }
        for i in 0u8..10 {
            assert_eq!(inbound.next().await.unwrap(), vec![i; 4]);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, _b) = MemoryLink::pair_with_mtu(64);
        let err = a.send(&[0u8; 65]).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { size: 65, limit: 64 }));
        assert!(!err.is_transient());
        assert!(a.send(&[0u8; 64]).await.is_ok());
    }

    #[tokio::test]
    async fn test_receive_stream_single_consumer() {
        let (a, b) = MemoryLink::pair();
        let _first = b.receive_stream();
        let mut second = b.receive_stream();
        a.send(b"x").await.unwrap();
        assert!(second.next().await.is_none());
    }

    #[tokio::test]
    async fn test_send_fails_after_peer_dropped() {
        let (a, b) = MemoryLink::pair();
        drop(b);
        assert!(a.send(b"lost").await.unwrap_err().is_transient());
    }
}
