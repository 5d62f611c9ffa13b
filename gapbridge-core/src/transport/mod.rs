//! Link transceivers
//!
//! The bridge only needs two things from the physical medium: hand it one
//! serialized frame, and get back an endless stream of frames from the
//! peer. Delivery may lose or reorder frames; nothing above this layer
//! assumes otherwise.
//!
//! ```text
//!   Bridge ──send(&[u8])──► Transceiver ──► medium ──► Transceiver ──receive_stream()──► Bridge
//! ```
//!
//! Implementations:
//! - [`MemoryLink`]: connected in-process pair, used by tests
//! - [`UdpTransceiver`]: point-to-point datagram link for lab setups
//! - [`EthernetTransceiver`]: raw Ethernet frames with a private EtherType

pub mod ethernet;
pub mod memory;
pub mod udp;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub use ethernet::EthernetTransceiver;
pub use memory::MemoryLink;
pub use udp::UdpTransceiver;

/// Payload capacity of a standard Ethernet frame
pub const ETHERNET_MTU: usize = 1500;

/// Local experimental EtherType used for bridge traffic
pub const DEFAULT_ETHERTYPE: u16 = 0x88B5;

/// Narrow contract between the bridge and the physical medium
#[async_trait]
pub trait Transceiver: Send + Sync {
    /// Hand one serialized frame to the medium.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Inbound frames until the medium closes.
    ///
    /// A transceiver has a single consumer: only the first call yields
    /// frames, later calls get an empty stream.
    fn receive_stream(&self) -> BoxStream<'static, Vec<u8>>;

    /// Largest serialized frame `send` accepts
    fn max_frame_size(&self) -> usize;

    /// Short name for logs
    fn name(&self) -> &'static str {
        "link"
    }
}

/// Reject frames larger than `limit`. Never transient: resending the same
/// frame cannot succeed.
pub(crate) fn check_frame_size(len: usize, limit: usize) -> Result<()> {
    if len > limit {
        return Err(Error::FrameTooLarge { size: len, limit });
    }
    Ok(())
}

/// Turn a channel receiver into a boxed frame stream
pub(crate) fn channel_stream(rx: mpsc::Receiver<Vec<u8>>) -> BoxStream<'static, Vec<u8>> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|frame| (frame, rx)) }).boxed()
}

/// Take the receiver out of its slot, warning when it was already taken
pub(crate) fn take_receiver(
    slot: &parking_lot::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    name: &str,
) -> BoxStream<'static, Vec<u8>> {
    match slot.lock().take() {
        Some(rx) => channel_stream(rx),
        None => {
            tracing::warn!(transceiver = name, "receive stream already taken");
            stream::empty().boxed()
        }
    }
}
