//! Raw Ethernet transceiver
//!
//! Frames travel as the payload of Ethernet II frames carrying a private
//! EtherType, addressed to the peer's MAC. The datalink channel is
//! blocking, so one OS thread sends and one receives; tokio channels
//! connect them to the async side.
//!
//! Short Ethernet frames are padded by the NIC, so each payload starts
//! with a 2-byte big-endian length to strip the padding on receipt.

use std::str::FromStr;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::ethernet::{EtherType, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::{check_frame_size, take_receiver, Transceiver, ETHERNET_MTU};
use crate::error::{Error, Result};

const ETHERNET_HEADER_LEN: usize = 14;
const LENGTH_PREFIX: usize = 2;
const QUEUE_DEPTH: usize = 1024;

/// How often the receive thread wakes up to notice shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(200);

pub fn parse_mac(text: &str) -> Result<MacAddr> {
    MacAddr::from_str(text).map_err(|e| Error::Config(format!("invalid MAC address {}: {:?}", text, e)))
}

/// Prefix `frame` with its length
fn encode_link_payload(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX + frame.len());
    out.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    out.extend_from_slice(frame);
    out
}

/// Strip the length prefix and any trailing pad bytes
fn decode_link_payload(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() < LENGTH_PREFIX {
        return None;
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    payload.get(LENGTH_PREFIX..LENGTH_PREFIX + len)
}

pub struct EthernetTransceiver {
    interface: String,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl EthernetTransceiver {
    /// Open a datalink channel on `interface_name`. Needs CAP_NET_RAW.
    pub fn open(interface_name: &str, peer: MacAddr, ethertype: u16) -> Result<Self> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface: &NetworkInterface| iface.name == interface_name)
            .ok_or_else(|| Error::Config(format!("network interface {} not found", interface_name)))?;
        let local = interface
            .mac
            .ok_or_else(|| Error::Config(format!("interface {} has no MAC address", interface_name)))?;

        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        let (tx, rx) = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                return Err(Error::Transport(format!(
                    "unsupported channel type on {}",
                    interface_name
                )))
            }
            Err(e) => {
                return Err(Error::Transport(format!(
                    "opening datalink channel on {}: {}",
                    interface_name, e
                )))
            }
        };

        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let ethertype = EtherType::new(ethertype);

        thread::Builder::new()
            .name(format!("eth-tx-{}", interface_name))
            .spawn(move || send_loop(tx, out_rx, local, peer, ethertype))?;
        thread::Builder::new()
            .name(format!("eth-rx-{}", interface_name))
            .spawn(move || receive_loop(rx, in_tx, peer, ethertype))?;

        info!(
            "Ethernet link on {} ({} -> {}, ethertype 0x{:04x})",
            interface_name, local, peer, ethertype.0
        );

        Ok(Self {
            interface: interface_name.to_string(),
            outbound: out_tx,
            inbound: Mutex::new(Some(in_rx)),
        })
    }
}

fn send_loop(
    mut tx: Box<dyn DataLinkSender>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    local: MacAddr,
    peer: MacAddr,
    ethertype: EtherType,
) {
    while let Some(frame) = frames.blocking_recv() {
        let payload = encode_link_payload(&frame);
        let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + payload.len()];
        let Some(mut packet) = MutableEthernetPacket::new(&mut buffer) else {
            error!("Ethernet buffer too small for {} bytes", payload.len());
            continue;
        };
        packet.set_destination(peer);
        packet.set_source(local);
        packet.set_ethertype(ethertype);
        packet.set_payload(&payload);

        match tx.send_to(packet.packet(), None) {
            Some(Ok(())) => trace!("Sent {} byte frame to {}", frame.len(), peer),
            Some(Err(e)) => warn!("Ethernet send failed: {}", e),
            None => warn!("Ethernet send buffer unavailable"),
        }
    }
    debug!("Ethernet send thread stopped");
}

fn receive_loop(
    mut rx: Box<dyn DataLinkReceiver>,
    frames: mpsc::Sender<Vec<u8>>,
    peer: MacAddr,
    ethertype: EtherType,
) {
    while !frames.is_closed() {
        match rx.next() {
            Ok(raw) => {
                let Some(packet) = EthernetPacket::new(raw) else {
                    continue;
                };
                if packet.get_ethertype() != ethertype || packet.get_source() != peer {
                    continue;
                }
                match decode_link_payload(packet.payload()) {
                    Some(frame) => {
                        if frames.blocking_send(frame.to_vec()).is_err() {
                            break;
                        }
                    }
                    None => warn!("Dropped Ethernet frame with bad length prefix"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("Ethernet receive failed: {}", e);
                thread::sleep(READ_TIMEOUT);
            }
        }
    }
    debug!("Ethernet receive thread stopped");
}

#[async_trait]
impl Transceiver for EthernetTransceiver {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        check_frame_size(frame.len(), self.max_frame_size())?;
        self.outbound
            .send(frame.to_vec())
            .await
            .map_err(|_| Error::Transport(format!("Ethernet send thread on {} stopped", self.interface)))
    }

    fn receive_stream(&self) -> BoxStream<'static, Vec<u8>> {
        take_receiver(&self.inbound, self.name())
    }

    fn max_frame_size(&self) -> usize {
        ETHERNET_MTU - LENGTH_PREFIX
    }

    fn name(&self) -> &'static str {
        "ethernet"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_payload_strips_padding() {
        let mut payload = encode_link_payload(b"abc");
        payload.resize(46, 0);
        assert_eq!(decode_link_payload(&payload), Some(&b"abc"[..]));
    }

    #[test]
    fn test_link_payload_truncated() {
        let mut payload = encode_link_payload(b"abcdef");
        payload.truncate(5);
        assert_eq!(decode_link_payload(&payload), None);
        assert_eq!(decode_link_payload(&[0x01]), None);
    }

    #[test]
    fn test_parse_mac() {
        let mac = parse_mac("02:00:00:aa:bb:cc").unwrap();
        assert_eq!(mac, MacAddr::new(0x02, 0, 0, 0xaa, 0xbb, 0xcc));
        assert!(parse_mac("not-a-mac").is_err());
    }
}
