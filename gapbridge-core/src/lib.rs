//! gapbridge core - protocol proxies across a one-cable air gap
//!
//! Two bridge processes face each other over a dedicated link (raw
//! Ethernet in production, UDP for testing). Side A accepts FTP, SFTP and
//! PostgreSQL clients; side B opens the matching backend connections. All
//! bytes in between travel as AES-256-GCM sealed [`frame::SecureFrame`]s,
//! and every command, query and payload is inspected on the way.

pub mod audit;
pub mod bridge;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod inspect;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod stats;
pub mod transport;

// Re-export commonly used types
pub use audit::{AuditAction, AuditEvent, AuditLogger};
pub use bridge::Bridge;
pub use config::{BridgeConfig, Side};
pub use crypto::CryptoEngine;
pub use error::{Error, Result};
pub use frame::{FrameFlags, ProtocolFamily, ProtocolTag, SecureFrame};
pub use inspect::{ContentScanner, Inspector, Verdict};
pub use retry::RetryPolicy;
pub use session::{SessionId, SessionManager};
pub use transport::{MemoryLink, Transceiver};

/// Frame format version carried in every header
pub const PROTOCOL_VERSION: u8 = frame::FRAME_VERSION;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_constants() {
        assert_eq!(PROTOCOL_VERSION, 1);
        assert_eq!(frame::HEADER_SIZE, 35);
        assert!(transport::ETHERNET_MTU > frame::FRAME_OVERHEAD);
    }
}
