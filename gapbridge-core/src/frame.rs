//! SecureFrame wire format
//!
//! ```text
//! +---------+------------+----------+-----------+----------+-------+----------------------------+
//! | version | session_id | sequence | timestamp | protocol | flags | nonce || ciphertext || tag |
//! | 1 byte  | 16 bytes   | 8 bytes  | 8 bytes   | 1 byte   | 1 byte| 12 + n + 16 bytes          |
//! +---------+------------+----------+-----------+----------+-------+----------------------------+
//! ```
//!
//! The 35-byte header travels in clear and is bound to the ciphertext as
//! AEAD associated data, so a receiver can route on it before decrypting
//! and any header tampering fails verification.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoEngine, CIPHERTEXT_OVERHEAD};
use crate::error::{Error, Result};
use crate::session::SessionId;

/// Current wire format version
pub const FRAME_VERSION: u8 = 1;

/// Clear-text header size
pub const HEADER_SIZE: usize = 35;

/// Total bytes a frame adds on top of its payload
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CIPHERTEXT_OVERHEAD;

/// Marker payload for open/close control frames (encryption rejects empty input)
pub const CONTROL_MARKER: &[u8] = &[0x00];

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_FRAGMENTED: u8 = 0x02;
pub const FLAG_OPEN: u8 = 0x04;
pub const FLAG_CLOSE: u8 = 0x08;
const KNOWN_FLAGS: u8 = FLAG_COMPRESSED | FLAG_FRAGMENTED | FLAG_OPEN | FLAG_CLOSE;

/// Dispatch tag carried by every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtocolTag {
    FtpControl = 0x01,
    FtpData = 0x02,
    SftpControl = 0x10,
    SftpData = 0x11,
    PostgresStartup = 0x20,
    PostgresQuery = 0x21,
    PostgresData = 0x22,
    PostgresResponse = 0x23,
}

impl TryFrom<u8> for ProtocolTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ProtocolTag::FtpControl),
            0x02 => Ok(ProtocolTag::FtpData),
            0x10 => Ok(ProtocolTag::SftpControl),
            0x11 => Ok(ProtocolTag::SftpData),
            0x20 => Ok(ProtocolTag::PostgresStartup),
            0x21 => Ok(ProtocolTag::PostgresQuery),
            0x22 => Ok(ProtocolTag::PostgresData),
            0x23 => Ok(ProtocolTag::PostgresResponse),
            other => Err(Error::UnknownProtocol(other)),
        }
    }
}

/// Proxy family a tag belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    Ftp,
    Sftp,
    Postgres,
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolFamily::Ftp => write!(f, "ftp"),
            ProtocolFamily::Sftp => write!(f, "sftp"),
            ProtocolFamily::Postgres => write!(f, "postgres"),
        }
    }
}

impl ProtocolFamily {
    /// Tag carried by open/close frames of a control session
    pub fn control_tag(self) -> ProtocolTag {
        match self {
            ProtocolFamily::Ftp => ProtocolTag::FtpControl,
            ProtocolFamily::Sftp => ProtocolTag::SftpControl,
            ProtocolFamily::Postgres => ProtocolTag::PostgresData,
        }
    }
}

impl ProtocolTag {
    pub fn family(self) -> ProtocolFamily {
        match self {
            ProtocolTag::FtpControl | ProtocolTag::FtpData => ProtocolFamily::Ftp,
            ProtocolTag::SftpControl | ProtocolTag::SftpData => ProtocolFamily::Sftp,
            ProtocolTag::PostgresStartup
            | ProtocolTag::PostgresQuery
            | ProtocolTag::PostgresData
            | ProtocolTag::PostgresResponse => ProtocolFamily::Postgres,
        }
    }

    /// FTP data channels are tracked apart from every control stream.
    pub fn is_data_channel(self) -> bool {
        self == ProtocolTag::FtpData
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags {
    /// Reserved: compressed payload
    pub compressed: bool,
    /// Reserved: payload is a fragment
    pub fragmented: bool,
    /// Peer should open the session's downstream connection
    pub open: bool,
    /// Origin side's downstream connection closed
    pub close: bool,
}

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags {
        compressed: false,
        fragmented: false,
        open: false,
        close: false,
    };

    pub fn open() -> Self {
        Self { open: true, ..Self::NONE }
    }

    pub fn close() -> Self {
        Self { close: true, ..Self::NONE }
    }

    pub fn is_control(&self) -> bool {
        self.open || self.close
    }
}

impl TryFrom<u8> for FrameFlags {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        if value & !KNOWN_FLAGS != 0 {
            return Err(Error::Malformed(format!("unknown frame flags 0x{:02x}", value)));
        }
        Ok(Self {
            compressed: value & FLAG_COMPRESSED != 0,
            fragmented: value & FLAG_FRAGMENTED != 0,
            open: value & FLAG_OPEN != 0,
            close: value & FLAG_CLOSE != 0,
        })
    }
}

impl From<FrameFlags> for u8 {
    fn from(flags: FrameFlags) -> Self {
        let mut value = 0u8;
        if flags.compressed {
            value |= FLAG_COMPRESSED;
        }
        if flags.fragmented {
            value |= FLAG_FRAGMENTED;
        }
        if flags.open {
            value |= FLAG_OPEN;
        }
        if flags.close {
            value |= FLAG_CLOSE;
        }
        value
    }
}

/// Clear-text part of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub session_id: SessionId,
    pub sequence: u64,
    pub timestamp: i64,
    pub protocol: ProtocolTag,
    pub flags: FrameFlags,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1..17].copy_from_slice(self.session_id.as_bytes());
        buf[17..25].copy_from_slice(&self.sequence.to_be_bytes());
        buf[25..33].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[33] = self.protocol as u8;
        buf[34] = self.flags.into();
        buf
    }

    /// Parse the header, checking length and version before anything else.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Malformed(format!(
                "frame too short: {} < {}",
                data.len(),
                HEADER_SIZE
            )));
        }

        let version = data[0];
        if version != FRAME_VERSION {
            return Err(Error::VersionMismatch {
                expected: FRAME_VERSION,
                actual: version,
            });
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&data[1..17]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&data[17..25]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&data[25..33]);

        Ok(Self {
            version,
            session_id: SessionId::from_bytes(id),
            sequence: u64::from_be_bytes(sequence),
            timestamp: i64::from_be_bytes(timestamp),
            protocol: ProtocolTag::try_from(data[33])?,
            flags: FrameFlags::try_from(data[34])?,
        })
    }
}

/// Unit of transport across the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureFrame {
    pub version: u8,
    pub session_id: SessionId,
    pub sequence: u64,
    pub timestamp: i64,
    pub protocol: ProtocolTag,
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
}

impl SecureFrame {
    /// Create a data frame stamped with the current time
    pub fn new(session_id: SessionId, sequence: u64, protocol: ProtocolTag, payload: Vec<u8>) -> Self {
        Self {
            version: FRAME_VERSION,
            session_id,
            sequence,
            timestamp: now_nanos(),
            protocol,
            flags: FrameFlags::NONE,
            payload,
        }
    }

    /// Create an open/close control frame
    pub fn control(session_id: SessionId, sequence: u64, protocol: ProtocolTag, flags: FrameFlags) -> Self {
        Self {
            flags,
            ..Self::new(session_id, sequence, protocol, CONTROL_MARKER.to_vec())
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            version: self.version,
            session_id: self.session_id,
            sequence: self.sequence,
            timestamp: self.timestamp,
            protocol: self.protocol,
            flags: self.flags,
        }
    }

    /// Encode the header and seal the payload with the header as associated data.
    pub fn serialize(&self, engine: &CryptoEngine) -> Result<Vec<u8>> {
        let header = self.header().to_bytes();
        let sealed = engine.encrypt(&self.payload, Some(&header))?;

        let mut buffer = Vec::with_capacity(HEADER_SIZE + sealed.len());
        buffer.extend_from_slice(&header);
        buffer.extend_from_slice(&sealed);
        Ok(buffer)
    }

    /// Decode and verify a frame. Any failure means the frame must be dropped.
    pub fn deserialize(data: &[u8], engine: &CryptoEngine) -> Result<Self> {
        let header = FrameHeader::from_bytes(data)?;
        let payload = engine.decrypt(&data[HEADER_SIZE..], Some(&data[..HEADER_SIZE]))?;

        Ok(Self {
            version: header.version,
            session_id: header.session_id,
            sequence: header.sequence,
            timestamp: header.timestamp,
            protocol: header.protocol,
            flags: header.flags,
            payload,
        })
    }

    /// Read the unauthenticated header without decrypting, for logging only.
    pub fn peek_header(data: &[u8]) -> Result<FrameHeader> {
        FrameHeader::from_bytes(data)
    }
}

/// Unix time in nanoseconds
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
