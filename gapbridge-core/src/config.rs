//! Bridge configuration
//!
//! Loaded once at startup from TOML. A minimal side A file:
//!
//! ```toml
//! side = "client"
//!
//! [link]
//! kind = "ethernet"
//! interface = "eth1"
//! peer_mac = "02:00:00:00:00:0b"
//!
//! [crypto]
//! password = "correct horse battery staple"
//! salt = "4f1c...32 bytes hex..."
//!
//! [ftp]
//! listen = "0.0.0.0:21"
//! ```
//!
//! Side B carries `backend = "host:port"` in each protocol section instead
//! of `listen`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::CryptoEngine;
use crate::error::{Error, Result};
use crate::frame::ProtocolFamily;
use crate::inspect::{Inspector, SignatureScanner};
use crate::retry::RetryPolicy;
use crate::transport::{ethernet, EthernetTransceiver, Transceiver, UdpTransceiver, DEFAULT_ETHERTYPE};

/// Default idle timeout before a session is evicted
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default interval between statistics log lines
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// Default grace period for sessions to finish on shutdown
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;

/// Which end of the link this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Terminates client TCP connections
    Client,
    /// Opens connections to the real servers
    Backend,
}

impl Side {
    /// Name used in logs and audit records
    pub fn label(self) -> &'static str {
        match self {
            Side::Client => "side-a",
            Side::Backend => "side-b",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Physical link selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LinkConfig {
    Ethernet {
        /// Interface name, e.g. `eth1`
        interface: String,
        /// MAC address of the other bridge side
        peer_mac: String,
        #[serde(default = "default_ethertype")]
        ethertype: u16,
    },
    Udp {
        bind: SocketAddr,
        peer: SocketAddr,
    },
}

fn default_ethertype() -> u16 {
    DEFAULT_ETHERTYPE
}

impl LinkConfig {
    pub async fn open(&self) -> Result<Arc<dyn Transceiver>> {
        match self {
            LinkConfig::Ethernet {
                interface,
                peer_mac,
                ethertype,
            } => {
                let peer = ethernet::parse_mac(peer_mac)?;
                Ok(Arc::new(EthernetTransceiver::open(interface, peer, *ethertype)?))
            }
            LinkConfig::Udp { bind, peer } => Ok(Arc::new(UdpTransceiver::bind(*bind, *peer).await?)),
        }
    }
}

fn in_section(section: &str, err: Error) -> Error {
    match err {
        Error::Config(_) => err,
        other => Error::Config(format!("[{}] {}", section, other)),
    }
}

/// Master key source. Exactly one of the three forms must be given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Shared passphrase, needs `salt` so both sides derive the same key
    pub password: Option<String>,
    /// Hex encoded PBKDF2 salt
    pub salt: Option<String>,
    /// Key file written by `gapbridge-tools keygen`
    pub key_file: Option<PathBuf>,
    /// Password protecting `key_file`
    pub key_password: Option<String>,
    /// Raw 32-byte key, hex encoded
    pub key: Option<String>,
}

impl CryptoConfig {
    fn sources(&self) -> usize {
        [self.password.is_some(), self.key_file.is_some(), self.key.is_some()]
            .iter()
            .filter(|set| **set)
            .count()
    }

    fn validate(&self) -> Result<()> {
        match self.sources() {
            1 => {}
            0 => return Err(Error::Config("[crypto] needs one of password, key_file or key".into())),
            _ => {
                return Err(Error::Config(
                    "[crypto] password, key_file and key are mutually exclusive".into(),
                ))
            }
        }
        if self.password.is_some() && self.salt.is_none() {
            return Err(Error::Config("[crypto] password requires a shared salt".into()));
        }
        if self.key_file.is_some() && self.key_password.is_none() {
            return Err(Error::Config("[crypto] key_file requires key_password".into()));
        }
        Ok(())
    }

    /// Build the engine. Every failure, including an unreadable key file or
    /// a wrong key password, is reported as a configuration error.
    pub fn build_engine(&self) -> Result<CryptoEngine> {
        self.validate()?;
        self.open_engine().map_err(|e| in_section("crypto", e))
    }

    fn open_engine(&self) -> Result<CryptoEngine> {
        if let Some(password) = &self.password {
            let salt = self
                .salt
                .as_deref()
                .map(hex::decode)
                .transpose()
                .map_err(|e| Error::Config(format!("[crypto] salt is not valid hex: {}", e)))?;
            return CryptoEngine::from_password(password, salt.as_deref());
        }
        if let (Some(path), Some(password)) = (&self.key_file, &self.key_password) {
            return CryptoEngine::load_from_file(path, password);
        }
        if let Some(key) = &self.key {
            let bytes = zeroize::Zeroizing::new(
                hex::decode(key.trim())
                    .map_err(|e| Error::Config(format!("[crypto] key is not valid hex: {}", e)))?,
            );
            return CryptoEngine::from_key(&bytes);
        }
        Err(Error::Config("[crypto] no key source".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub stats_interval_secs: u64,
    pub drain_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: crate::retry::DEFAULT_INITIAL_DELAY.as_millis() as u64,
            max_delay_ms: crate::retry::DEFAULT_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// Extra signature rules on top of the built-in set
    pub signature_file: Option<PathBuf>,
}

impl InspectionConfig {
    pub fn build_inspector(&self) -> Result<Inspector> {
        let inspector = match &self.signature_file {
            Some(path) => SignatureScanner::from_file(path).and_then(|scanner| Inspector::new(Arc::new(scanner))),
            None => Inspector::with_defaults(),
        };
        inspector.map_err(|e| in_section("inspection", e))
    }
}

/// One proxied protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Client-facing listener (side A)
    pub listen: Option<SocketAddr>,
    /// Real server, `host:port` (side B)
    pub backend: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtpConfig {
    pub listen: Option<SocketAddr>,
    pub backend: Option<String>,
    /// Address passive data listeners bind to on side A
    #[serde(default = "default_data_bind")]
    pub data_bind: IpAddr,
    /// Address advertised to clients in `227` replies; defaults to the
    /// local address of the control connection
    pub advertise_ip: Option<Ipv4Addr>,
}

fn default_data_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl FtpConfig {
    pub fn proxy(&self) -> ProxyConfig {
        ProxyConfig {
            listen: self.listen,
            backend: self.backend.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub side: Side,
    pub link: LinkConfig,
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub inspection: InspectionConfig,
    pub ftp: Option<FtpConfig>,
    pub sftp: Option<ProxyConfig>,
    pub postgres: Option<ProxyConfig>,
}

impl BridgeConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded {} configuration from {}", config.side, path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Configured protocol sections, in a fixed order
    pub fn proxies(&self) -> Vec<(ProtocolFamily, ProxyConfig)> {
        let mut proxies = Vec::new();
        if let Some(ftp) = &self.ftp {
            proxies.push((ProtocolFamily::Ftp, ftp.proxy()));
        }
        if let Some(sftp) = &self.sftp {
            proxies.push((ProtocolFamily::Sftp, sftp.clone()));
        }
        if let Some(postgres) = &self.postgres {
            proxies.push((ProtocolFamily::Postgres, postgres.clone()));
        }
        proxies
    }

    pub fn validate(&self) -> Result<()> {
        self.crypto.validate()?;

        if let LinkConfig::Ethernet { peer_mac, .. } = &self.link {
            ethernet::parse_mac(peer_mac)?;
        }
        if self.session.idle_timeout_secs == 0 {
            return Err(Error::Config("[session] idle_timeout_secs must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("[retry] max_attempts must be at least 1".into()));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config("[retry] initial_delay_ms exceeds max_delay_ms".into()));
        }

        let proxies = self.proxies();
        if proxies.is_empty() {
            return Err(Error::Config("no protocol section ([ftp], [sftp], [postgres]) configured".into()));
        }
        for (family, proxy) in &proxies {
            match self.side {
                Side::Client if proxy.listen.is_none() => {
                    return Err(Error::Config(format!("[{}] needs listen on the client side", family)))
                }
                Side::Backend if proxy.backend.is_none() => {
                    return Err(Error::Config(format!("[{}] needs backend on the backend side", family)))
                }
                _ => {}
            }
        }
        Ok(())
    }
}
