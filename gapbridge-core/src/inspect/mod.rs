//! Security inspection gate
//!
//! Every message crossing the bridge passes through an [`Inspector`]:
//! byte-level signature scanning for all protocols, a command policy for
//! FTP control lines and an injection/dangerous-operation policy for SQL.
//! All checks are synchronous, side-effect free apart from logging, and
//! fail closed.

pub mod ftp;
pub mod signature;
pub mod sql;

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::Result;

pub use ftp::FtpCommandPolicy;
pub use signature::SignatureScanner;
pub use sql::SqlPolicy;

/// Outcome of a policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(String),
    Malformed(String),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    /// Reason for a non-accepting verdict
    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Accepted => None,
            Verdict::Rejected(reason) | Verdict::Malformed(reason) => Some(reason),
        }
    }
}

/// Byte-buffer threat scanner.
///
/// This is the seam for an external engine such as YARA. Implementations
/// are shared by every session and must tolerate concurrent calls.
pub trait ContentScanner: Send + Sync {
    /// Name of the matched rule, `None` when clean.
    fn scan(&self, data: &[u8], label: &str) -> Result<Option<String>>;

    /// Longest pattern the scanner can match, used to overlap stream chunks.
    fn max_pattern_len(&self) -> usize {
        0
    }
}

/// Combined inspection gate shared by all proxies
pub struct Inspector {
    scanner: Arc<dyn ContentScanner>,
    ftp: FtpCommandPolicy,
    sql: SqlPolicy,
}

impl Inspector {
    pub fn new(scanner: Arc<dyn ContentScanner>) -> Result<Self> {
        Ok(Self {
            scanner,
            ftp: FtpCommandPolicy::default(),
            sql: SqlPolicy::new()?,
        })
    }

    /// Built-in signature set and default policies
    pub fn with_defaults() -> Result<Self> {
        Self::new(Arc::new(SignatureScanner::with_defaults()?))
    }

    /// `true` when `data` must be blocked. Scanner errors count as threats.
    pub fn scan(&self, data: &[u8], label: &str) -> bool {
        !self.check_content(data, label).is_accepted()
    }

    /// `true` when the FTP command line must be rejected.
    pub fn validate_command(&self, text: &str) -> bool {
        !self.ftp.check(text).is_accepted()
    }

    pub fn detect_injection(&self, sql: &str) -> bool {
        self.sql.injection_reason(sql).is_some()
    }

    pub fn detect_dangerous(&self, sql: &str) -> bool {
        self.sql.dangerous_reason(sql).is_some()
    }

    pub fn check_content(&self, data: &[u8], label: &str) -> Verdict {
        match self.scanner.scan(data, label) {
            Ok(None) => Verdict::Accepted,
            Ok(Some(rule)) => {
                debug!(label, rule = %rule, "signature matched");
                Verdict::Rejected(format!("threat signature {}", rule))
            }
            Err(e) => {
                error!(label, error = %e, "scanner failed, blocking content");
                Verdict::Rejected(format!("scanner failure: {}", e))
            }
        }
    }

    pub fn check_ftp_command(&self, line: &str) -> Verdict {
        self.ftp.check(line)
    }

    pub fn check_sql(&self, sql: &str) -> Verdict {
        self.sql.check(sql)
    }

    pub fn max_pattern_len(&self) -> usize {
        self.scanner.max_pattern_len()
    }
}
