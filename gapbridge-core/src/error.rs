//! Error types for the GapBridge core

use thiserror::Error;

/// Result type for GapBridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// GapBridge error types
#[derive(Error, Debug)]
pub enum Error {
    /// Key material is not exactly 32 bytes
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// PBKDF2 salt is not exactly 32 bytes
    #[error("Invalid salt length: expected 32 bytes, got {0}")]
    InvalidSaltLength(usize),

    /// Refusing to encrypt an empty plaintext
    #[error("Empty input")]
    EmptyInput,

    /// Refusing to derive a key from an empty password
    #[error("Empty password")]
    EmptyPassword,

    /// Ciphertext blob shorter than nonce + tag
    #[error("Ciphertext too short: {0} bytes")]
    TooShort(usize),

    /// AEAD tag did not verify
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Frame could not be parsed
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame carries an unsupported wire version
    #[error("Frame version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Frame carries an unknown protocol tag
    #[error("Unknown protocol tag: 0x{0:02x}")]
    UnknownProtocol(u8),

    /// Network transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Frame larger than the link can carry
    #[error("Frame of {size} bytes exceeds link limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation cancelled by shutdown or session teardown
    #[error("Operation cancelled")]
    Cancelled,

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient failures persisted past the retry budget
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Session registry misuse
    #[error("Session error: {0}")]
    Session(String),

    /// Protocol violation or invalid message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry may succeed where this attempt failed.
    ///
    /// Network, timeout, cancellation and generic I/O failures are transient.
    /// Cryptographic, framing, policy and configuration failures never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::Cancelled | Error::Io(_)
        )
    }

    /// Whether this error came from frame decoding or verification.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationFailed
                | Error::TooShort(_)
                | Error::Malformed(_)
                | Error::VersionMismatch { .. }
                | Error::UnknownProtocol(_)
        )
    }
}

impl From<ring::error::Unspecified> for Error {
    fn from(_err: ring::error::Unspecified) -> Self {
        Error::Internal("Ring cryptographic error".to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("Serialization error: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML parsing error: {}", err))
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::Config(format!("Invalid address: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let err: Error = io_error.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transient());

        let toml_error = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: Error = toml_error.into();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(!Error::FrameTooLarge { size: 2000, limit: 1500 }.is_transient());
        assert!(!Error::InvalidSaltLength(16).is_transient());
        assert!(Error::Timeout("connect".into()).is_transient());
        assert!(Error::Cancelled.is_transient());

        assert!(!Error::AuthenticationFailed.is_transient());
        assert!(!Error::EmptyInput.is_transient());
        assert!(!Error::Config("missing".into()).is_transient());
        assert!(!Error::VersionMismatch { expected: 1, actual: 2 }.is_transient());
    }

    #[test]
    fn test_retry_exhausted_keeps_cause() {
        let err = Error::RetryExhausted {
            operation: "connect".into(),
            attempts: 3,
            source: Box::new(Error::Timeout("backend".into())),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("backend"));
        assert!(err.to_string().contains("3 attempts"));
    }
}
