//! Built-in multi-pattern signature scanner
//!
//! Aho-Corasick over raw bytes: one pass per buffer regardless of how many
//! signatures are loaded. Rule files hold one signature per line as
//! `name = pattern`, where a pattern prefixed with `hex:` is decoded as
//! hex bytes and anything else is taken literally. Blank lines and lines
//! starting with `#` are ignored.

use std::path::Path;

use aho_corasick::AhoCorasick;

use super::ContentScanner;
use crate::error::{Error, Result};

/// EICAR anti-malware test file
pub const EICAR: &[u8] = br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

/// A named byte signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub pattern: Vec<u8>,
}

impl Signature {
    pub fn new(name: impl Into<String>, pattern: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }

    /// Parse one `name = pattern` rule line
    pub fn parse_rule(line: &str) -> Result<Self> {
        let (name, pattern) = line
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("signature rule without '=': {}", line)))?;
        let name = name.trim();
        let pattern = pattern.trim();

        if name.is_empty() || pattern.is_empty() {
            return Err(Error::Config(format!("incomplete signature rule: {}", line)));
        }

        let bytes = match pattern.strip_prefix("hex:") {
            Some(encoded) => hex::decode(encoded.trim())
                .map_err(|e| Error::Config(format!("signature {}: bad hex: {}", name, e)))?,
            None => pattern.as_bytes().to_vec(),
        };
        Ok(Self::new(name, bytes))
    }
}

pub struct SignatureScanner {
    names: Vec<String>,
    matcher: AhoCorasick,
    max_len: usize,
}

impl SignatureScanner {
    pub fn new(signatures: Vec<Signature>) -> Result<Self> {
        let max_len = signatures.iter().map(|s| s.pattern.len()).max().unwrap_or(0);
        let matcher = AhoCorasick::new(signatures.iter().map(|s| &s.pattern))
            .map_err(|e| Error::Config(format!("signature compilation failed: {}", e)))?;
        let names = signatures.into_iter().map(|s| s.name).collect();

        Ok(Self { names, matcher, max_len })
    }

    pub fn default_signatures() -> Vec<Signature> {
        vec![Signature::new("EICAR-Test-File", EICAR)]
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(Self::default_signatures())
    }

    /// Built-in signatures plus the rules in `path`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut signatures = Self::default_signatures();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            signatures.push(Signature::parse_rule(line)?);
        }
        tracing::info!(
            "Loaded {} signatures from {}",
            signatures.len(),
            path.as_ref().display()
        );
        Self::new(signatures)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl ContentScanner for SignatureScanner {
    fn scan(&self, data: &[u8], _label: &str) -> Result<Option<String>> {
        Ok(self
            .matcher
            .find(data)
            .map(|m| self.names[m.pattern().as_usize()].clone()))
    }

    fn max_pattern_len(&self) -> usize {
        self.max_len
    }
}
