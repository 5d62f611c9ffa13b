//! Cryptographic primitives for GapBridge frames
//!
//! AES-256-GCM authenticated encryption keyed by a single master key that
//! both sides of the link share. Keys come from PBKDF2-HMAC-SHA256 over an
//! operator password, from raw key material, or from a password-protected
//! key file.

use std::fs::OpenOptions;
use std::io::Write;
use std::num::NonZeroU32;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// AES-256 key size
pub const KEY_SIZE: usize = 32;

/// GCM nonce size
pub const NONCE_SIZE: usize = 12;

/// GCM tag size
pub const TAG_SIZE: usize = 16;

/// PBKDF2 salt size
pub const SALT_SIZE: usize = 32;

/// Bytes added to every plaintext by `encrypt`
pub const CIPHERTEXT_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// PBKDF2-HMAC-SHA256 iteration count
pub const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

/// AES-256-GCM engine shared by every session of a bridge process.
///
/// Nonces are `counter (8 bytes, big-endian) || 4 random bytes`. The counter
/// is seeded from wall-clock nanoseconds when the engine is built and is
/// advanced atomically, so concurrent `encrypt` calls never share a nonce.
pub struct CryptoEngine {
    master_key: Zeroizing<[u8; KEY_SIZE]>,
    salt: Option<[u8; SALT_SIZE]>,
    cipher: Aes256Gcm,
    nonce_counter: AtomicU64,
    rng: SystemRandom,
}

impl CryptoEngine {
    /// Derive the master key from a password.
    ///
    /// A fresh random salt is generated when `salt` is `None`. Both sides must
    /// use the same salt to derive the same key.
    pub fn from_password(password: &str, salt: Option<&[u8]>) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::EmptyPassword);
        }

        let rng = SystemRandom::new();
        let salt = match salt {
            Some(s) => <[u8; SALT_SIZE]>::try_from(s).map_err(|_| Error::InvalidSaltLength(s.len()))?,
            None => {
                let mut fresh = [0u8; SALT_SIZE];
                rng.fill(&mut fresh)?;
                fresh
            }
        };

        let key = derive_key(password, &salt);
        let mut engine = Self::build(key, rng);
        engine.salt = Some(salt);
        Ok(engine)
    }

    /// Use raw key material, e.g. after a key rotation.
    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength(key.len()));
        }
        let mut fixed = Zeroizing::new([0u8; KEY_SIZE]);
        fixed.copy_from_slice(key);
        Ok(Self::build(fixed, SystemRandom::new()))
    }

    /// Generate a random master key.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rng.fill(key.as_mut())?;
        Ok(Self::build(key, rng))
    }

    fn build(master_key: Zeroizing<[u8; KEY_SIZE]>, rng: SystemRandom) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master_key.as_ref()));
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        Self {
            master_key,
            salt: None,
            cipher,
            nonce_counter: AtomicU64::new(seed),
            rng,
        }
    }

    /// Salt used for password derivation, if any.
    pub fn salt(&self) -> Option<&[u8; SALT_SIZE]> {
        self.salt.as_ref()
    }

    /// Copy of the master key for rotation or escrow.
    pub fn export_key(&self) -> [u8; KEY_SIZE] {
        *self.master_key
    }

    /// Reserve the next nonce: one counter increment plus fresh randomness.
    pub(crate) fn next_nonce(&self) -> Result<[u8; NONCE_SIZE]> {
        let counter = self.nonce_counter.fetch_add(1, Ordering::SeqCst);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_be_bytes());
        self.rng.fill(&mut nonce[8..])?;
        Ok(nonce)
    }

    /// Encrypt and authenticate `plaintext`.
    ///
    /// Returns `nonce(12) || ciphertext || tag(16)`. `associated_data` is
    /// authenticated but not included in the output.
    pub fn encrypt(&self, plaintext: &[u8], associated_data: Option<&[u8]>) -> Result<Vec<u8>> {
        if plaintext.is_empty() {
            return Err(Error::EmptyInput);
        }

        let nonce = self.next_nonce()?;
        let mut buffer = Vec::with_capacity(NONCE_SIZE + plaintext.len() + TAG_SIZE);
        buffer.extend_from_slice(plaintext);

        self.cipher
            .encrypt_in_place(Nonce::from_slice(&nonce), associated_data.unwrap_or_default(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + buffer.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&buffer);
        Ok(blob)
    }

    /// Verify and decrypt a blob produced by [`CryptoEngine::encrypt`].
    ///
    /// No plaintext is returned unless the tag verifies.
    pub fn decrypt(&self, blob: &[u8], associated_data: Option<&[u8]>) -> Result<Vec<u8>> {
        if blob.len() < CIPHERTEXT_OVERHEAD {
            return Err(Error::TooShort(blob.len()));
        }

        let (nonce, sealed) = blob.split_at(NONCE_SIZE);
        let mut buffer = sealed.to_vec();
        self.cipher
            .decrypt_in_place(Nonce::from_slice(nonce), associated_data.unwrap_or_default(), &mut buffer)
            .map_err(|_| Error::AuthenticationFailed)?;

        Ok(buffer)
    }

    /// Persist the master key sealed under a key derived from `password`.
    ///
    /// File layout: `salt(32) || nonce(12) || ciphertext(32) || tag(16)`.
    pub fn save_to_file(&self, path: impl AsRef<Path>, password: &str) -> Result<()> {
        let wrapper = CryptoEngine::from_password(password, None)?;
        let salt = wrapper
            .salt()
            .copied()
            .ok_or_else(|| Error::Internal("password engine without salt".to_string()))?;
        let sealed = wrapper.encrypt(self.master_key.as_ref(), None)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path.as_ref())?;
        file.write_all(&salt)?;
        file.write_all(&sealed)?;
        file.sync_all()?;

        tracing::info!("Master key written to {}", path.as_ref().display());
        Ok(())
    }

    /// Load a master key written by [`CryptoEngine::save_to_file`].
    pub fn load_from_file(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        let data = Zeroizing::new(std::fs::read(path.as_ref())?);
        if data.len() < SALT_SIZE + CIPHERTEXT_OVERHEAD {
            return Err(Error::TooShort(data.len()));
        }

        let (salt, sealed) = data.split_at(SALT_SIZE);
        let wrapper = CryptoEngine::from_password(password, Some(salt))?;
        let key = Zeroizing::new(wrapper.decrypt(sealed, None)?);
        Self::from_key(&key)
    }
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("salt", &self.salt.map(hex::encode))
            .field("nonce_counter", &self.nonce_counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        salt,
        password.as_bytes(),
        key.as_mut(),
    );
    key
}

/// CRC32 of file content, for integrity checks outside the frame path.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
