//! The encryption-helper seam.
//!
//! The store never implements cryptography itself; it hands every block
//! write and read through a [`Cipher`]. The store's only obligation is that
//! the [`BlockNonce`] it passes is unique per `(segment, offset)` - nonce
//! derivation from that seed is the helper's business.
//!
//! Two implementations ship with the crate: [`AesGcmCipher`], the default
//! AES-256-GCM helper, and [`PlainCipher`], a passthrough for tests and
//! unencrypted stores.

use crate::error::{StorageError, StorageResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// The unique seed a cipher derives its nonce from.
///
/// Blocks are never rewritten, so `(segment, offset)` identifies a block
/// for the lifetime of the store and the derived nonce is never reused
/// under the same key.
#[derive(Debug, Clone, Copy)]
pub struct BlockNonce<'a> {
    /// Name of the segment holding the start of the block.
    pub segment: &'a str,
    /// Offset of the start of the block within that segment.
    pub offset: u64,
}

/// Transforms byte blocks on their way to and from segment files.
pub trait Cipher: Send + Sync {
    /// Maps a logical length to the physical space it will occupy
    /// (`encrypting = true`), or a physical length back to the logical one
    /// (`encrypting = false`). Covers authentication-tag overhead.
    fn convert_length(&self, len: u64, encrypting: bool) -> u64;

    /// Encrypts a plaintext block.
    fn seal(&self, nonce: BlockNonce<'_>, plaintext: &[u8]) -> StorageResult<Vec<u8>>;

    /// Decrypts a block previously produced by [`seal`](Self::seal) with
    /// the same nonce seed.
    fn open(&self, nonce: BlockNonce<'_>, ciphertext: &[u8]) -> StorageResult<Vec<u8>>;
}

/// A no-op cipher: bytes are stored as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCipher;

impl Cipher for PlainCipher {
    fn convert_length(&self, len: u64, _encrypting: bool) -> u64 {
        len
    }

    fn seal(&self, _nonce: BlockNonce<'_>, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, _nonce: BlockNonce<'_>, ciphertext: &[u8]) -> StorageResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// Encryption key for AES-256-GCM.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE],
}

impl CipherKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::cipher(format!(
                "invalid key size: expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a passphrase using HKDF-SHA256.
    ///
    /// The salt should be random, unique per store, and persisted alongside
    /// the store. HKDF assumes the passphrase already carries reasonable
    /// entropy; use a password-hashing KDF upstream for weak passphrases.
    pub fn derive_from_passphrase(passphrase: &[u8], salt: &[u8]) -> StorageResult<Self> {
        use hkdf::Hkdf;

        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"sealkv-block-key-v1", &mut bytes)
            .map_err(|_| StorageError::cipher("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    /// Returns the key material.
    ///
    /// # Security
    ///
    /// Never log or persist the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The default cipher: AES-256-GCM with a deterministic per-block nonce.
///
/// The nonce is `SHA-256(segment name)[..4] || offset (8 bytes LE)`. A
/// block's `(segment, offset)` never repeats in an append-only store, so
/// the nonce never repeats under one key.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Creates a cipher from a key.
    #[must_use]
    pub fn new(key: CipherKey) -> Self {
        let key_array = GenericArray::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key_array),
        }
    }

    fn nonce_bytes(nonce: BlockNonce<'_>) -> [u8; NONCE_SIZE] {
        let digest = Sha256::digest(nonce.segment.as_bytes());
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..4].copy_from_slice(&digest[..4]);
        bytes[4..].copy_from_slice(&nonce.offset.to_le_bytes());
        bytes
    }
}

impl Cipher for AesGcmCipher {
    fn convert_length(&self, len: u64, encrypting: bool) -> u64 {
        if encrypting {
            len + TAG_SIZE as u64
        } else {
            len.saturating_sub(TAG_SIZE as u64)
        }
    }

    fn seal(&self, nonce: BlockNonce<'_>, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let nonce_bytes = Self::nonce_bytes(nonce);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| StorageError::cipher("encryption error"))
    }

    fn open(&self, nonce: BlockNonce<'_>, ciphertext: &[u8]) -> StorageResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(StorageError::cipher("ciphertext too short"));
        }
        let nonce_bytes = Self::nonce_bytes(nonce);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
            .map_err(|_| StorageError::cipher("decryption error"))
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}
