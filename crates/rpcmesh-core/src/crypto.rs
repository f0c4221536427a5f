//! Rotating encryption keys for envelopes.
//!
//! Keys are held newest first. Sealing always uses the first (primary) key;
//! opening tries every key so data sealed before a rotation stays readable.

use std::fmt;

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use crate::error::{Result, RpcError};

/// Key length in bytes.
pub const KEY_LEN: usize = 32;
/// Nonce length in bytes (prefixed to every ciphertext).
pub const NONCE_LEN: usize = 12;

const FINGERPRINT_CONTEXT: &str = "rpcmesh envelope key fingerprint v1";

/// One 256-bit envelope key.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoKey {
    bytes: [u8; KEY_LEN],
    fingerprint: u32,
}

impl CryptoKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let digest = blake3::derive_key(FINGERPRINT_CONTEXT, &bytes);
        let fingerprint = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        Self { bytes, fingerprint }
    }

    /// Parse a key written as 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| RpcError::Config(format!("invalid key hex: {e}").into()))?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| RpcError::Config(format!("key must be {KEY_LEN} bytes").into()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Short identifier stored in envelopes. Not secret, not the key.
    pub fn fingerprint(&self) -> u32 {
        self.fingerprint
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.bytes))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Bytes> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| RpcError::Internal("envelope encryption failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(Bytes::from(out))
    }

    fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return None;
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        self.cipher().decrypt(Nonce::from_slice(nonce), body).ok()
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoKey({:08x})", self.fingerprint)
    }
}

/// Ordered key set, most recently added first.
#[derive(Debug, Clone, Default)]
pub struct CryptoSettings {
    keys: Vec<CryptoKey>,
}

impl CryptoSettings {
    /// `keys` must already be newest first.
    pub fn new(keys: Vec<CryptoKey>) -> Self {
        Self { keys }
    }

    pub fn from_hex_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let keys = keys
            .iter()
            .map(|k| CryptoKey::from_hex(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { keys })
    }

    /// Prepend a new primary key; older keys stay available for opening.
    pub fn rotate(&mut self, key: CryptoKey) {
        self.keys.insert(0, key);
    }

    pub fn primary(&self) -> Option<&CryptoKey> {
        self.keys.first()
    }

    pub fn keys(&self) -> &[CryptoKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Seal with the primary key. Returns the ciphertext and the key fingerprint.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Bytes, u32)> {
        let key = self
            .primary()
            .ok_or_else(|| RpcError::Internal("no primary key configured".into()))?;
        Ok((key.seal(plaintext)?, key.fingerprint()))
    }

    /// Open sealed bytes, trying keys whose fingerprint matches `hint` first and
    /// then the rest, each group in list order.
    pub fn open(&self, sealed: &[u8], hint: Option<u32>) -> Result<Vec<u8>> {
        let hinted = self.keys.iter().filter(|k| Some(k.fingerprint()) == hint);
        let others = self.keys.iter().filter(|k| Some(k.fingerprint()) != hint);
        for key in hinted.chain(others) {
            if let Some(plain) = key.open(sealed) {
                if hint.is_some_and(|h| h != key.fingerprint()) {
                    tracing::debug!(hint = ?hint, used = ?key, "envelope opened with a key other than the hinted one");
                }
                return Ok(plain);
            }
        }
        Err(RpcError::Decryption(format!(
            "none of {} configured keys opened the envelope (hint {})",
            self.keys.len(),
            hint.map_or_else(|| "none".to_string(), |h| format!("{h:08x}"))
        ).into()))
    }
}
