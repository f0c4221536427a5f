//! Envelope: one value, packed for the wire and optionally encrypted.
//!
//! Wire layout: `[flags: u8][key_hint: u32 if FLAG_KEY_HINT][len: u32][payload]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::CryptoSettings;
use crate::error::{Result, RpcError};
use crate::protocol::codec::{self, decode_value, encode_value};
use crate::protocol::value::Value;

/// Envelope flag: payload is sealed.
pub const FLAG_ENCRYPTED: u8 = 0x01;
/// Envelope flag: key hint (u32) is present.
pub const FLAG_KEY_HINT: u8 = 0x02;

/// Packed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Canonical value bytes, or nonce + ciphertext when encrypted.
    pub payload: Bytes,
    pub encrypted: bool,
    /// Fingerprint of the sealing key.
    pub key_hint: Option<u32>,
}

impl Envelope {
    /// Unencrypted envelope around already-encoded bytes.
    pub fn plain(payload: Bytes) -> Self {
        Self {
            payload,
            encrypted: false,
            key_hint: None,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let mut flags = 0u8;
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.key_hint.is_some() {
            flags |= FLAG_KEY_HINT;
        }
        buf.put_u8(flags);
        if let Some(hint) = self.key_hint {
            buf.put_u32_le(hint);
        }
        codec::put_blob(buf, &self.payload)
    }

    pub fn decode_from(buf: &mut Bytes) -> Result<Self> {
        let flags = codec::get_u8(buf, "envelope flags")?;
        if flags & !(FLAG_ENCRYPTED | FLAG_KEY_HINT) != 0 {
            return Err(RpcError::Codec(format!("unknown envelope flags: {flags:#04x}").into()));
        }
        let key_hint = if flags & FLAG_KEY_HINT != 0 {
            codec::need(buf, 4, "key hint")?;
            Some(buf.get_u32_le())
        } else {
            None
        };
        let payload = codec::get_blob(buf)?;
        Ok(Self {
            payload,
            encrypted: flags & FLAG_ENCRYPTED != 0,
            key_hint,
        })
    }
}

/// Pack a value.
///
/// With `encrypt` set and at least one key configured, the canonical bytes are
/// sealed with the primary key. Without keys the value is packed in the clear.
pub fn pack(value: &Value, encrypt: bool, crypto: Option<&CryptoSettings>) -> Result<Envelope> {
    let plain = encode_value(value)?;
    match crypto {
        Some(settings) if encrypt && !settings.is_empty() => {
            let (sealed, hint) = settings.seal(&plain)?;
            Ok(Envelope {
                payload: sealed,
                encrypted: true,
                key_hint: Some(hint),
            })
        }
        _ => Ok(Envelope::plain(plain)),
    }
}

/// Unpack an envelope, decrypting with any configured key if it is sealed.
pub fn unpack(env: &Envelope, crypto: Option<&CryptoSettings>) -> Result<Value> {
    if !env.encrypted {
        return decode_value(env.payload.clone());
    }
    let settings = crypto
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RpcError::Decryption("envelope is encrypted but no keys are configured".into()))?;
    let plain = settings.open(&env.payload, env.key_hint)?;
    decode_value(Bytes::from(plain))
}
