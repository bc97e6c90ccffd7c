//! Channel payload encryption.
//!
//! Meshtastic encrypts the `Data` protobuf of a packet with AES-CTR. The channel key is a
//! short base64 PSK that is stretched to 32 bytes by repeating it, and the 16-byte nonce is
//! built from the packet header so every packet gets its own keystream.

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;

/// Key used by the public default channel (`AQ==`).
pub const DEFAULT_CHANNEL_KEY: &str = "AQ==";

#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("channel key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("channel key is empty")]
    EmptyKey,

    #[error("channel key is {0} bytes, at most 32 are supported")]
    KeyTooLong(usize),

    #[error("packet metadata incomplete (sender={from:#010x}, id={packet_id})")]
    MissingMetadata { from: u32, packet_id: u32 },

    #[error("cipher failure: {0}")]
    Cipher(String),
}

/// Derived 256-bit channel key.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey([u8; KEY_LEN]);

impl ChannelKey {
    pub fn from_base64(encoded: &str) -> Result<Self, DecryptError> {
        let raw = BASE64.decode(encoded.trim())?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, DecryptError> {
        derive_key(raw).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

// Never print key material.
impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

/// Stretch a short key to 32 bytes: `out[i] = short[i % short.len()]`.
pub fn derive_key(short: &[u8]) -> Result<[u8; KEY_LEN], DecryptError> {
    if short.is_empty() {
        return Err(DecryptError::EmptyKey);
    }
    if short.len() > KEY_LEN {
        return Err(DecryptError::KeyTooLong(short.len()));
    }
    let mut key = [0u8; KEY_LEN];
    for (i, b) in key.iter_mut().enumerate() {
        *b = short[i % short.len()];
    }
    Ok(key)
}

/// Header fields that feed the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMetadata {
    pub from: u32,
    pub channel: u32,
    pub packet_id: u32,
}

/// Layout (little-endian): `[0..4]` sender, `[4]` channel low byte, `[5..13]` packet id as
/// u64, `[13..16]` zero.
pub fn build_nonce(meta: &PacketMetadata) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0..4].copy_from_slice(&meta.from.to_le_bytes());
    nonce[4] = (meta.channel & 0xFF) as u8;
    nonce[5..13].copy_from_slice(&u64::from(meta.packet_id).to_le_bytes());
    nonce
}

fn apply_keystream(
    key: &ChannelKey,
    meta: &PacketMetadata,
    input: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    // proto3 leaves absent fields at zero, so a zero sender or id means we can't build the nonce.
    if meta.from == 0 || meta.packet_id == 0 {
        return Err(DecryptError::MissingMetadata {
            from: meta.from,
            packet_id: meta.packet_id,
        });
    }
    let nonce = build_nonce(meta);
    let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), &nonce)
        .map_err(|e| DecryptError::Cipher(e.to_string()))?;
    let mut buf = input.to_vec();
    cipher
        .try_apply_keystream(&mut buf)
        .map_err(|e| DecryptError::Cipher(e.to_string()))?;
    Ok(buf)
}

/// Decrypt the opaque `encrypted` bytes of a packet. Output length equals input length.
pub fn decrypt(
    key: &ChannelKey,
    meta: &PacketMetadata,
    ciphertext: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    apply_keystream(key, meta, ciphertext)
}

/// Inverse of [`decrypt`]; CTR mode makes the two the same operation.
pub fn encrypt(
    key: &ChannelKey,
    meta: &PacketMetadata,
    plaintext: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    apply_keystream(key, meta, plaintext)
}
