//! Per-packet AES-256-GCM sealing
//!
//! Every packet is sealed under a fresh random 96-bit nonce drawn from the
//! system CSPRNG. With AES-GCM this is safe up to roughly 2^32 packets per
//! key, far beyond the lifetime of a tunnel connection.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

/// AES-256-GCM key for packet sealing
pub struct PacketKey {
    key: LessSafeKey,
}

impl PacketKey {
    /// Create from raw key bytes
    pub fn new(key_bytes: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Create from the configured shared secret (SHA-256 derived)
    pub fn from_secret(secret: &str) -> Result<Self, CryptoError> {
        Self::new(&super::derive_key(secret))
    }

    /// Seal a payload, returning `nonce ∥ ciphertext_with_tag` ready for the wire
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce);

        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut out[NONCE_LEN..],
            )
            .map_err(|_| CryptoError::Seal)?;
        out.extend_from_slice(tag.as_ref());

        Ok(out)
    }

    /// Open a `nonce ∥ ciphertext_with_tag` packet, returning the plaintext
    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if packet.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&packet[..NONCE_LEN]);

        let mut buf = packet[NONCE_LEN..].to_vec();
        let plaintext = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buf)
            .map_err(|_| CryptoError::Open)?;
        let len = plaintext.len();
        buf.truncate(len);

        Ok(buf)
    }
}
