//! Cryptographic primitives
//!
//! Provides:
//! - AES-256-GCM per-packet sealing with random nonces
//! - SHA-256 key derivation from the shared secret
//! - Secure random number generation

mod seal;

pub use seal::PacketKey;

use thiserror::Error;

/// Length of the AES-256 key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the GCM nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed")]
    Seal,

    #[error("Decryption failed")]
    Open,

    #[error("Packet too short for nonce")]
    Truncated,
}

/// Derive the packet key from the configured shared secret.
pub fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let digest = ring::digest::digest(&ring::digest::SHA256, secret.as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(digest.as_ref());
    key
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Uniform random integer in `[0, n)`. Returns 0 when `n` is 0.
pub fn rand_below(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut buf = [0u8; 8];
    random_bytes(&mut buf);
    u64::from_le_bytes(buf) % n
}

/// Uniform random integer in `[min, max]` (inclusive).
pub fn rand_between(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    min + rand_below(max - min + 1)
}

/// Random alphanumeric string of length `n`
pub fn rand_alphanumeric(n: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut buf = vec![0u8; n];
    random_bytes(&mut buf);
    buf.iter().map(|b| CHARS[(*b as usize) % CHARS.len()] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_derive_key_deterministic() {
        let a = derive_key("secret");
        let b = derive_key("secret");
        assert_eq!(a, b);
        assert_ne!(a, derive_key("other"));
    }

    #[test]
    fn test_rand_between_bounds() {
        for _ in 0..100 {
            let v = rand_between(512, 4096);
            assert!((512..=4096).contains(&v));
        }
        assert_eq!(rand_between(7, 7), 7);
        assert_eq!(rand_between(9, 3), 9);
    }

    #[test]
    fn test_rand_alphanumeric() {
        let s = rand_alphanumeric(8);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
