//! Traffic obfuscation policies
//!
//! Value types consumed by the framed channel: variable-size padding, burst
//! splitting of large writes, and post-write timing jitter.

pub mod fragment;

use crate::crypto::{rand_between, random_bytes};
use std::time::Duration;

/// Smallest burst chunk emitted by the splitter
pub const BURST_CHUNK_FLOOR: usize = 512;

/// Random per-packet padding, uniform in `[min, max]` bytes.
///
/// Wire format of a padded payload: `u16_be body_len ∥ body ∥ pad`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingPolicy {
    pub min: usize,
    pub max: usize,
}

impl PaddingPolicy {
    /// Prefix `data` with its length and suffix random padding.
    pub fn pad(&self, data: &[u8]) -> Vec<u8> {
        debug_assert!(data.len() <= u16::MAX as usize);
        let pad_len = rand_between(self.min as u64, self.max as u64) as usize;

        let mut out = vec![0u8; 2 + data.len() + pad_len];
        out[..2].copy_from_slice(&(data.len() as u16).to_be_bytes());
        out[2..2 + data.len()].copy_from_slice(data);
        if pad_len > 0 {
            random_bytes(&mut out[2 + data.len()..]);
        }
        out
    }

    /// Strip the length prefix and trailing padding. `None` if malformed.
    pub fn strip(padded: &[u8]) -> Option<&[u8]> {
        if padded.len() < 2 {
            return None;
        }
        let body_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
        if 2 + body_len > padded.len() {
            return None;
        }
        Some(&padded[2..2 + body_len])
    }
}

/// Splits one logical write into random-sized chunks, each sealed as its own
/// packet, so the wire never shows a consistent large-write size pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstPolicy {
    /// Largest single chunk; writes above this are split
    pub max_chunk: usize,
}

impl BurstPolicy {
    /// Size of the next chunk for `remaining` unsent bytes.
    pub fn next_chunk(&self, remaining: usize) -> usize {
        let max = self.max_chunk.max(BURST_CHUNK_FLOOR + 1);
        let n = rand_between(BURST_CHUNK_FLOOR as u64, max as u64) as usize;
        n.min(remaining)
    }

    /// Inter-chunk delay, 1-5 ms.
    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(rand_between(1, 5))
    }
}

/// Post-write delay, uniform in `[min_ms, max_ms]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayPolicy {
    pub fn sample(&self) -> Duration {
        Duration::from_millis(rand_between(self.min_ms, self.max_ms))
    }
}
