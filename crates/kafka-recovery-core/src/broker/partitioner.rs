//! Key-based partition assignment compatible with Kafka's default partitioner.

use std::sync::atomic::{AtomicU32, Ordering};

/// Kafka's murmur2 variant (seed `0x9747b28c`)
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h = SEED ^ length as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() == 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

/// Assigns records to target partitions: murmur2 of the key, round-robin for null keys.
#[derive(Debug, Default)]
pub struct KeyPartitioner {
    next: AtomicU32,
}

impl KeyPartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, key: Option<&[u8]>, num_partitions: u32) -> u32 {
        debug_assert!(num_partitions > 0);
        let n = num_partitions.max(1);
        match key {
            Some(key) => (murmur2(key) & 0x7fff_ffff) as u32 % n,
            None => self.next.fetch_add(1, Ordering::Relaxed) % n,
        }
    }
}
