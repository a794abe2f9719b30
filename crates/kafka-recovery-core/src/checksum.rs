//! CRC32 checksums over raw segment bytes and over the manifest.
//!
//! These are verification-only. A mismatch always surfaces as
//! [`Error::CorruptBackup`].

use crate::{Error, Result};

/// Running checksum over the uncompressed frames of one segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentChecksum {
    hasher: crc32fast::Hasher,
    bytes: u64,
}

impl SegmentChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of raw bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Checksum of everything fed so far, without consuming the state
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

/// One-shot CRC32 of a buffer
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Checksum over the concatenation of segment checksums (little-endian, in order).
pub fn manifest_checksum<I>(segment_checksums: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    let mut hasher = crc32fast::Hasher::new();
    for crc in segment_checksums {
        hasher.update(&crc.to_le_bytes());
    }
    hasher.finalize()
}

/// Compare two checksums, naming `what` in the error.
pub fn verify(what: &str, expected: u32, actual: u32) -> Result<()> {
    if expected != actual {
        return Err(Error::CorruptBackup(format!(
            "{}: checksum mismatch (expected {:08x}, computed {:08x})",
            what, expected, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut running = SegmentChecksum::new();
        for chunk in data.chunks(7) {
            running.update(chunk);
        }
        assert_eq!(running.bytes(), data.len() as u64);
        assert_eq!(running.value(), checksum(data));
        assert_eq!(running.finalize(), checksum(data));
    }

    #[test]
    fn test_single_bit_flip_changes_checksum() {
        let mut data = vec![0u8; 4096];
        let original = checksum(&data);
        data[2048] ^= 0x01;
        assert_ne!(original, checksum(&data));
    }

    #[test]
    fn test_manifest_checksum_is_order_sensitive() {
        let a = manifest_checksum([1, 2, 3]);
        let b = manifest_checksum([3, 2, 1]);
        assert_ne!(a, b);
        assert_eq!(a, manifest_checksum(vec![1, 2, 3]));
    }

    #[test]
    fn test_verify() {
        assert!(verify("segment 0", 42, 42).is_ok());
        let err = verify("segment 0", 42, 43).unwrap_err();
        assert!(matches!(err, Error::CorruptBackup(_)));
        assert!(err.to_string().contains("segment 0"));
    }
}
