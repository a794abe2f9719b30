//! Binary segment format definitions.
//!
//! Segment Format (v1):
//! ```text
//! +----------------------+
//! | Header (32 bytes)    |
//! +----------------------+
//! | Payload              |  codec(frame*), codec taken from the manifest
//! +----------------------+
//! | Footer (12 bytes)    |
//! +----------------------+
//! ```
//!
//! Header Format:
//! - magic: [u8; 4] = "KRSG"
//! - version: u16 (little-endian)
//! - reserved: u16, always zero
//! - partition: u32 (little-endian)
//! - record_count: u32 (little-endian)
//! - start_offset: u64 (little-endian)
//! - end_offset: u64 (little-endian, exclusive)
//!
//! Frame Format (uncompressed):
//! - frame_len: u32 (little-endian) - length of the remaining frame
//! - partition: u32
//! - offset: u64
//! - timestamp: i64
//! - key_len: i32 (-1 for null), key
//! - value_len: i32 (-1 for null), value
//! - header_count: u32
//! - headers: [key_len: u32, key, value_len: i32 (-1 for null), value]*
//!
//! Footer Format:
//! - raw_crc: u32 - CRC32 of the uncompressed frames
//! - file_crc: u32 - CRC32 of header and payload as stored
//! - magic_end: [u8; 4] = "GSRK"

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Magic bytes at start of segment
pub const MAGIC_BYTES: [u8; 4] = *b"KRSG";

/// Magic bytes at end of segment
pub const MAGIC_END: [u8; 4] = *b"GSRK";

/// Current segment format version
pub const VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Footer size in bytes
pub const FOOTER_SIZE: usize = 12;

/// Fixed part of a frame after the length prefix
const FRAME_FIXED_SIZE: usize = 4 + 8 + 8 + 4 + 4 + 4;

/// Segment header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u16,
    pub partition: u32,
    pub record_count: u32,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl SegmentHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC_BYTES);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        // 6..8 reserved
        buf[8..12].copy_from_slice(&self.partition.to_le_bytes());
        buf[12..16].copy_from_slice(&self.record_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.start_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.end_offset.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(corrupt("segment header too short"));
        }

        let mut buf = &data[..HEADER_SIZE];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC_BYTES {
            return Err(corrupt("invalid segment magic bytes"));
        }

        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(corrupt(format!("unsupported segment version: {}", version)));
        }

        if buf.get_u16_le() != 0 {
            return Err(corrupt("reserved header bytes are not zero"));
        }

        let header = Self {
            version,
            partition: buf.get_u32_le(),
            record_count: buf.get_u32_le(),
            start_offset: buf.get_u64_le(),
            end_offset: buf.get_u64_le(),
        };

        if header.end_offset < header.start_offset {
            return Err(corrupt(format!(
                "segment end offset {} precedes start offset {}",
                header.end_offset, header.start_offset
            )));
        }

        Ok(header)
    }
}

/// Segment footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFooter {
    pub raw_crc: u32,
    pub file_crc: u32,
}

impl SegmentFooter {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..4].copy_from_slice(&self.raw_crc.to_le_bytes());
        buf[4..8].copy_from_slice(&self.file_crc.to_le_bytes());
        buf[8..12].copy_from_slice(&MAGIC_END);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(corrupt("segment footer has wrong size"));
        }
        if data[8..12] != MAGIC_END {
            return Err(corrupt("invalid segment end magic"));
        }
        let mut buf = data;
        Ok(Self {
            raw_crc: buf.get_u32_le(),
            file_crc: buf.get_u32_le(),
        })
    }
}

/// A single record header; the value may be null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl RecordHeader {
    pub fn new(key: impl Into<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// One Kafka message as stored in a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub partition: u32,
    pub offset: u64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl MessageRecord {
    /// Calculate serialized size of this record (excluding length prefix)
    pub fn serialized_size(&self) -> usize {
        let mut size = FRAME_FIXED_SIZE;
        size += self.key.as_ref().map_or(0, |k| k.len());
        size += self.value.as_ref().map_or(0, |v| v.len());
        for header in &self.headers {
            size += 4 + header.key.len() + 4;
            size += header.value.as_ref().map_or(0, |v| v.len());
        }
        size
    }

    /// Append this record as a length-prefixed frame
    pub fn encode(&self, buf: &mut BytesMut) {
        let content_size = self.serialized_size();
        buf.reserve(4 + content_size);
        buf.put_u32_le(content_size as u32);
        buf.put_u32_le(self.partition);
        buf.put_u64_le(self.offset);
        buf.put_i64_le(self.timestamp);
        put_nullable(buf, self.key.as_ref());
        put_nullable(buf, self.value.as_ref());
        buf.put_u32_le(self.headers.len() as u32);
        for header in &self.headers {
            buf.put_u32_le(header.key.len() as u32);
            buf.put_slice(&header.key);
            put_nullable(buf, header.value.as_ref());
        }
    }

    /// Serialize record to bytes (including length prefix)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode the next frame from `data`, advancing past it.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(corrupt("frame length truncated"));
        }
        let frame_len = data.get_u32_le() as usize;
        if frame_len < FRAME_FIXED_SIZE || data.remaining() < frame_len {
            return Err(corrupt(format!(
                "frame length {} invalid ({} bytes remain)",
                frame_len,
                data.remaining()
            )));
        }

        let mut frame = data.split_to(frame_len);
        let partition = frame.get_u32_le();
        let offset = frame.get_u64_le();
        let timestamp = frame.get_i64_le();
        let key = get_nullable(&mut frame, "key")?;
        let value = get_nullable(&mut frame, "value")?;

        if frame.remaining() < 4 {
            return Err(corrupt("header count truncated"));
        }
        let header_count = frame.get_u32_le() as usize;
        // Each header needs at least 8 bytes, so a bogus count cannot over-allocate.
        if header_count > frame.remaining() / 8 {
            return Err(corrupt(format!("header count {} too large", header_count)));
        }

        let mut headers = Vec::with_capacity(header_count);
        for _ in 0..header_count {
            if frame.remaining() < 4 {
                return Err(corrupt("header key length truncated"));
            }
            let key_len = frame.get_u32_le() as usize;
            if frame.remaining() < key_len {
                return Err(corrupt("header key truncated"));
            }
            let key = frame.split_to(key_len);
            let value = get_nullable(&mut frame, "header value")?;
            headers.push(RecordHeader { key, value });
        }

        if frame.has_remaining() {
            return Err(corrupt(format!(
                "{} trailing bytes in frame at offset {}",
                frame.remaining(),
                offset
            )));
        }

        Ok(Self {
            partition,
            offset,
            timestamp,
            key,
            value,
            headers,
        })
    }
}

/// Decode every frame in an uncompressed payload.
pub fn decode_frames(mut data: Bytes) -> Result<Vec<MessageRecord>> {
    let mut records = Vec::new();
    while data.has_remaining() {
        records.push(MessageRecord::decode(&mut data)?);
    }
    Ok(records)
}

fn put_nullable(buf: &mut BytesMut, value: Option<&Bytes>) {
    match value {
        Some(v) => {
            buf.put_i32_le(v.len() as i32);
            buf.put_slice(v);
        }
        None => buf.put_i32_le(-1),
    }
}

fn get_nullable(frame: &mut Bytes, field: &str) -> Result<Option<Bytes>> {
    if frame.remaining() < 4 {
        return Err(corrupt(format!("{} length truncated", field)));
    }
    let len = frame.get_i32_le();
    if len < 0 {
        if len != -1 {
            return Err(corrupt(format!("{} length {} invalid", field, len)));
        }
        return Ok(None);
    }
    let len = len as usize;
    if frame.remaining() < len {
        return Err(corrupt(format!("{} truncated", field)));
    }
    Ok(Some(frame.split_to(len)))
}

fn corrupt(message: impl Into<String>) -> Error {
    Error::CorruptBackup(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> MessageRecord {
        MessageRecord {
            partition: 3,
            offset: 42,
            timestamp: 1_700_000_000_000,
            key: Some(Bytes::from("order-42")),
            value: Some(Bytes::from("{\"total\": 99}")),
            headers: vec![
                RecordHeader::new("trace-id", Some(Bytes::from("abc"))),
                RecordHeader::new("tombstone-hint", None),
                RecordHeader::new("trace-id", Some(Bytes::from("dup"))),
            ],
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = SegmentHeader {
            version: VERSION,
            partition: 7,
            record_count: 12345,
            start_offset: 100,
            end_offset: 12445,
        };

        let bytes = header.to_bytes();
        assert_eq!(SegmentHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_reserved_bits() {
        let header = SegmentHeader {
            version: VERSION,
            partition: 0,
            record_count: 0,
            start_offset: 0,
            end_offset: 0,
        };
        let mut bytes = header.to_bytes();
        bytes[6] = 1;
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(Error::CorruptBackup(_))
        ));
    }

    #[test]
    fn test_record_roundtrip_keeps_duplicate_and_null_headers() {
        let record = sample_record();
        let mut bytes = record.to_bytes();
        assert_eq!(bytes.len(), 4 + record.serialized_size());

        let parsed = MessageRecord::decode(&mut bytes).unwrap();
        assert_eq!(parsed, record);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_record_with_nulls() {
        let record = MessageRecord {
            partition: 0,
            offset: 0,
            timestamp: -1,
            key: None,
            value: None,
            headers: vec![],
        };

        let mut bytes = record.to_bytes();
        let parsed = MessageRecord::decode(&mut bytes).unwrap();
        assert_eq!(parsed.key, None);
        assert_eq!(parsed.value, None);
        assert!(parsed.headers.is_empty());
    }

    #[test]
    fn test_truncated_frame_is_corrupt() {
        let bytes = sample_record().to_bytes();
        let mut truncated = bytes.slice(..bytes.len() - 3);
        assert!(matches!(
            MessageRecord::decode(&mut truncated),
            Err(Error::CorruptBackup(_))
        ));
    }

    #[test]
    fn test_decode_frames_in_order() {
        let mut buf = BytesMut::new();
        for offset in 0..5 {
            MessageRecord {
                offset,
                ..sample_record()
            }
            .encode(&mut buf);
        }
        let records = decode_frames(buf.freeze()).unwrap();
        let offsets: Vec<_> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }
}
