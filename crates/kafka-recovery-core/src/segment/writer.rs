//! Segment writer: one per partition worker.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

use super::format::{
    MessageRecord, SegmentFooter, SegmentHeader, FOOTER_SIZE, HEADER_SIZE, VERSION,
};
use crate::checksum::{self, SegmentChecksum};
use crate::compression::Codec;
use crate::manifest::PartitionSegmentRef;
use crate::metrics::OperationMetrics;
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// A fully encoded segment, ready to be stored
#[derive(Debug, Clone)]
pub struct EncodedSegment {
    pub header: SegmentHeader,
    pub raw_crc: u32,
    pub raw_bytes: u64,
    pub data: Bytes,
}

/// Accumulates one partition's records in offset order and encodes them as a segment.
pub struct SegmentWriter {
    partition: u32,
    codec: Arc<dyn Codec>,

    /// Uncompressed frames
    buffer: BytesMut,
    checksum: SegmentChecksum,
    record_count: u32,
    start_offset: u64,
    /// One past the last appended offset
    next_offset: u64,
}

impl SegmentWriter {
    /// Start an empty segment at `start_offset`
    pub fn new(partition: u32, start_offset: u64, codec: Arc<dyn Codec>) -> Self {
        Self {
            partition,
            codec,
            buffer: BytesMut::with_capacity(64 * 1024),
            checksum: SegmentChecksum::new(),
            record_count: 0,
            start_offset,
            next_offset: start_offset,
        }
    }

    /// Append the next record. Offsets must not go backwards.
    pub fn append(&mut self, record: &MessageRecord) -> Result<()> {
        if record.partition != self.partition {
            return Err(Error::Validation(format!(
                "record for partition {} appended to segment of partition {}",
                record.partition, self.partition
            )));
        }
        if record.offset < self.next_offset {
            return Err(Error::Validation(format!(
                "offset {} out of order in partition {} (next expected >= {})",
                record.offset, self.partition, self.next_offset
            )));
        }
        if self.record_count == u32::MAX {
            return Err(Error::Validation(format!(
                "segment for partition {} is full",
                self.partition
            )));
        }

        if self.record_count == 0 {
            self.start_offset = record.offset;
        }

        let frame_start = self.buffer.len();
        record.encode(&mut self.buffer);
        self.checksum.update(&self.buffer[frame_start..]);
        self.record_count += 1;
        self.next_offset = record.offset + 1;
        Ok(())
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Uncompressed bytes appended so far
    pub fn raw_bytes(&self) -> u64 {
        self.checksum.bytes()
    }

    /// Exclusive end offset of what has been appended
    pub fn end_offset(&self) -> u64 {
        self.next_offset
    }

    /// Compress and frame the segment.
    pub fn encode(self) -> Result<EncodedSegment> {
        let header = SegmentHeader {
            version: VERSION,
            partition: self.partition,
            record_count: self.record_count,
            start_offset: self.start_offset,
            end_offset: self.next_offset,
        };

        let raw_bytes = self.checksum.bytes();
        let raw_crc = self.checksum.finalize();
        let payload = self.codec.compress(&self.buffer)?;

        let mut data = BytesMut::with_capacity(HEADER_SIZE + payload.len() + FOOTER_SIZE);
        data.extend_from_slice(&header.to_bytes());
        data.extend_from_slice(&payload);
        let footer = SegmentFooter {
            raw_crc,
            file_crc: checksum::checksum(&data),
        };
        data.extend_from_slice(&footer.to_bytes());

        Ok(EncodedSegment {
            header,
            raw_crc,
            raw_bytes,
            data: data.freeze(),
        })
    }

    /// Encode and store the segment under `key`, returning its manifest entry.
    pub async fn write(
        self,
        storage: &dyn StorageBackend,
        key: &str,
        high_watermark: u64,
        metrics: &OperationMetrics,
    ) -> Result<PartitionSegmentRef> {
        let start = std::time::Instant::now();
        let partition = self.partition;
        let encoded = self.encode()?;
        let byte_size = encoded.data.len() as u64;

        storage.put(key, encoded.data).await?;

        metrics.record_bytes(byte_size, encoded.raw_bytes);
        metrics.record_segment(start.elapsed());

        debug!(
            partition,
            key,
            records = encoded.header.record_count,
            raw_bytes = encoded.raw_bytes,
            stored_bytes = byte_size,
            "Wrote segment"
        );

        Ok(PartitionSegmentRef {
            partition_id: partition,
            start_offset: encoded.header.start_offset,
            end_offset: encoded.header.end_offset,
            message_count: u64::from(encoded.header.record_count),
            byte_size,
            raw_bytes: encoded.raw_bytes,
            checksum: encoded.raw_crc,
            high_watermark,
            file_path: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{builtin_registry, GzipCodec};
    use crate::config::CompressionType;
    use crate::storage::FilesystemBackend;
    use tempfile::TempDir;

    fn record(partition: u32, offset: u64) -> MessageRecord {
        MessageRecord {
            partition,
            offset,
            timestamp: 1_000 + offset as i64,
            key: Some(Bytes::from(format!("key-{}", offset))),
            value: Some(Bytes::from(format!("value-{}", offset))),
            headers: vec![],
        }
    }

    #[tokio::test]
    async fn test_segment_writer_basic() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemBackend::new(temp_dir.path().to_path_buf());
        let metrics = OperationMetrics::new();

        let mut writer = SegmentWriter::new(0, 0, Arc::new(GzipCodec::default()));
        for i in 0..100 {
            writer.append(&record(0, i)).unwrap();
        }
        assert_eq!(writer.record_count(), 100);

        let segment = writer
            .write(&storage, "b1/segments/partition-00000.seg", 100, &metrics)
            .await
            .unwrap();
        assert_eq!(segment.message_count, 100);
        assert_eq!(segment.start_offset, 0);
        assert_eq!(segment.end_offset, 100);
        assert!(segment.is_complete());
        assert_eq!(
            segment.byte_size,
            storage.size("b1/segments/partition-00000.seg").await.unwrap()
        );
        assert_eq!(metrics.report().segments_written, 1);
    }

    #[test]
    fn test_checksum_covers_raw_frames_only() {
        let mut plain = SegmentWriter::new(
            0,
            0,
            builtin_registry().get(CompressionType::None).unwrap(),
        );
        let mut gzip = SegmentWriter::new(
            0,
            0,
            builtin_registry().get(CompressionType::Gzip).unwrap(),
        );
        for i in 0..10 {
            plain.append(&record(0, i)).unwrap();
            gzip.append(&record(0, i)).unwrap();
        }
        let plain = plain.encode().unwrap();
        let gzip = gzip.encode().unwrap();
        assert_eq!(plain.raw_crc, gzip.raw_crc);
        assert_eq!(plain.raw_bytes, gzip.raw_bytes);
        assert_ne!(plain.data, gzip.data);
    }

    #[test]
    fn test_rejects_out_of_order_and_foreign_records() {
        let codec = builtin_registry().get(CompressionType::None).unwrap();
        let mut writer = SegmentWriter::new(1, 0, codec);
        writer.append(&record(1, 5)).unwrap();
        assert!(writer.append(&record(1, 4)).is_err());
        assert!(writer.append(&record(2, 6)).is_err());
        // gaps (compaction) are fine
        writer.append(&record(1, 9)).unwrap();
        assert_eq!(writer.end_offset(), 10);
    }

    #[test]
    fn test_empty_segment() {
        let codec = builtin_registry().get(CompressionType::FastBlock).unwrap();
        let writer = SegmentWriter::new(3, 42, codec);
        let encoded = writer.encode().unwrap();
        assert_eq!(encoded.header.record_count, 0);
        assert_eq!(encoded.header.start_offset, 42);
        assert_eq!(encoded.header.end_offset, 42);
        assert_eq!(encoded.raw_bytes, 0);
    }
}
