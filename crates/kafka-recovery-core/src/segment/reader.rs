//! Segment reader for restore and validation.

use bytes::{Buf, Bytes};
use tracing::debug;

use super::format::{MessageRecord, SegmentFooter, SegmentHeader, FOOTER_SIZE, HEADER_SIZE};
use crate::checksum;
use crate::compression::Codec;
use crate::manifest::PartitionSegmentRef;
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// Whether to check CRCs when opening a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Check the file CRC, the raw CRC and the record count
    Full,
    /// Parse only
    Skip,
}

/// Iterates the records of one decoded segment in offset order
#[derive(Debug)]
pub struct SegmentReader {
    header: SegmentHeader,
    footer: SegmentFooter,
    frames: Bytes,
    records_read: u32,
    last_offset: Option<u64>,
}

impl SegmentReader {
    /// Open a segment from its stored bytes
    pub fn open(data: Bytes, codec: &dyn Codec, verification: Verification) -> Result<Self> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::CorruptBackup(format!(
                "segment too small ({} bytes)",
                data.len()
            )));
        }

        let footer_start = data.len() - FOOTER_SIZE;
        let footer = SegmentFooter::from_bytes(&data[footer_start..])?;
        let header = SegmentHeader::from_bytes(&data[..HEADER_SIZE])?;

        if verification == Verification::Full {
            checksum::verify(
                &format!("segment file for partition {}", header.partition),
                footer.file_crc,
                checksum::checksum(&data[..footer_start]),
            )?;
        }

        // Stored bytes are trusted at this point, so a codec failure means corruption.
        let frames = codec
            .decompress(&data[HEADER_SIZE..footer_start])
            .map_err(|e| {
                Error::CorruptBackup(format!(
                    "segment for partition {} failed to decompress: {}",
                    header.partition, e
                ))
            })?;

        if verification == Verification::Full {
            checksum::verify(
                &format!("segment data for partition {}", header.partition),
                footer.raw_crc,
                checksum::checksum(&frames),
            )?;
        }

        debug!(
            partition = header.partition,
            records = header.record_count,
            start_offset = header.start_offset,
            end_offset = header.end_offset,
            raw_bytes = frames.len(),
            "Opened segment"
        );

        Ok(Self {
            header,
            footer,
            frames: Bytes::from(frames),
            records_read: 0,
            last_offset: None,
        })
    }

    /// Open a segment and check it against its manifest entry.
    pub fn open_for_ref(
        data: Bytes,
        codec: &dyn Codec,
        segment: &PartitionSegmentRef,
        verification: Verification,
    ) -> Result<Self> {
        if verification == Verification::Full && data.len() as u64 != segment.byte_size {
            return Err(Error::CorruptBackup(format!(
                "segment {} is {} bytes, manifest says {}",
                segment.file_path,
                data.len(),
                segment.byte_size
            )));
        }

        let reader = Self::open(data, codec, verification)?;
        let header = &reader.header;
        if header.partition != segment.partition_id
            || u64::from(header.record_count) != segment.message_count
            || header.start_offset != segment.start_offset
            || header.end_offset != segment.end_offset
        {
            return Err(Error::CorruptBackup(format!(
                "segment {} header does not match manifest entry",
                segment.file_path
            )));
        }

        if verification == Verification::Full {
            checksum::verify(&segment.file_path, segment.checksum, reader.footer.raw_crc)?;
        }

        Ok(reader)
    }

    /// Get the segment header
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// CRC32 of the uncompressed frames, as recorded in the footer
    pub fn raw_crc(&self) -> u32 {
        self.footer.raw_crc
    }

    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    pub fn records_read(&self) -> u32 {
        self.records_read
    }

    /// Read the next record
    pub fn next_record(&mut self) -> Result<Option<MessageRecord>> {
        if !self.frames.has_remaining() {
            if self.records_read != self.header.record_count {
                return Err(Error::CorruptBackup(format!(
                    "partition {} segment holds {} records, header says {}",
                    self.header.partition, self.records_read, self.header.record_count
                )));
            }
            return Ok(None);
        }

        if self.records_read == self.header.record_count {
            return Err(Error::CorruptBackup(format!(
                "partition {} segment has data past its {} records",
                self.header.partition, self.header.record_count
            )));
        }

        let record = MessageRecord::decode(&mut self.frames)?;
        if record.partition != self.header.partition
            || record.offset < self.header.start_offset
            || record.offset >= self.header.end_offset
            || self.last_offset.is_some_and(|last| record.offset <= last)
        {
            return Err(Error::CorruptBackup(format!(
                "record at offset {} is out of place in partition {} segment",
                record.offset, self.header.partition
            )));
        }

        self.last_offset = Some(record.offset);
        self.records_read += 1;
        Ok(Some(record))
    }

    /// Read all remaining records
    pub fn read_all(&mut self) -> Result<Vec<MessageRecord>> {
        let remaining = self.header.record_count.saturating_sub(self.records_read) as usize;
        let mut records = Vec::with_capacity(remaining);
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

impl Iterator for SegmentReader {
    type Item = Result<MessageRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Fetch a segment from storage and open it against its manifest entry.
pub async fn load_segment(
    storage: &dyn StorageBackend,
    codec: &dyn Codec,
    segment: &PartitionSegmentRef,
    verification: Verification,
) -> Result<SegmentReader> {
    let data = storage.get(&segment.file_path).await?;
    SegmentReader::open_for_ref(data, codec, segment, verification)
}

/// Re-read a segment completely and confirm every check passes.
pub async fn verify_segment(
    storage: &dyn StorageBackend,
    codec: &dyn Codec,
    segment: &PartitionSegmentRef,
) -> Result<u64> {
    let mut reader = load_segment(storage, codec, segment, Verification::Full).await?;
    let mut count = 0u64;
    while reader.next_record()?.is_some() {
        count += 1;
    }
    Ok(count)
}
