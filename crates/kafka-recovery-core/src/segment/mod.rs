//! Binary segment format: one file per partition per backup.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{MessageRecord, RecordHeader, SegmentFooter, SegmentHeader, MAGIC_BYTES, VERSION};
pub use reader::{load_segment, verify_segment, SegmentReader, Verification};
pub use writer::{EncodedSegment, SegmentWriter};
