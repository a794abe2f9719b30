//! Segment compression codecs.
//!
//! Codecs are looked up through a [`CodecRegistry`] keyed by [`CompressionType`],
//! so the coordinators never match on the codec themselves. The codec used for
//! a backup is recorded once in its manifest; segment files do not carry it.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};

use crate::{config::CompressionType, Error, Result};

/// A whole-buffer compression transform.
pub trait Codec: Send + Sync {
    /// Registry key for this codec
    fn tag(&self) -> CompressionType;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Passthrough codec
#[derive(Debug, Default)]
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn tag(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Gzip via flate2
#[derive(Debug)]
pub struct GzipCodec {
    level: u32,
}

impl GzipCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Codec for GzipCodec {
    fn tag(&self) -> CompressionType {
        CompressionType::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = flate2::write::GzEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::new(self.level),
        );
        encoder
            .write_all(data)
            .map_err(|e| Error::Compression(format!("Failed to write to gzip encoder: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| Error::Compression(format!("Failed to finish gzip compression: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut output = Vec::new();
        decoder
            .read_to_end(&mut output)
            .map_err(|e| Error::Compression(format!("Failed to decompress gzip data: {}", e)))?;
        Ok(output)
    }
}

/// Raw snappy blocks
#[derive(Debug, Default)]
pub struct FastBlockCodec;

impl Codec for FastBlockCodec {
    fn tag(&self) -> CompressionType {
        CompressionType::FastBlock
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Compression(format!("Failed to compress snappy data: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Compression(format!("Failed to decompress snappy data: {}", e)))
    }
}

/// LZ4 block with the uncompressed size prepended
#[derive(Debug, Default)]
pub struct UltraFastBlockCodec;

impl Codec for UltraFastBlockCodec {
    fn tag(&self) -> CompressionType {
        CompressionType::UltraFastBlock
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Compression(format!("Failed to decompress lz4 data: {}", e)))
    }
}

/// Codecs by tag.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<CompressionType, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in codec
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoneCodec));
        registry.register(Arc::new(GzipCodec::default()));
        registry.register(Arc::new(FastBlockCodec));
        registry.register(Arc::new(UltraFastBlockCodec));
        registry
    }

    /// Add or replace the codec for its tag
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.tag(), codec);
    }

    pub fn get(&self, compression: CompressionType) -> Result<Arc<dyn Codec>> {
        self.codecs.get(&compression).cloned().ok_or_else(|| {
            Error::Config(format!("No codec registered for {}", compression))
        })
    }

    pub fn contains(&self, compression: CompressionType) -> bool {
        self.codecs.contains_key(&compression)
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.codecs.keys().map(|t| t.to_string()).collect();
        tags.sort();
        f.debug_struct("CodecRegistry").field("codecs", &tags).finish()
    }
}

/// Process-wide registry of the built-in codecs
pub fn builtin_registry() -> &'static CodecRegistry {
    static REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();
    REGISTRY.get_or_init(CodecRegistry::with_builtin)
}

/// Compress data using the specified algorithm
pub fn compress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    builtin_registry().get(compression)?.compress(data)
}

/// Decompress data using the specified algorithm
pub fn decompress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    builtin_registry().get(compression)?.decompress(data)
}
