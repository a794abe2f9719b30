//! Compression tests.
//!
//! Every codec must be invisible to the restored data:
//! - Backup then restore yields identical records for each codec
//! - Realistic payloads shrink with the compressing codecs
//! - Corrupted payloads are reported, never silently decoded

use std::sync::Arc;

use kafka_recovery_core::compression::{compress, decompress, CodecRegistry, NoneCodec};
use kafka_recovery_core::config::CompressionType;
use kafka_recovery_core::{
    BackupCoordinator, BackupRequest, Error, PartitionStrategy, RestoreRequest,
};

use super::helpers::{content, seed_rich_topic, Harness, SOURCE, TARGET};

const ALL: [CompressionType; 4] = [
    CompressionType::None,
    CompressionType::Gzip,
    CompressionType::FastBlock,
    CompressionType::UltraFastBlock,
];

// ============================================================================
// End-to-end Transparency Tests
// ============================================================================

#[tokio::test]
async fn every_codec_restores_identical_records() {
    for compression in ALL {
        let h = Harness::new();
        seed_rich_topic(&h.source, "orders", 2, 120).await;
        h.target.create_topic("orders-restored", 2);

        let manifest = h
            .backup()
            .backup(BackupRequest::new("orders", SOURCE).with_compression(compression))
            .await
            .unwrap();
        assert_eq!(manifest.compression, compression);

        let report = h
            .restore()
            .restore(
                RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET)
                    .with_strategy(PartitionStrategy::Preserve),
            )
            .await
            .unwrap();
        assert!(report.is_success(), "{}: {:?}", compression, report.status);

        for p in 0..2 {
            assert_eq!(
                content(&h.target.records("orders-restored", p)),
                content(&h.source.records("orders", p)),
                "{} partition {}",
                compression,
                p
            );
        }
    }
}

#[tokio::test]
async fn compressing_codecs_store_fewer_bytes() {
    let h = Harness::new();
    seed_rich_topic(&h.source, "orders", 1, 300).await;

    let plain = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE).with_compression(CompressionType::None))
        .await
        .unwrap();

    for compression in &ALL[1..] {
        let manifest = h
            .backup()
            .backup(BackupRequest::new("orders", SOURCE).with_compression(*compression))
            .await
            .unwrap();
        assert_eq!(manifest.total_bytes, plain.total_bytes);
        assert!(
            manifest.stored_bytes() < plain.stored_bytes(),
            "{} stored {} bytes, uncompressed {}",
            compression,
            manifest.stored_bytes(),
            plain.stored_bytes()
        );
    }
}

#[tokio::test]
async fn unregistered_codec_is_rejected_before_the_backup_starts() {
    let h = Harness::new();
    seed_rich_topic(&h.source, "orders", 1, 5).await;

    let mut registry = CodecRegistry::new();
    registry.register(Arc::new(NoneCodec));
    let coordinator = BackupCoordinator::new(&h.config, h.storage.clone(), h.clusters.clone())
        .with_codecs(registry);

    let err = coordinator
        .backup(BackupRequest::new("orders", SOURCE).with_compression(CompressionType::Gzip))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(h.storage.list("").await.unwrap().is_empty());
}

// ============================================================================
// Payload Tests
// ============================================================================

#[test]
fn compression_kafka_like_json_records() {
    let records: Vec<String> = (0..500)
        .map(|i| {
            format!(
                r#"{{"order_id":"ORD-{:06}","customer":"cust-{}","amount":{}.{:02},"status":"PENDING"}}"#,
                i,
                i % 37,
                i * 3,
                i % 100
            )
        })
        .collect();
    let data = records.join("\n").into_bytes();

    for compression in &ALL[1..] {
        let compressed = compress(&data, *compression).unwrap();
        assert!(
            compressed.len() < data.len() * 3 / 4,
            "{} only reached {} of {}",
            compression,
            compressed.len(),
            data.len()
        );
        assert_eq!(decompress(&compressed, *compression).unwrap(), data);
    }
}

#[test]
fn compression_preserves_binary_data() {
    let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    for compression in ALL {
        let compressed = compress(&data, compression).unwrap();
        assert_eq!(decompress(&compressed, compression).unwrap(), data);
    }
}

#[test]
fn compression_empty_input() {
    for compression in ALL {
        let compressed = compress(&[], compression).unwrap();
        assert!(decompress(&compressed, compression).unwrap().is_empty());
    }
}

// ============================================================================
// Error Handling Tests
// ============================================================================

#[test]
fn decompression_truncated_data_returns_error() {
    let data = b"hello world, hello world, hello world".repeat(100);
    for compression in &ALL[1..] {
        let compressed = compress(&data, *compression).unwrap();
        let truncated = &compressed[..compressed.len() / 2];
        assert!(
            matches!(decompress(truncated, *compression), Err(Error::Compression(_))),
            "{} accepted truncated input",
            compression
        );
    }
}
