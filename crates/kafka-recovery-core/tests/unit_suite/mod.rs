//! End-to-end tests for kafka-recovery-core.
//!
//! Every test runs against in-memory clusters and storage, so no broker
//! or external service is needed.

pub mod backup;
pub mod compression;
pub mod drain;
pub mod helpers;
pub mod migrate;
pub mod restore;
pub mod service;
