//! In-memory storage backend for testing and staged migrations.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

use super::StorageBackend;
use crate::error::StorageError;
use crate::{Error, Result};

/// In-memory storage backend on top of `object_store`.
///
/// Nothing persists between runs. Listing is ordered by key.
#[derive(Debug)]
pub struct MemoryBackend {
    store: Arc<InMemory>,
}

impl MemoryBackend {
    /// Create a new in-memory storage backend
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_error(op: &str, e: object_store::Error) -> Error {
    Error::Storage(StorageError::Backend(format!("Memory {} failed: {}", op, e)))
}

fn lookup_error(key: &str, op: &str, e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { .. } => {
            Error::Storage(StorageError::NotFound(key.to_string()))
        }
        e => backend_error(op, e),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&Path::from(key), PutPayload::from_bytes(data))
            .await
            .map_err(|e| backend_error("PUT", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(|e| lookup_error(key, "GET", e))?;

        result.bytes().await.map_err(|e| backend_error("read", e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Path::from(prefix);
        let mut keys: Vec<String> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(|e| backend_error("LIST", e))?;
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(backend_error("HEAD", e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = Path::from(key);
        // InMemory deletes are a no-op for absent keys
        self.store
            .head(&path)
            .await
            .map_err(|e| lookup_error(key, "HEAD", e))?;
        self.store
            .delete(&path)
            .await
            .map_err(|e| backend_error("DELETE", e))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let meta = self
            .store
            .head(&Path::from(key))
            .await
            .map_err(|e| lookup_error(key, "HEAD", e))?;
        Ok(meta.size as u64)
    }
}
