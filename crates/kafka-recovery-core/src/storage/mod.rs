//! Storage backend abstraction and implementations.
//!
//! - **Filesystem**: durable local storage with atomic writes
//! - **Memory**: in-memory storage (for testing)

mod backend;
mod filesystem;
mod memory;

pub use backend::StorageBackend;
pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;

use crate::config::StorageConfig;
use std::sync::Arc;

/// Create the storage backend described by the config.
pub fn create_backend(config: &StorageConfig) -> Arc<dyn StorageBackend> {
    Arc::new(FilesystemBackend::new(config.root.clone()))
}

/// Delete every key under `prefix`, returning how many were removed.
pub async fn delete_prefix(storage: &dyn StorageBackend, prefix: &str) -> crate::Result<usize> {
    let keys = storage.list(prefix).await?;
    for key in &keys {
        storage.delete(key).await?;
    }
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_create_filesystem_backend() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            root: temp_dir.path().to_path_buf(),
        };
        let backend = create_backend(&config);

        let key = "test/data.txt";
        let data = Bytes::from("Hello, Filesystem!");

        backend.put(key, data.clone()).await.unwrap();
        let retrieved = backend.get(key).await.unwrap();
        assert_eq!(data, retrieved);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let backend = MemoryBackend::new();
        backend.put("a/manifest.json", Bytes::from("{}")).await.unwrap();
        backend.put("a/segments/partition-00000.seg", Bytes::from("x")).await.unwrap();
        backend.put("b/manifest.json", Bytes::from("{}")).await.unwrap();

        assert_eq!(delete_prefix(&backend, "a/").await.unwrap(), 2);
        assert_eq!(backend.list("").await.unwrap(), vec!["b/manifest.json"]);
    }
}
