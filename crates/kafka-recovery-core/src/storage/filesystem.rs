//! Filesystem storage backend implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::StorageBackend;
use crate::error::StorageError;
use crate::Result;

/// Marker for in-flight writes; `list` never reports these.
const TMP_MARKER: &str = ".tmp-";

/// Filesystem-based storage backend
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given base path
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Convert a storage key to a filesystem path
    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let normalized = key.trim_start_matches('/');
        let relative = Path::new(normalized);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::InvalidPath(key.to_string()).into());
        }
        Ok(self.base_path.join(relative))
    }

    /// Convert a filesystem path to a storage key
    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

fn is_tmp_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.starts_with('.') && name.contains(TMP_MARKER)
        })
        .unwrap_or(false)
}

fn io_error(key: &str, what: &str, path: &Path, e: std::io::Error) -> StorageError {
    match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
        std::io::ErrorKind::PermissionDenied => {
            StorageError::PermissionDenied(format!("{}: {}", path.display(), e))
        }
        _ => StorageError::Backend(format!("Failed to {} {}: {}", what, path.display(), e)),
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(key.to_string()))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| StorageError::InvalidPath(key.to_string()))?
            .to_string_lossy()
            .into_owned();

        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(key, "create directories for", parent, e))?;

        // Write to a sibling temp file, sync, then rename over the target.
        let tmp_path = parent.join(format!(".{}{}{}", file_name, TMP_MARKER, ulid::Ulid::new()));
        let write = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_error(key, "write", &path, e).into());
        }

        trace!(key, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.key_to_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| io_error(key, "read", &path, e))?;
        Ok(Bytes::from(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();

        // Walk from the deepest directory the prefix names, then filter by the full prefix.
        let dir_prefix = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let base = self.key_to_path(dir_prefix)?;
        if !fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(results);
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| io_error(prefix, "read directory", &dir, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(prefix, "read directory", &dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error(prefix, "stat", &path, e))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if !is_tmp_file(&path) {
                    if let Some(key) = self.path_to_key(&path) {
                        if key.starts_with(prefix) {
                            results.push(key);
                        }
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| io_error(key, "delete", &path, e))?;
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let path = self.key_to_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| io_error(key, "get metadata for", &path, e))?;
        Ok(metadata.len())
    }
}
