use async_trait::async_trait;
use bytes::Bytes;
use glob::glob;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{validate_key, ObjectStore, StoreResult};
use crate::error::StoreError;

/// Directory-backed store: each bucket is a directory under `root`,
/// each key a relative file path inside it.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> StoreResult<PathBuf> {
        if bucket.is_empty() || bucket.contains('/') || bucket == ".." {
            return Err(StoreError::InvalidKey(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_dir(bucket)?.join(key))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
        let dir = self.bucket_dir(bucket)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&dir, e)),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> StoreResult<()> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(&dir, e))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        if !self.bucket_exists(bucket).await? {
            return Err(StoreError::NoSuchBucket(bucket.to_string()));
        }
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> StoreResult<()> {
        if !self.bucket_exists(bucket).await? {
            return Err(StoreError::NoSuchBucket(bucket.to_string()));
        }
        let final_path = self.object_path(bucket, key)?;
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }

        // write to "<key>.tmp" then rename so readers never see a partial object
        let mut tmp_name = final_path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| io_err(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| io_err(&final_path, e))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let dir = self.bucket_dir(bucket)?;
        if !self.bucket_exists(bucket).await? {
            return Err(StoreError::NoSuchBucket(bucket.to_string()));
        }
        let pattern = format!("{}/**/*", dir.display());
        let entries = glob(&pattern).map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut keys = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("cannot read glob entry: {:?}", e);
                    continue;
                }
            };
            if !path.is_file() || path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&dir) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
