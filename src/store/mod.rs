//! Opaque blob store used by every stage.
//!
//! The pipeline only needs bucket existence/creation plus whole-object get/put;
//! listing is used for bronze discovery and for auditing history folders.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

pub use fs::FsStore;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub const PARQUET_CONTENT_TYPE: &str = "application/octet-stream";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool>;

    async fn create_bucket(&self, bucket: &str) -> StoreResult<()>;

    /// Whole object contents. Missing objects yield [`StoreError::NotFound`].
    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Bytes>;

    /// Create or overwrite `key`. The length is that of `data`.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StoreResult<()>;

    /// Keys under `prefix`, sorted ascending.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Create `bucket` unless it already exists.
pub async fn ensure_bucket(store: &dyn ObjectStore, bucket: &str) -> StoreResult<()> {
    if !store.bucket_exists(bucket).await? {
        store.create_bucket(bucket).await?;
        tracing::info!(bucket, "created bucket");
    }
    Ok(())
}

/// Reject empty keys and keys that could escape their bucket.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
