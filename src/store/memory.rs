use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, RwLock,
    },
};

use super::{validate_key, ObjectStore, StoreResult};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
}

/// In-process store for tests and dry runs.
///
/// `fail_next(n)` makes the next `n` calls return [`StoreError::Unavailable`],
/// which lets tests drive the retry path. `fail_put_once` does the same for
/// a single object.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
    pending_failures: AtomicUsize,
    failing_puts: Mutex<HashSet<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: usize) {
        self.pending_failures.store(calls, Ordering::SeqCst);
    }

    /// Make the next put of `bucket/key` fail with [`StoreError::Unavailable`].
    pub fn fail_put_once(&self, bucket: &str, key: &str) {
        if let Ok(mut keys) = self.failing_puts.lock() {
            keys.insert((bucket.to_string(), key.to_string()));
        }
    }

    /// Content type recorded for an object, if it exists.
    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        let guard = self.buckets.read().ok()?;
        guard
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.content_type.clone())
    }

    fn check_injected_failure(&self) -> StoreResult<()> {
        let taken = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Internal("memory store lock poisoned".into())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
        self.check_injected_failure()?;
        let guard = self.buckets.read().map_err(|_| poisoned())?;
        Ok(guard.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.check_injected_failure()?;
        let mut guard = self.buckets.write().map_err(|_| poisoned())?;
        guard.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        self.check_injected_failure()?;
        let guard = self.buckets.read().map_err(|_| poisoned())?;
        let objects = guard
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StoreResult<()> {
        self.check_injected_failure()?;
        validate_key(key)?;
        let armed = self
            .failing_puts
            .lock()
            .map_err(|_| poisoned())?
            .remove(&(bucket.to_string(), key.to_string()));
        if armed {
            return Err(StoreError::Unavailable(format!("injected failure on {}", key)));
        }
        let mut guard = self.buckets.write().map_err(|_| poisoned())?;
        let objects = guard
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_injected_failure()?;
        let guard = self.buckets.read().map_err(|_| poisoned())?;
        let objects = guard
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
