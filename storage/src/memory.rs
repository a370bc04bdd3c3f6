use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use crate::driver::{Driver, Metadata, Reader, Writer};
use crate::error::StorageError;

#[derive(Debug)]
struct MemoryObject {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryObject {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that keeps objects in memory.
///
/// Buckets must exist before objects can be read from them, but uploading
/// into an unknown bucket creates it.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<Utf8PathBuf, MemoryObject>>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` with the given (empty) buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let map = buckets
            .iter()
            .map(|bucket| (bucket.to_string(), HashMap::new()))
            .collect();

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new, empty bucket.
    pub async fn create_bucket(&self, bucket: impl Into<String>) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket.into()).or_default();
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, None))?;
        objects
            .get(remote)
            .map(Metadata::from)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, Some(remote.as_str())))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, None))?;
        objects.remove(remote);
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        buf.shutdown()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, None))?;
        let mut data: &[u8] = &objects
            .get(remote)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, Some(remote.as_str())))?
            .data;

        tokio::io::copy(&mut data, local)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, None))?;

        Ok(objects
            .keys()
            .filter(|path| prefix.map_or(true, |prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect())
    }
}
