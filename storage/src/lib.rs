//! # Storage backends
//!
//! Object storage used by the registry: a [`Driver`] trait, the drivers that
//! implement it, and a configuration enum that builds one.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio::io;

mod driver;
mod error;
mod local;
mod memory;

#[doc(inline)]
pub use driver::{Driver, Metadata, Reader, Writer};
#[doc(inline)]
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
#[doc(inline)]
pub use local::LocalDriver;
#[doc(inline)]
pub use memory::MemoryStorage;

/// Which storage driver to build.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "driver")]
pub enum StorageConfig {
    /// In-memory storage, lost on restart.
    Memory {
        /// Bucket to create up front.
        bucket: String,
    },

    /// Files under a local directory.
    Local {
        /// Root directory for all buckets.
        path: Utf8PathBuf,
    },
}

impl StorageConfig {
    /// Build the configured driver.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory { bucket } => MemoryStorage::with_buckets(&[&bucket]).into(),
            StorageConfig::Local { path } => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|err| StorageError::io("local", err))?;
                LocalDriver::new(path).into()
            }
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A shared handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A view of this storage scoped to one bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }

    /// Size and creation time of an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    /// Whether an object exists.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(bucket, remote).await
    }

    /// Stream an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {bucket}/{remote}");
        self.driver.download(bucket, remote, writer).await
    }

    /// Stream `reader` into an object, replacing any existing one.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn upload<'d, R>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {bucket}/{remote}");
        self.driver.upload(bucket, remote, reader).await
    }

    /// Paths of the objects under `prefix`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }

    /// Remove an object. Missing objects are not an error.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, bucket: &str, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, path).await
    }
}

/// A [`Storage`] handle bound to a single bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The bucket name.
    pub fn name(&self) -> &str {
        &self.bucket
    }

    /// Size and creation time of an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Whether an object exists.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.bucket, remote).await
    }

    /// Read a whole object into memory.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn read(&self, remote: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let mut data = Vec::new();
        self.driver.download(&self.bucket, remote, &mut data).await?;
        Ok(data)
    }

    /// Write a whole object from memory, replacing any existing object.
    #[tracing::instrument(skip(self, data), fields(driver=self.driver.name(), bucket=%self.bucket, size=data.len()))]
    pub async fn write(&self, remote: &Utf8Path, data: &[u8]) -> Result<(), StorageError> {
        let mut reader = data;
        self.driver.upload(&self.bucket, remote, &mut reader).await
    }

    /// Paths of the objects under `prefix`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Remove an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }
}
