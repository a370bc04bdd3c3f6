use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::StorageError;

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata common to every driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// When the object was written.
    pub created: DateTime<Utc>,
}

/// A storage driver: a flat namespace of objects grouped into buckets.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver, used in errors and log fields.
    fn name(&self) -> &'static str;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Check whether an object exists.
    ///
    /// `NotFound` errors are folded into `Ok(false)`, every other failure is
    /// passed through.
    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, remote).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Write an object, reading its contents from a stream. Existing objects
    /// are replaced.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Read an object into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// List the objects in a bucket, optionally filtered by a path prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }
}
