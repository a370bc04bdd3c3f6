use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::driver::{Driver, Metadata, Reader, Writer};
use crate::error::{StorageError, StorageErrorKind};

/// Storage driver backed by a directory on the local filesystem.
///
/// Objects live at `<root>/<bucket>/<path>`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at the given directory.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if remote.is_absolute() || remote.as_str().split('/').any(|part| part == "..") {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                eyre::eyre!("path escapes bucket: {remote}"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }
        Ok(self.root.join(bucket).join(remote))
    }

    async fn write_staged(
        &self,
        staging: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(staging)
                .await
                .wrap_err("create staged file")
                .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?,
        );

        tokio::io::copy(local, &mut writer)
            .await
            .wrap_err("copy into local file")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;

        writer
            .shutdown()
            .await
            .wrap_err("shutdown writer")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;
        Ok(())
    }

    fn io_error(&self, bucket: &str, remote: &Utf8Path, err: std::io::Error) -> StorageError {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        StorageError::builder(self.name(), kind, err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(
                self.name(),
                bucket,
                Some(remote.as_str()),
            ));
        }

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| self.io_error(bucket, remote, err))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(bucket, remote, err)),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err("create parent directories")
                .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;
        }

        let staging = staging_path(&path);
        let written = match self.write_staged(&staging, local).await {
            Ok(()) => tokio::fs::rename(&staging, &path)
                .await
                .wrap_err("move staged file into place")
                .map_err(StorageError::with(self.name(), StorageErrorKind::Io)),
            Err(error) => Err(error),
        };

        if written.is_err() {
            if let Err(error) = tokio::fs::remove_file(&staging).await {
                tracing::debug!(%staging, %error, "could not remove staged file");
            }
        }
        written
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.io_error(bucket, remote, err))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .wrap_err("copy from local file")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;

        local
            .flush()
            .await
            .wrap_err("flush writer")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.root.join(bucket);
        let start = match prefix {
            Some(prefix) => self.path(bucket, prefix)?,
            None => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &start))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }
}

const STAGING_SUFFIX: &str = ".partial";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A hidden sibling of `path` that uploads are written to before being
/// renamed into place, so readers never see a partial object.
fn staging_path(path: &Utf8Path) -> Utf8PathBuf {
    let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path.file_name().unwrap_or("object");
    path.with_file_name(format!(
        ".{name}.{}.{n}{STAGING_SUFFIX}",
        std::process::id()
    ))
}

/// Walk `start`, returning files relative to `base`. A missing start
/// directory lists as empty.
#[tracing::instrument]
fn collect_list(base: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if start.is_dir() {
        visit(start, &mut files)?;
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else if !entry.file_name().ends_with(STAGING_SUFFIX) {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
