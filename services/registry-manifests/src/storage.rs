//! Storage layer for the registry
//!
//! Everything is keyed under the repository coordinate:
//!
//! ```text
//! <project>/<name>/blobs/<algorithm>/<hex>
//! <project>/<name>/manifests/<algorithm>/<hex>/data
//! <project>/<name>/manifests/<algorithm>/<hex>/meta.json
//! <project>/<name>/tags/<tag>
//! ```

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storage::{StorageBucket, StorageError, StorageErrorKind};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::media::ManifestType;
use crate::repository::RepositoryCoordinate;
use crate::schema::PlatformManifest;

/// Metadata stored next to every manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestRecord {
    /// The declared type the manifest was pushed as
    pub manifest_type: ManifestType,
    /// Length of the manifest body in bytes
    pub size: u64,
    /// Blobs referenced directly, config first
    #[serde(default)]
    pub blobs: Vec<Digest>,
    /// Platform entries, for manifest lists
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<PlatformManifest>,
    /// Every blob reachable through the platform entries, for manifest lists
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aggregated_blobs: BTreeSet<Digest>,
    /// Labels from the manifest and its config
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// When the manifest was first stored
    pub created: DateTime<Utc>,
}

/// A manifest read back from storage, verified against its digest.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    /// The exact bytes that were pushed
    pub bytes: Bytes,
    /// Metadata recorded at publish time
    pub record: ManifestRecord,
}

/// What a tag points at.
///
/// A tag remembers the last manifest published under it for each manifest
/// type, so that reads can negotiate between them, plus which push landed
/// last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TagRecord {
    /// The digest most recently assigned to the tag
    pub current: Digest,
    /// Digest per stored manifest type
    pub manifests: BTreeMap<ManifestType, Digest>,
    /// When the tag last moved
    pub updated: DateTime<Utc>,
}

impl TagRecord {
    /// The manifest types stored under this tag.
    pub fn stored_types(&self) -> BTreeSet<ManifestType> {
        self.manifests.keys().copied().collect()
    }

    /// The digest stored for a type.
    pub fn digest_for(&self, manifest_type: ManifestType) -> Option<&Digest> {
        self.manifests.get(&manifest_type)
    }
}

/// Outcome of a manifest put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The manifest was written.
    Created,
    /// Identical bytes were already stored under the digest.
    Unchanged,
}

/// Registry storage backend
#[derive(Clone, Debug)]
pub struct RegistryStorage {
    bucket: StorageBucket,
}

impl RegistryStorage {
    /// Create a new registry storage over one bucket.
    pub fn new(storage: storage::Storage, bucket: impl Into<String>) -> Self {
        Self {
            bucket: storage.bucket(bucket),
        }
    }

    fn blob_path(&self, repository: &RepositoryCoordinate, digest: &Digest) -> Utf8PathBuf {
        repository.prefix().join("blobs").join(digest.path())
    }

    fn manifest_dir(&self, repository: &RepositoryCoordinate, digest: &Digest) -> Utf8PathBuf {
        repository.prefix().join("manifests").join(digest.path())
    }

    fn manifest_path(&self, repository: &RepositoryCoordinate, digest: &Digest) -> Utf8PathBuf {
        self.manifest_dir(repository, digest).join("data")
    }

    fn record_path(&self, repository: &RepositoryCoordinate, digest: &Digest) -> Utf8PathBuf {
        self.manifest_dir(repository, digest).join("meta.json")
    }

    fn tags_dir(&self, repository: &RepositoryCoordinate) -> Utf8PathBuf {
        repository.prefix().join("tags")
    }

    fn tag_path(&self, repository: &RepositoryCoordinate, tag: &str) -> Utf8PathBuf {
        self.tags_dir(repository).join(tag)
    }

    /// Read an object, mapping a missing object to `missing()`.
    async fn read_or(
        &self,
        path: &Utf8Path,
        missing: impl FnOnce() -> RegistryError,
    ) -> RegistryResult<Vec<u8>> {
        match self.bucket.read(path).await {
            Ok(data) => Ok(data),
            Err(error) if error.is_not_found() => Err(missing()),
            Err(error) => Err(error.into()),
        }
    }

    async fn write(&self, path: &Utf8Path, data: &[u8]) -> RegistryResult<()> {
        self.bucket
            .write(path, data)
            .await
            .map_err(RegistryError::StorageWrite)
    }

    /// Check if a blob exists
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn blob_exists(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
    ) -> RegistryResult<bool> {
        Ok(self.bucket.exists(&self.blob_path(repository, digest)).await?)
    }

    /// Size of a stored blob
    pub async fn blob_size(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
    ) -> RegistryResult<u64> {
        match self.bucket.metadata(&self.blob_path(repository, digest)).await {
            Ok(metadata) => Ok(metadata.size),
            Err(error) if error.is_not_found() => Err(RegistryError::BlobUnknown(digest.clone())),
            Err(error) => Err(error.into()),
        }
    }

    /// Get a blob
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn get_blob(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
    ) -> RegistryResult<Vec<u8>> {
        self.read_or(&self.blob_path(repository, digest), || {
            RegistryError::BlobUnknown(digest.clone())
        })
        .await
    }

    /// Store a blob with verification
    #[tracing::instrument(skip(self, data), fields(%repository, %digest, size = data.len()))]
    pub async fn put_blob(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
        data: &[u8],
    ) -> RegistryResult<()> {
        digest.verify(data)?;
        self.write(&self.blob_path(repository, digest), data).await
    }

    /// Check if a manifest exists
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn exists(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
    ) -> RegistryResult<bool> {
        Ok(self
            .bucket
            .exists(&self.manifest_path(repository, digest))
            .await?)
    }

    /// Read the metadata record of a manifest without its body.
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn record(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
    ) -> RegistryResult<ManifestRecord> {
        let data = self
            .read_or(&self.record_path(repository, digest), || {
                RegistryError::manifest_unknown(digest.to_string())
            })
            .await?;
        decode_record(&self.record_path(repository, digest), &data)
    }

    /// Get a manifest by digest, verifying the stored bytes still hash to it.
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn get(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
    ) -> RegistryResult<StoredManifest> {
        let data = self
            .read_or(&self.manifest_path(repository, digest), || {
                RegistryError::manifest_unknown(digest.to_string())
            })
            .await?;

        if digest.verify(&data).is_err() {
            tracing::error!(%repository, %digest, "stored manifest does not match its digest");
            return Err(RegistryError::ManifestCorrupted {
                expected: digest.clone(),
                actual: Digest::sha256(&data),
            });
        }

        let record = self.record(repository, digest).await?;
        Ok(StoredManifest {
            bytes: Bytes::from(data),
            record,
        })
    }

    /// Put a manifest under its digest.
    ///
    /// Storing byte-identical content twice is a no-op. Different bytes under
    /// an existing digest fail with [`RegistryError::DigestMismatch`], unless
    /// the stored bytes no longer hash to the digest, in which case they are
    /// replaced. The record is written before the body, so a visible body
    /// always has a record.
    #[tracing::instrument(skip(self, data, record), fields(%repository, %digest, size = data.len()))]
    pub async fn put(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
        data: &[u8],
        record: &ManifestRecord,
    ) -> RegistryResult<PutOutcome> {
        digest.verify(data)?;

        let path = self.manifest_path(repository, digest);
        match self.bucket.read(&path).await {
            Ok(existing) if existing == data => {
                tracing::debug!("manifest already stored");
                return Ok(PutOutcome::Unchanged);
            }
            Ok(existing) if digest.verify(&existing).is_ok() => {
                tracing::warn!("stored manifest differs from pushed bytes with the same digest");
                return Err(RegistryError::DigestMismatch {
                    expected: digest.clone(),
                    actual: Digest::sha256(&existing),
                });
            }
            Ok(_) => {
                tracing::warn!("replacing stored manifest which does not match its digest");
            }
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error.into()),
        }

        let encoded = encode_record(record)?;
        self.write(&self.record_path(repository, digest), &encoded)
            .await?;
        self.write(&path, data).await?;
        Ok(PutOutcome::Created)
    }

    /// Read a tag record, if the tag has ever been set.
    #[tracing::instrument(skip(self), fields(%repository))]
    pub async fn tag_record(
        &self,
        repository: &RepositoryCoordinate,
        tag: &str,
    ) -> RegistryResult<Option<TagRecord>> {
        let path = self.tag_path(repository, tag);
        match self.bucket.read(&path).await {
            Ok(data) => decode_record(&path, &data).map(Some),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// The digest a tag currently points at.
    pub async fn resolve_tag(
        &self,
        repository: &RepositoryCoordinate,
        tag: &str,
    ) -> RegistryResult<Digest> {
        self.tag_record(repository, tag)
            .await?
            .map(|record| record.current)
            .ok_or_else(|| RegistryError::manifest_unknown(tag))
    }

    /// Point a tag at a stored manifest. Last writer wins.
    ///
    /// The manifest type is read from the manifest's record, so the digest
    /// must already be stored.
    #[tracing::instrument(skip(self), fields(%repository, %digest))]
    pub async fn set_tag(
        &self,
        repository: &RepositoryCoordinate,
        tag: &str,
        digest: &Digest,
    ) -> RegistryResult<()> {
        let manifest = self.record(repository, digest).await?;

        let mut manifests = self
            .tag_record(repository, tag)
            .await?
            .map(|record| record.manifests)
            .unwrap_or_default();
        manifests.insert(manifest.manifest_type, digest.clone());

        let record = TagRecord {
            current: digest.clone(),
            manifests,
            updated: Utc::now(),
        };
        let encoded = encode_record(&record)?;
        self.write(&self.tag_path(repository, tag), &encoded).await?;

        tracing::info!(%tag, manifest_type = %manifest.manifest_type, "tag updated");
        Ok(())
    }

    /// List tags for a repository, sorted.
    #[tracing::instrument(skip(self), fields(%repository))]
    pub async fn list_tags(&self, repository: &RepositoryCoordinate) -> RegistryResult<Vec<String>> {
        let prefix = self.tags_dir(repository);
        let files = match self.bucket.list(Some(prefix.as_path())).await {
            Ok(files) => files,
            Err(error) if error.is_not_found() => Vec::new(),
            Err(error) => return Err(error.into()),
        };

        let mut tags: Vec<String> = files
            .into_iter()
            .filter_map(|f| {
                Utf8Path::new(&f)
                    .strip_prefix(&prefix)
                    .ok()
                    .map(|tag| tag.to_string())
            })
            .collect();
        tags.sort();
        Ok(tags)
    }
}

fn encode_record<T: Serialize>(record: &T) -> RegistryResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|error| {
        RegistryError::StorageWrite(StorageError::new(
            "registry",
            StorageErrorKind::Other,
            error,
        ))
    })
}

fn decode_record<T: serde::de::DeserializeOwned>(path: &Utf8Path, data: &[u8]) -> RegistryResult<T> {
    serde_json::from_slice(data).map_err(|error| {
        RegistryError::Storage(
            StorageError::builder("registry", StorageErrorKind::Other, error)
                .path(path.as_str())
                .context("decoding stored record")
                .build(),
        )
    })
}
