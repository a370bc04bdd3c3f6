//! Manifest publish and serve paths
//!
//! A push is hashed, parsed as its declared type, checked against the store
//! and only then written. A pull resolves a tag through negotiation (or takes
//! a digest as is) and verifies the bytes before they are served.

use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::Utc;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::list::ListProcessor;
use crate::media::{AcceptableTypes, ManifestType};
use crate::negotiate::negotiate;
use crate::repository::{Reference, RepositoryCoordinate};
use crate::schema::{self, ImageConfig, ImageManifest, ParsedManifest};
use crate::storage::{ManifestRecord, PutOutcome, RegistryStorage};
use crate::sync::Synchronizer;

/// Default limit on a manifest body: 4 MiB.
pub const DEFAULT_MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Digest the manifest is stored under
    pub digest: Digest,
    /// Declared type it was stored as
    pub manifest_type: ManifestType,
    /// Whether this push wrote anything
    pub outcome: PutOutcome,
}

/// A manifest selected for a pull.
#[derive(Debug, Clone)]
pub struct ServedManifest {
    /// Digest of `bytes`
    pub digest: Digest,
    /// Type the manifest was stored as
    pub manifest_type: ManifestType,
    /// The stored bytes, verified against `digest`
    pub bytes: Bytes,
}

/// What a `HEAD` needs to know about a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHead {
    /// Resolved digest
    pub digest: Digest,
    /// Type the manifest was stored as
    pub manifest_type: ManifestType,
    /// Body length in bytes
    pub size: u64,
}

/// Publishes and serves manifests for every repository of a store.
#[derive(Debug, Clone)]
pub struct ManifestProcessor {
    storage: RegistryStorage,
    synchronizer: Synchronizer,
    lists: ListProcessor,
    max_manifest_size: usize,
}

impl ManifestProcessor {
    /// Create a processor.
    pub fn new(storage: RegistryStorage, concurrency: usize, max_manifest_size: usize) -> Self {
        let synchronizer = Synchronizer::new(storage.clone(), concurrency);
        Self {
            lists: ListProcessor::new(synchronizer.clone()),
            synchronizer,
            storage,
            max_manifest_size,
        }
    }

    /// Largest manifest body accepted, in bytes.
    pub fn max_manifest_size(&self) -> usize {
        self.max_manifest_size
    }

    /// The underlying store.
    pub fn storage(&self) -> &RegistryStorage {
        &self.storage
    }

    /// Publish a manifest.
    ///
    /// The manifest type comes from `content_type` alone. When `reference`
    /// is a digest it must match the body, and no tag moves; when it is a tag
    /// the tag is pointed at the stored manifest. Nothing is written unless
    /// every reference the manifest makes is already stored.
    #[tracing::instrument(skip(self, body), fields(%repository, %reference, size = body.len()))]
    pub async fn publish(
        &self,
        repository: &RepositoryCoordinate,
        reference: &Reference,
        content_type: Option<&str>,
        body: Bytes,
    ) -> RegistryResult<Published> {
        if body.len() > self.max_manifest_size {
            return Err(RegistryError::ManifestTooLarge {
                size: body.len(),
                limit: self.max_manifest_size,
            });
        }

        let manifest_type = ManifestType::from_content_type(content_type)?;
        let mut digest = Digest::manifest(&body)?;
        if let Reference::Digest(claimed) = reference {
            if let Err(error) = claimed.verify(&body) {
                tracing::warn!(%claimed, "pushed manifest does not match its digest");
                return Err(error);
            }
            digest = claimed.clone();
        }

        let record = match schema::deserialize(manifest_type, &body)? {
            ParsedManifest::Image(image) => self.image_record(repository, image, &body).await?,
            ParsedManifest::List(list) => {
                let aggregated_blobs = self.lists.process(repository, &digest, &list).await?;
                ManifestRecord {
                    manifest_type,
                    size: body.len() as u64,
                    blobs: Vec::new(),
                    platforms: list.manifests,
                    aggregated_blobs,
                    labels: list.labels,
                    created: Utc::now(),
                }
            }
        };

        let outcome = self.storage.put(repository, &digest, &body, &record).await?;
        if let Reference::Tag(tag) = reference {
            self.storage.set_tag(repository, tag, &digest).await?;
        }

        tracing::info!(%digest, %manifest_type, ?outcome, "manifest published");
        Ok(Published {
            digest,
            manifest_type,
            outcome,
        })
    }

    async fn image_record(
        &self,
        repository: &RepositoryCoordinate,
        image: ImageManifest,
        body: &[u8],
    ) -> RegistryResult<ManifestRecord> {
        self.synchronizer
            .verify_blobs(repository, image.blobs().map(|blob| &blob.digest))
            .await?;

        // Config labels first so the manifest's own annotations win.
        let mut labels = match &image.config {
            Some(config) => self.config_labels(repository, &config.digest).await,
            None => Default::default(),
        };
        labels.extend(image.labels.clone());

        Ok(ManifestRecord {
            manifest_type: image.manifest_type,
            size: body.len() as u64,
            blobs: image.blobs().map(|blob| blob.digest.clone()).collect(),
            platforms: Vec::new(),
            aggregated_blobs: BTreeSet::new(),
            labels,
            created: Utc::now(),
        })
    }

    async fn config_labels(
        &self,
        repository: &RepositoryCoordinate,
        digest: &Digest,
    ) -> std::collections::BTreeMap<String, String> {
        match self.storage.get_blob(repository, digest).await {
            Ok(config) => ImageConfig::labels(&config),
            Err(error) => {
                tracing::warn!(%digest, %error, "could not read image config for labels");
                Default::default()
            }
        }
    }

    /// Fetch a manifest for a pull.
    ///
    /// Digests are served as stored; tags go through negotiation against
    /// `accept`. The bytes are re-hashed before they leave.
    #[tracing::instrument(skip(self, accept), fields(%repository, %reference))]
    pub async fn serve(
        &self,
        repository: &RepositoryCoordinate,
        reference: &Reference,
        accept: &AcceptableTypes,
    ) -> RegistryResult<ServedManifest> {
        let digest = self.select(repository, reference, accept).await?;
        let stored = self.storage.get(repository, &digest).await?;
        Ok(ServedManifest {
            digest,
            manifest_type: stored.record.manifest_type,
            bytes: stored.bytes,
        })
    }

    /// Resolve a manifest for a `HEAD` without reading its body.
    #[tracing::instrument(skip(self, accept), fields(%repository, %reference))]
    pub async fn resolve(
        &self,
        repository: &RepositoryCoordinate,
        reference: &Reference,
        accept: &AcceptableTypes,
    ) -> RegistryResult<ManifestHead> {
        let digest = self.select(repository, reference, accept).await?;
        if !self.storage.exists(repository, &digest).await? {
            return Err(RegistryError::manifest_unknown(reference.to_string()));
        }
        let record = self.storage.record(repository, &digest).await?;
        Ok(ManifestHead {
            digest,
            manifest_type: record.manifest_type,
            size: record.size,
        })
    }

    async fn select(
        &self,
        repository: &RepositoryCoordinate,
        reference: &Reference,
        accept: &AcceptableTypes,
    ) -> RegistryResult<Digest> {
        let tag = match reference {
            Reference::Digest(digest) => return Ok(digest.clone()),
            Reference::Tag(tag) => tag,
        };

        let unknown = || RegistryError::ManifestUnknown {
            reference: tag.clone(),
            accepted: accept.media_types(),
        };

        let record = self
            .storage
            .tag_record(repository, tag)
            .await?
            .ok_or_else(unknown)?;
        let manifest_type = negotiate(tag, &record.stored_types(), accept)?;
        record.digest_for(manifest_type).cloned().ok_or_else(unknown)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use storage::MemoryStorage;

    use super::*;

    const SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    const SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    const LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

    fn repo() -> RepositoryCoordinate {
        RepositoryCoordinate::new("library", "app").unwrap()
    }

    fn tag(name: &str) -> Reference {
        Reference::Tag(name.to_string())
    }

    fn processor() -> (storage::Storage, ManifestProcessor) {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["test"]).into();
        let registry = RegistryStorage::new(storage.clone(), "test");
        (
            storage,
            ManifestProcessor::new(registry, 4, DEFAULT_MAX_MANIFEST_SIZE),
        )
    }

    async fn push_blob(processor: &ManifestProcessor, data: &[u8]) -> Digest {
        let digest = Digest::sha256(data);
        processor
            .storage()
            .put_blob(&repo(), &digest, data)
            .await
            .unwrap();
        digest
    }

    fn schema2(config: &Digest, layers: &[&Digest]) -> Bytes {
        let layers: Vec<_> = layers
            .iter()
            .map(|digest| {
                json!({
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "size": 1,
                    "digest": digest,
                })
            })
            .collect();
        Bytes::from(
            serde_json::to_vec(&json!({
                "schemaVersion": 2,
                "mediaType": SCHEMA2,
                "config": {
                    "mediaType": crate::media::CONTAINER_CONFIG,
                    "size": 1,
                    "digest": config,
                },
                "layers": layers,
            }))
            .unwrap(),
        )
    }

    fn manifest_list(entries: &[&Published]) -> Bytes {
        let manifests: Vec<_> = entries
            .iter()
            .map(|published| {
                json!({
                    "mediaType": SCHEMA2,
                    "size": 1,
                    "digest": published.digest,
                    "platform": { "architecture": "amd64", "os": "linux" },
                })
            })
            .collect();
        Bytes::from(
            serde_json::to_vec(&json!({
                "schemaVersion": 2,
                "mediaType": LIST,
                "manifests": manifests,
            }))
            .unwrap(),
        )
    }

    async fn image(processor: &ManifestProcessor, seed: &str) -> (Bytes, Vec<Digest>) {
        let config = push_blob(processor, format!("{seed} config").as_bytes()).await;
        let layer = push_blob(processor, format!("{seed} layer").as_bytes()).await;
        (schema2(&config, &[&layer]), vec![config, layer])
    }

    #[tokio::test]
    async fn publish_then_serve_round_trips() {
        let (_, processor) = processor();
        let (body, _) = image(&processor, "app").await;

        let published = processor
            .publish(&repo(), &tag("latest"), Some(SCHEMA2), body.clone())
            .await
            .unwrap();
        assert_eq!(published.digest, Digest::sha256(&body));
        assert_eq!(published.outcome, PutOutcome::Created);

        let by_digest = processor
            .serve(
                &repo(),
                &Reference::Digest(published.digest.clone()),
                &AcceptableTypes::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_digest.bytes, body);

        let by_tag = processor
            .serve(&repo(), &tag("latest"), &AcceptableTypes::legacy())
            .await
            .unwrap();
        assert_eq!(by_tag.digest, published.digest);
        assert_eq!(by_tag.manifest_type, ManifestType::Schema2);
        assert_eq!(by_tag.bytes, body);

        let head = processor
            .resolve(&repo(), &tag("latest"), &AcceptableTypes::legacy())
            .await
            .unwrap();
        assert_eq!(head.size, body.len() as u64);
    }

    #[tokio::test]
    async fn republishing_is_a_no_op() {
        let (_, processor) = processor();
        let (body, _) = image(&processor, "app").await;

        let first = processor
            .publish(&repo(), &tag("v1"), Some(SCHEMA2), body.clone())
            .await
            .unwrap();
        let second = processor
            .publish(&repo(), &tag("v1"), Some(SCHEMA2), body)
            .await
            .unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(second.outcome, PutOutcome::Unchanged);
    }

    #[tokio::test]
    async fn missing_blob_blocks_publish() {
        let (_, processor) = processor();
        let config = push_blob(&processor, b"config").await;
        let missing: Digest =
            "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef"
                .parse()
                .unwrap();
        let body = schema2(&config, &[&missing]);
        let digest = Digest::sha256(&body);

        match processor
            .publish(&repo(), &tag("latest"), Some(SCHEMA2), body)
            .await
        {
            Err(RegistryError::SyncFailure { missing: reported }) => assert_eq!(reported, missing),
            other => panic!("expected sync failure, got {other:?}"),
        }

        assert!(!processor.storage().exists(&repo(), &digest).await.unwrap());
        assert!(
            processor
                .storage()
                .tag_record(&repo(), "latest")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn list_publish_aggregates_platform_blobs() {
        let (_, processor) = processor();
        let (m1_body, m1_blobs) = image(&processor, "amd64").await;
        let (m2_body, m2_blobs) = image(&processor, "arm64").await;

        let m1 = processor
            .publish(&repo(), &tag("amd64"), Some(SCHEMA2), m1_body)
            .await
            .unwrap();
        let m2 = processor
            .publish(&repo(), &tag("arm64"), Some(SCHEMA2), m2_body)
            .await
            .unwrap();

        let list = processor
            .publish(
                &repo(),
                &tag("latest"),
                Some(LIST),
                manifest_list(&[&m1, &m2]),
            )
            .await
            .unwrap();
        assert_eq!(list.manifest_type, ManifestType::Schema2List);

        let record = processor
            .storage()
            .record(&repo(), &list.digest)
            .await
            .unwrap();
        let expected: BTreeSet<Digest> = m1_blobs.into_iter().chain(m2_blobs).collect();
        assert_eq!(record.aggregated_blobs, expected);
        assert_eq!(record.platforms.len(), 2);
    }

    #[tokio::test]
    async fn list_with_unpublished_platform_fails() {
        let (_, processor) = processor();
        let (body, _) = image(&processor, "amd64").await;
        let m1 = processor
            .publish(&repo(), &tag("amd64"), Some(SCHEMA2), body)
            .await
            .unwrap();
        let phantom = Published {
            digest: Digest::sha256(b"never pushed"),
            manifest_type: ManifestType::Schema2,
            outcome: PutOutcome::Created,
        };

        let result = processor
            .publish(
                &repo(),
                &tag("latest"),
                Some(LIST),
                manifest_list(&[&m1, &phantom]),
            )
            .await;
        assert!(matches!(result, Err(RegistryError::SyncFailure { missing }) if missing == phantom.digest));
    }

    #[tokio::test]
    async fn tags_negotiate_between_stored_types() {
        let (_, processor) = processor();
        let (body, _) = image(&processor, "amd64").await;
        let image = processor
            .publish(&repo(), &tag("latest"), Some(SCHEMA2), body)
            .await
            .unwrap();
        let list = processor
            .publish(&repo(), &tag("latest"), Some(LIST), manifest_list(&[&image]))
            .await
            .unwrap();

        let modern = AcceptableTypes::parse([LIST, SCHEMA2]);
        let served = processor
            .serve(&repo(), &tag("latest"), &modern)
            .await
            .unwrap();
        assert_eq!(served.digest, list.digest);
        assert_eq!(served.manifest_type, ManifestType::Schema2List);

        let served = processor
            .serve(&repo(), &tag("latest"), &AcceptableTypes::parse([SCHEMA2]))
            .await
            .unwrap();
        assert_eq!(served.digest, image.digest);

        let result = processor
            .serve(&repo(), &tag("latest"), &AcceptableTypes::parse([SCHEMA1]))
            .await;
        assert!(matches!(result, Err(RegistryError::ManifestUnknown { .. })));
    }

    #[tokio::test]
    async fn corrupted_bytes_are_not_served() {
        let (raw, processor) = processor();
        let (body, _) = image(&processor, "app").await;
        let published = processor
            .publish(&repo(), &tag("latest"), Some(SCHEMA2), body)
            .await
            .unwrap();

        let path = format!(
            "library/app/manifests/sha256/{}/data",
            published.digest.hex()
        );
        raw.bucket("test")
            .write(camino::Utf8Path::new(&path), b"{\"schemaVersion\":2}")
            .await
            .unwrap();

        let result = processor
            .serve(&repo(), &tag("latest"), &AcceptableTypes::legacy())
            .await;
        assert!(matches!(result, Err(RegistryError::ManifestCorrupted { .. })));
    }

    #[tokio::test]
    async fn push_by_digest_verifies_and_leaves_tags_alone() {
        let (_, processor) = processor();
        let (body, _) = image(&processor, "app").await;
        let digest = Digest::sha256(&body);

        let wrong = Reference::Digest(Digest::sha256(b"something else"));
        assert!(matches!(
            processor
                .publish(&repo(), &wrong, Some(SCHEMA2), body.clone())
                .await,
            Err(RegistryError::DigestMismatch { .. })
        ));
        assert!(!processor.storage().exists(&repo(), &digest).await.unwrap());

        let published = processor
            .publish(&repo(), &Reference::Digest(digest.clone()), Some(SCHEMA2), body)
            .await
            .unwrap();
        assert_eq!(published.digest, digest);
        assert!(processor.storage().list_tags(&repo()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn declared_type_is_enforced() {
        let (_, processor) = processor();
        let (body, _) = image(&processor, "app").await;

        for content_type in [None, Some("application/json")] {
            assert!(matches!(
                processor
                    .publish(&repo(), &tag("latest"), content_type, body.clone())
                    .await,
                Err(RegistryError::UnsupportedManifestSchema(_))
            ));
        }

        assert!(matches!(
            processor
                .publish(&repo(), &tag("latest"), Some(LIST), body)
                .await,
            Err(RegistryError::UnsupportedManifestSchema(_))
        ));
        assert!(matches!(
            processor
                .publish(&repo(), &tag("latest"), Some(SCHEMA2), Bytes::new())
                .await,
            Err(RegistryError::InvalidManifest(_))
        ));
    }

    #[tokio::test]
    async fn oversized_manifest_is_rejected() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let processor = ManifestProcessor::new(RegistryStorage::new(storage.into(), "test"), 1, 16);

        let result = processor
            .publish(
                &repo(),
                &tag("latest"),
                Some(SCHEMA2),
                Bytes::from(vec![b' '; 17]),
            )
            .await;
        assert!(matches!(
            result,
            Err(RegistryError::ManifestTooLarge { size: 17, limit: 16 })
        ));
    }

    #[tokio::test]
    async fn labels_merge_config_and_annotations() {
        let (_, processor) = processor();
        let config = push_blob(
            &processor,
            &serde_json::to_vec(&json!({
                "config": { "Labels": { "version": "1.0", "team": "infra" } },
            }))
            .unwrap(),
        )
        .await;
        let body = Bytes::from(
            serde_json::to_vec(&json!({
                "schemaVersion": 2,
                "mediaType": SCHEMA2,
                "config": { "size": 1, "digest": config },
                "layers": [],
                "annotations": { "version": "1.1" },
            }))
            .unwrap(),
        );

        let published = processor
            .publish(&repo(), &tag("latest"), Some(SCHEMA2), body)
            .await
            .unwrap();
        let record = processor
            .storage()
            .record(&repo(), &published.digest)
            .await
            .unwrap();
        assert_eq!(record.labels["version"], "1.1");
        assert_eq!(record.labels["team"], "infra");
    }

    #[tokio::test]
    async fn unknown_references_are_unknown() {
        let (_, processor) = processor();
        assert!(matches!(
            processor
                .serve(&repo(), &tag("missing"), &AcceptableTypes::legacy())
                .await,
            Err(RegistryError::ManifestUnknown { .. })
        ));
        assert!(matches!(
            processor
                .resolve(
                    &repo(),
                    &Reference::Digest(Digest::sha256(b"absent")),
                    &AcceptableTypes::legacy()
                )
                .await,
            Err(RegistryError::ManifestUnknown { .. })
        ));
    }
}
