//! Referential integrity checks run before a manifest is published
//!
//! Every digest a manifest references must already be stored in the same
//! repository. Checks are plain reads, so they fan out with bounded
//! concurrency; the first missing reference (in document order) aborts the
//! publish.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::pin;

use futures::{StreamExt as _, TryStreamExt as _, stream};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::repository::RepositoryCoordinate;
use crate::storage::RegistryStorage;

/// Default number of existence checks in flight for one publish.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Verifies that referenced blobs and manifests exist.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    storage: RegistryStorage,
    concurrency: usize,
}

impl Synchronizer {
    /// Create a synchronizer running at most `concurrency` checks at once.
    /// A concurrency of zero is treated as one.
    pub fn new(storage: RegistryStorage, concurrency: usize) -> Self {
        Self {
            storage,
            concurrency: concurrency.max(1),
        }
    }

    /// The storage the checks run against.
    pub fn storage(&self) -> &RegistryStorage {
        &self.storage
    }

    /// Check that every blob exists in `repository`.
    #[tracing::instrument(skip(self, digests), fields(%repository))]
    pub async fn verify_blobs<'d>(
        &self,
        repository: &RepositoryCoordinate,
        digests: impl IntoIterator<Item = &'d Digest>,
    ) -> RegistryResult<()> {
        self.verify(digests, |digest| async move {
            let present = self.storage.blob_exists(repository, &digest).await?;
            Ok((digest, present))
        })
        .await
    }

    /// Check that every manifest exists in `repository`.
    ///
    /// A stored manifest already passed this gate for its own references, so
    /// nothing below it is re-checked.
    #[tracing::instrument(skip(self, digests), fields(%repository))]
    pub async fn verify_manifests<'d>(
        &self,
        repository: &RepositoryCoordinate,
        digests: impl IntoIterator<Item = &'d Digest>,
    ) -> RegistryResult<()> {
        self.verify(digests, |digest| async move {
            let present = self.storage.exists(repository, &digest).await?;
            Ok((digest, present))
        })
        .await
    }

    async fn verify<'d, F, Fut>(
        &self,
        digests: impl IntoIterator<Item = &'d Digest>,
        check: F,
    ) -> RegistryResult<()>
    where
        F: FnMut(Digest) -> Fut,
        Fut: Future<Output = RegistryResult<(Digest, bool)>>,
    {
        let mut seen = BTreeSet::new();
        let unique: Vec<Digest> = digests
            .into_iter()
            .filter(|digest| seen.insert(*digest))
            .cloned()
            .collect();

        tracing::trace!(references = unique.len(), "checking references");

        // `buffered` yields in input order, so the reported digest is the
        // first missing one in the manifest.
        let mut checks = pin!(
            stream::iter(unique)
                .map(check)
                .buffered(self.concurrency)
        );
        while let Some((digest, present)) = checks.try_next().await? {
            if !present {
                tracing::warn!(%digest, "referenced content is missing");
                return Err(RegistryError::SyncFailure { missing: digest });
            }
        }
        Ok(())
    }
}
