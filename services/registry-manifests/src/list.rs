//! Manifest list handling
//!
//! A list references platform manifests, which reference blobs. Publishing a
//! list only needs its direct references to exist; the blob set reachable
//! through them is aggregated afterwards for the list's metadata record.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;

use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::repository::RepositoryCoordinate;
use crate::schema::ManifestList;
use crate::sync::Synchronizer;

/// Manifests already entered on the current traversal path.
///
/// Extending a `Visited` returns a new value and leaves the original alone,
/// so sibling branches of a traversal never see each other's entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Visited {
    digests: Arc<BTreeSet<Digest>>,
}

impl Visited {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this set with `digest` added.
    pub fn with(&self, digest: &Digest) -> Self {
        let mut digests = BTreeSet::clone(&self.digests);
        digests.insert(digest.clone());
        Self {
            digests: Arc::new(digests),
        }
    }

    /// Whether `digest` was already entered.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.digests.contains(digest)
    }

    /// Number of entered manifests.
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Whether nothing was entered yet.
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Verifies manifest lists and aggregates the blobs they reach.
#[derive(Debug, Clone)]
pub struct ListProcessor {
    synchronizer: Synchronizer,
}

impl ListProcessor {
    /// Create a processor checking references through `synchronizer`.
    pub fn new(synchronizer: Synchronizer) -> Self {
        Self { synchronizer }
    }

    /// Check every platform entry of `list` is a stored manifest, then
    /// return the union of blobs the entries reference transitively.
    ///
    /// `list_digest` is the digest of the list being published; it seeds the
    /// traversal so a list can never count itself.
    #[tracing::instrument(skip(self, list), fields(%repository, %list_digest, entries = list.manifests.len()))]
    pub async fn process(
        &self,
        repository: &RepositoryCoordinate,
        list_digest: &Digest,
        list: &ManifestList,
    ) -> RegistryResult<BTreeSet<Digest>> {
        self.synchronizer
            .verify_manifests(repository, list.manifests.iter().map(|entry| &entry.digest))
            .await?;

        let visited = Visited::new().with(list_digest);
        let mut blobs = BTreeSet::new();
        for entry in &list.manifests {
            blobs.extend(
                self.aggregate(repository, entry.digest.clone(), visited.clone())
                    .await?,
            );
        }

        tracing::debug!(blobs = blobs.len(), "aggregated manifest list blobs");
        Ok(blobs)
    }

    /// Blobs reachable from the stored manifest `digest`.
    pub fn aggregate<'a>(
        &'a self,
        repository: &'a RepositoryCoordinate,
        digest: Digest,
        visited: Visited,
    ) -> BoxFuture<'a, RegistryResult<BTreeSet<Digest>>> {
        async move {
            if visited.contains(&digest) {
                tracing::trace!(%digest, "manifest already visited");
                return Ok(BTreeSet::new());
            }

            let record = self
                .synchronizer
                .storage()
                .record(repository, &digest)
                .await?;

            if !record.manifest_type.is_list() {
                return Ok(record.blobs.into_iter().collect());
            }

            let visited = visited.with(&digest);
            let mut blobs = BTreeSet::new();
            for entry in record.platforms {
                blobs.extend(
                    self.aggregate(repository, entry.digest, visited.clone())
                        .await?,
                );
            }
            Ok(blobs)
        }
        .boxed()
    }
}
