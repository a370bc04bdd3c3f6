//! # Container image manifests
//!
//! Accepts, validates, stores and serves Docker image manifests over the
//! registry HTTP API.
//!
//! - Manifests are addressed by the sha256 of their exact bytes.
//! - Schema 1 (plain and signed), schema 2 and manifest lists are parsed
//!   according to the content type they are pushed with.
//! - Nothing is published unless everything it references is already stored
//!   in the same repository.
//! - Tags keep one manifest per type, and pulls negotiate between them using
//!   the client's `Accept` header.
//!
//! ## Example
//!
//! ```no_run
//! use registry_manifests::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new(storage.into())
//!     .bucket("registry")
//!     .build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, registry).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
mod config;
mod digest;
mod error;
mod list;
mod manifest;
mod media;
mod negotiate;
mod process;
mod repository;
mod schema;
mod storage;
mod sync;

pub use api::{API_VERSION_HEADER, RegistryBuilder};
pub use config::{LogFormat, RegistryConfig};
pub use digest::{Algorithm, Digest};
pub use error::{RegistryError, RegistryResult};
pub use list::{ListProcessor, Visited};
pub use manifest::DOCKER_CONTENT_DIGEST;
pub use media::{AcceptableTypes, ManifestType};
pub use negotiate::negotiate;
pub use process::{
    DEFAULT_MAX_MANIFEST_SIZE, ManifestHead, ManifestProcessor, Published, ServedManifest,
};
pub use repository::{Reference, RepositoryCoordinate};
pub use schema::{
    BlobRef, ImageManifest, ManifestList, ParsedManifest, Platform, PlatformManifest, deserialize,
};
pub use crate::storage::{ManifestRecord, PutOutcome, RegistryStorage, StoredManifest, TagRecord};
pub use sync::{DEFAULT_CONCURRENCY, Synchronizer};
