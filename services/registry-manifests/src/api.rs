//! API server builder and router

use axum::Router;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Json;
use axum::routing::get;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::process::{DEFAULT_MAX_MANIFEST_SIZE, ManifestProcessor};
use crate::storage::RegistryStorage;
use crate::sync::DEFAULT_CONCURRENCY;

/// Header advertising the registry protocol version on every response.
pub const API_VERSION_HEADER: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");

/// Registry builder for configuring and creating the registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: storage::Storage,
    bucket: String,
    sync_concurrency: usize,
    max_manifest_size: usize,
}

impl RegistryBuilder {
    /// Create a new registry builder over a storage backend
    pub fn new(storage: storage::Storage) -> Self {
        Self {
            storage,
            bucket: "registry".to_string(),
            sync_concurrency: DEFAULT_CONCURRENCY,
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
        }
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Set how many existence checks a single publish may run at once
    pub fn sync_concurrency(mut self, concurrency: usize) -> Self {
        self.sync_concurrency = concurrency;
        self
    }

    /// Set the largest manifest body accepted, in bytes
    pub fn max_manifest_size(mut self, size: usize) -> Self {
        self.max_manifest_size = size;
        self
    }

    /// The manifest processor this builder configures, for use outside HTTP.
    pub fn processor(&self) -> ManifestProcessor {
        ManifestProcessor::new(
            RegistryStorage::new(self.storage.clone(), self.bucket.clone()),
            self.sync_concurrency,
            self.max_manifest_size,
        )
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let processor = self.processor();

        Router::new()
            .route("/v2/", get(api_version_check))
            .merge(crate::blob::router())
            .merge(crate::manifest::router(self.max_manifest_size))
            .layer(SetResponseHeaderLayer::overriding(
                API_VERSION_HEADER,
                HeaderValue::from_static("registry/2.0"),
            ))
            .with_state(processor)
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}
