//! Manifest endpoints and the responses they build

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::media::{AcceptableTypes, ManifestType};
use crate::process::ManifestProcessor;
use crate::repository::{Reference, RepositoryCoordinate};

/// Header carrying the digest of the manifest or blob in a response.
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

/// Router for manifest operations
pub fn router(max_manifest_size: usize) -> Router<ManifestProcessor> {
    Router::new()
        .route(
            "/v2/{project}/{name}/manifests/{reference}",
            get(get_manifest)
                .head(head_manifest)
                .put(put_manifest)
                .layer(DefaultBodyLimit::max(max_manifest_size)),
        )
        .route("/v2/{project}/{name}/tags/list", get(list_tags))
}

/// A protocol response describing one manifest.
#[derive(Debug)]
struct ManifestResponse {
    status: StatusCode,
    digest: Digest,
    content_type: Option<ManifestType>,
    content_length: u64,
    location: Option<String>,
    body: Bytes,
}

impl ManifestResponse {
    fn new(status: StatusCode, digest: Digest) -> Self {
        Self {
            status,
            digest,
            content_type: None,
            content_length: 0,
            location: None,
            body: Bytes::new(),
        }
    }

    fn content_type(mut self, manifest_type: ManifestType) -> Self {
        self.content_type = Some(manifest_type);
        self
    }

    fn content_length(mut self, length: u64) -> Self {
        self.content_length = length;
        self
    }

    fn location(mut self, location: String) -> Self {
        self.location = Some(location);
        self
    }

    fn body(mut self, body: Bytes) -> Self {
        self.content_length = body.len() as u64;
        self.body = body;
        self
    }
}

impl IntoResponse for ManifestResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        let headers = response.headers_mut();

        if let Ok(digest) = HeaderValue::try_from(self.digest.to_string()) {
            headers.insert(DOCKER_CONTENT_DIGEST, digest);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.content_length));
        if let Some(manifest_type) = self.content_type {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(manifest_type.media_type()),
            );
        }
        if let Some(location) = self.location.and_then(|l| HeaderValue::try_from(l).ok()) {
            headers.insert(header::LOCATION, location);
        }

        response
    }
}

fn accepted(headers: &HeaderMap) -> AcceptableTypes {
    AcceptableTypes::parse(
        headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    )
}

/// Get a manifest
async fn get_manifest(
    State(processor): State<ManifestProcessor>,
    Path((project, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let repository = RepositoryCoordinate::new(project, name)?;
    let reference = Reference::parse(&reference)?;

    let manifest = processor
        .serve(&repository, &reference, &accepted(&headers))
        .await?;

    Ok(ManifestResponse::new(StatusCode::OK, manifest.digest)
        .content_type(manifest.manifest_type)
        .body(manifest.bytes)
        .into_response())
}

/// Check if a manifest exists
async fn head_manifest(
    State(processor): State<ManifestProcessor>,
    Path((project, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let repository = RepositoryCoordinate::new(project, name)?;
    let reference = Reference::parse(&reference)?;

    let head = processor
        .resolve(&repository, &reference, &accepted(&headers))
        .await?;

    Ok(ManifestResponse::new(StatusCode::OK, head.digest)
        .content_type(head.manifest_type)
        .content_length(head.size)
        .into_response())
}

/// Put a manifest
async fn put_manifest(
    State(processor): State<ManifestProcessor>,
    Path((project, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> RegistryResult<Response> {
    let repository = RepositoryCoordinate::new(project, name)?;
    let reference = Reference::parse(&reference)?;
    let body = body.map_err(|rejection| body_error(&processor, &headers, rejection))?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let published = processor
        .publish(&repository, &reference, content_type, body)
        .await?;

    let location = format!("/v2/{}/manifests/{}", repository, published.digest);
    Ok(ManifestResponse::new(StatusCode::CREATED, published.digest)
        .location(location)
        .into_response())
}

/// Translate a failure to buffer the manifest body into a protocol error.
fn body_error(
    processor: &ManifestProcessor,
    headers: &HeaderMap,
    rejection: BytesRejection,
) -> RegistryError {
    if rejection.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return RegistryError::InvalidManifest(rejection.body_text());
    }

    let limit = processor.max_manifest_size();
    // Chunked bodies carry no length; report the first size over the limit.
    let size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(limit.saturating_add(1));
    RegistryError::ManifestTooLarge { size, limit }
}

/// List tags for a repository
async fn list_tags(
    State(processor): State<ManifestProcessor>,
    Path((project, name)): Path<(String, String)>,
) -> RegistryResult<Json<TagList>> {
    let repository = RepositoryCoordinate::new(project, name)?;
    let tags = processor.storage().list_tags(&repository).await?;

    Ok(Json(TagList {
        name: repository.to_string(),
        tags,
    }))
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}
