//! Blob operations for the registry
//!
//! Uploads are monolithic: a session is opened with `POST`, and the whole
//! blob arrives in the `PUT` that closes it.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::DOCKER_CONTENT_DIGEST;
use crate::process::ManifestProcessor;
use crate::repository::RepositoryCoordinate;

/// Router for blob operations
pub fn router() -> Router<ManifestProcessor> {
    Router::new()
        .route(
            "/v2/{project}/{name}/blobs/{digest}",
            get(get_blob).head(head_blob),
        )
        .route("/v2/{project}/{name}/blobs/uploads/", post(start_blob_upload))
        .route(
            "/v2/{project}/{name}/blobs/uploads/{uuid}",
            put(complete_blob_upload)
                .delete(cancel_blob_upload)
                .layer(DefaultBodyLimit::disable()),
        )
}

/// Get a blob
async fn get_blob(
    State(processor): State<ManifestProcessor>,
    Path((project, name, digest)): Path<(String, String, String)>,
) -> RegistryResult<Response> {
    let repository = RepositoryCoordinate::new(project, name)?;
    let digest: Digest = digest.parse()?;

    let data = processor.storage().get_blob(&repository, &digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        data,
    )
        .into_response())
}

/// Check if a blob exists
async fn head_blob(
    State(processor): State<ManifestProcessor>,
    Path((project, name, digest)): Path<(String, String, String)>,
) -> RegistryResult<Response> {
    let repository = RepositoryCoordinate::new(project, name)?;
    let digest: Digest = digest.parse()?;

    let size = processor.storage().blob_size(&repository, &digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
    )
        .into_response())
}

/// Start a blob upload session
async fn start_blob_upload(
    Path((project, name)): Path<(String, String)>,
) -> RegistryResult<Response> {
    let repository = RepositoryCoordinate::new(project, name)?;

    let uuid = Uuid::new_v4();
    let location = format!("/v2/{repository}/blobs/uploads/{uuid}");
    tracing::debug!(%repository, %uuid, "blob upload started");

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, location),
            (header::RANGE, "0-0".to_string()),
            (
                header::HeaderName::from_static("docker-upload-uuid"),
                uuid.to_string(),
            ),
        ],
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct CompleteUpload {
    digest: Option<String>,
}

/// Complete a blob upload
async fn complete_blob_upload(
    State(processor): State<ManifestProcessor>,
    Path((project, name, uuid)): Path<(String, String, String)>,
    Query(query): Query<CompleteUpload>,
    body: Bytes,
) -> RegistryResult<Response> {
    let repository = RepositoryCoordinate::new(project, name)?;
    let uuid = parse_session(&uuid)?;

    let digest: Digest = query
        .digest
        .ok_or_else(|| RegistryError::BlobUploadInvalid("missing digest".to_string()))?
        .parse()?;

    processor
        .storage()
        .put_blob(&repository, &digest, &body)
        .await?;
    tracing::info!(%repository, %uuid, %digest, "blob stored");

    let location = format!("/v2/{repository}/blobs/{digest}");

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}

/// Cancel a blob upload
async fn cancel_blob_upload(
    Path((project, name, uuid)): Path<(String, String, String)>,
) -> RegistryResult<StatusCode> {
    RepositoryCoordinate::new(project, name)?;
    parse_session(&uuid)?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_session(uuid: &str) -> RegistryResult<Uuid> {
    Uuid::parse_str(uuid)
        .map_err(|_| RegistryError::BlobUploadInvalid(format!("unknown upload session {uuid}")))
}
