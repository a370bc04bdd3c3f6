//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::digest::Digest;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The manifest body is empty or not structurally valid.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The manifest schema (or declared content type) is not one we handle.
    #[error("unsupported manifest schema: {0}")]
    UnsupportedManifestSchema(String),

    /// Content does not hash to the digest it was addressed by.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The claimed or stored digest
        expected: Digest,
        /// The digest recomputed from the bytes
        actual: Digest,
    },

    /// Stored manifest bytes no longer hash to the digest they are kept under.
    #[error("stored manifest is corrupt: expected {expected}, got {actual}")]
    ManifestCorrupted {
        /// The digest the manifest is stored under
        expected: Digest,
        /// The digest of the bytes actually stored
        actual: Digest,
    },

    /// A manifest references content which is not in the repository.
    #[error("manifest references unknown content: {missing}")]
    SyncFailure {
        /// The first reference found missing
        missing: Digest,
    },

    /// No manifest is stored for this reference (or none in an acceptable type).
    #[error("manifest unknown: {reference}")]
    ManifestUnknown {
        /// The tag or digest requested
        reference: String,
        /// Media types the client accepted, empty for digest lookups
        accepted: Vec<String>,
    },

    /// The storage backend failed while writing.
    #[error("storage write failed: {0}")]
    StorageWrite(#[source] storage::StorageError),

    /// The storage backend failed while reading.
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Blob not found
    #[error("blob unknown: {0}")]
    BlobUnknown(Digest),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag name
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Manifest body exceeds the configured limit
    #[error("manifest too large: {size} bytes exceeds the limit of {limit}")]
    ManifestTooLarge {
        /// Size of the body
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),
}

impl RegistryError {
    pub(crate) fn manifest_unknown(reference: impl Into<String>) -> Self {
        RegistryError::ManifestUnknown {
            reference: reference.into(),
            accepted: Vec::new(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobUnknown(_) | RegistryError::ManifestUnknown { .. } => {
                StatusCode::NOT_FOUND
            }
            RegistryError::InvalidManifest(_)
            | RegistryError::InvalidDigest(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::SyncFailure { .. }
            | RegistryError::BlobUploadInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::UnsupportedManifestSchema(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::ManifestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RegistryError::ManifestCorrupted { .. }
            | RegistryError::Storage(_)
            | RegistryError::StorageWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for registry error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::UnsupportedManifestSchema(_) => "MANIFEST_INVALID",
            RegistryError::DigestMismatch { .. } => "DIGEST_INVALID",
            RegistryError::SyncFailure { .. } => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::ManifestUnknown { .. } => "MANIFEST_UNKNOWN",
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::InvalidDigest(_) => "DIGEST_INVALID",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::ManifestTooLarge { .. } => "SIZE_INVALID",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::ManifestCorrupted { .. }
            | RegistryError::Storage(_)
            | RegistryError::StorageWrite(_) => "UNKNOWN",
        }
    }

    /// The offending reference, reported as the `detail` of the error envelope.
    pub fn detail(&self) -> serde_json::Value {
        match self {
            RegistryError::DigestMismatch { expected, actual }
            | RegistryError::ManifestCorrupted { expected, actual } => {
                json!({ "expected": expected, "actual": actual })
            }
            RegistryError::SyncFailure { missing } => json!({ "digest": missing }),
            RegistryError::ManifestUnknown {
                reference,
                accepted,
            } => json!({ "reference": reference, "accepted": accepted }),
            RegistryError::BlobUnknown(digest) => json!({ "digest": digest }),
            RegistryError::InvalidDigest(digest) => json!({ "digest": digest }),
            RegistryError::InvalidRepository(name) => json!({ "name": name }),
            RegistryError::InvalidTag(tag) => json!({ "tag": tag }),
            RegistryError::ManifestTooLarge { size, limit } => {
                json!({ "size": size, "limit": limit })
            }
            _ => serde_json::Value::Null,
        }
    }
}

/// Registry error envelope
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    detail: serde_json::Value,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "registry request failed");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
                detail: self.detail(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
