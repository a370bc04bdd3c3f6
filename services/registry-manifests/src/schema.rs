//! Manifest deserialization
//!
//! A pure parse from raw bytes and a declared [`ManifestType`] into the
//! references and labels the rest of the registry works with. Nothing here
//! touches storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::media::ManifestType;

/// A reference from a manifest to a blob (config or layer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    /// Digest of the referenced blob
    pub digest: Digest,
    /// Declared size, unknown for schema1 manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Declared media type, unknown for schema1 manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// Platform a manifest list entry is built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`
    pub architecture: String,
    /// Operating system, e.g. `linux`
    pub os: String,
    /// CPU variant, e.g. `v8`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// One entry of a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    /// Digest of the platform-specific manifest
    pub digest: Digest,
    /// Declared size of that manifest
    pub size: u64,
    /// Declared media type of that manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Target platform, if declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// A parsed single-platform manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    /// Which schema it was parsed as
    pub manifest_type: ManifestType,
    /// The image config blob, absent for schema1
    pub config: Option<BlobRef>,
    /// Layer blobs, base layer first
    pub layers: Vec<BlobRef>,
    /// Free-form labels
    pub labels: BTreeMap<String, String>,
}

impl ImageManifest {
    /// Every referenced blob: config first, then layers.
    pub fn blobs(&self) -> impl Iterator<Item = &BlobRef> {
        self.config.iter().chain(self.layers.iter())
    }
}

/// A parsed multi-platform manifest list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestList {
    /// Platform entries, in document order
    pub manifests: Vec<PlatformManifest>,
    /// Free-form labels
    pub labels: BTreeMap<String, String>,
}

/// Result of deserializing a manifest body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedManifest {
    /// A single-platform manifest referencing blobs
    Image(ImageManifest),
    /// A manifest list referencing other manifests
    List(ManifestList),
}

/// Parse `bytes` as a manifest of the declared type.
///
/// Bytes that are not a JSON object, or that lack fields the schema
/// requires, fail with [`RegistryError::InvalidManifest`]. A document whose
/// `schemaVersion` or `mediaType` disagrees with the declared type fails
/// with [`RegistryError::UnsupportedManifestSchema`].
pub fn deserialize(manifest_type: ManifestType, bytes: &[u8]) -> RegistryResult<ParsedManifest> {
    if bytes.is_empty() {
        return Err(RegistryError::InvalidManifest(
            "manifest body is empty".to_string(),
        ));
    }

    let document: Value = serde_json::from_slice(bytes).map_err(invalid)?;
    if !document.is_object() {
        return Err(RegistryError::InvalidManifest(
            "manifest is not a JSON object".to_string(),
        ));
    }
    check_schema(manifest_type, &document)?;

    match manifest_type {
        ManifestType::Schema1 | ManifestType::Schema1Signed => {
            schema1(manifest_type, document).map(ParsedManifest::Image)
        }
        ManifestType::Schema2 => schema2(document).map(ParsedManifest::Image),
        ManifestType::Schema2List => list(document).map(ParsedManifest::List),
    }
}

fn invalid(error: serde_json::Error) -> RegistryError {
    RegistryError::InvalidManifest(error.to_string())
}

fn check_schema(manifest_type: ManifestType, document: &Value) -> RegistryResult<()> {
    let version = document
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            RegistryError::UnsupportedManifestSchema("missing schemaVersion".to_string())
        })?;
    if version != manifest_type.schema_version() {
        return Err(RegistryError::UnsupportedManifestSchema(format!(
            "schemaVersion {version} declared as {manifest_type}"
        )));
    }

    if let Some(media_type) = document.get("mediaType").and_then(Value::as_str) {
        if media_type != manifest_type.media_type() {
            return Err(RegistryError::UnsupportedManifestSchema(format!(
                "mediaType {media_type} declared as {manifest_type}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Schema1Document {
    fs_layers: Vec<FsLayer>,
    #[serde(default)]
    history: Vec<History>,
    #[serde(default)]
    signatures: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsLayer {
    blob_sum: Digest,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Debug, Default, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    config: Option<ContainerConfig>,
}

/// The part of an image config (schema2 config blob or schema1 history
/// entry) that carries labels.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ContainerConfig {
    #[serde(default, rename = "Labels")]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageConfig {
    #[serde(default)]
    config: Option<ContainerConfig>,
}

impl ImageConfig {
    /// Labels from a config blob. Blobs that are not JSON image configs have
    /// none.
    pub(crate) fn labels(bytes: &[u8]) -> BTreeMap<String, String> {
        serde_json::from_slice::<ImageConfig>(bytes)
            .ok()
            .and_then(|config| config.config)
            .and_then(|config| config.labels)
            .unwrap_or_default()
    }
}

fn schema1(manifest_type: ManifestType, document: Value) -> RegistryResult<ImageManifest> {
    let document: Schema1Document = serde_json::from_value(document).map_err(invalid)?;

    if manifest_type == ManifestType::Schema1Signed && document.signatures.is_empty() {
        return Err(RegistryError::InvalidManifest(
            "signed manifest carries no signatures".to_string(),
        ));
    }

    // The newest history entry describes the image as a whole.
    let labels = document
        .history
        .first()
        .and_then(|entry| serde_json::from_str::<V1Compatibility>(&entry.v1_compatibility).ok())
        .and_then(|compat| compat.config)
        .and_then(|config| config.labels)
        .unwrap_or_default();

    // fsLayers run newest first.
    let layers = document
        .fs_layers
        .into_iter()
        .rev()
        .map(|layer| BlobRef {
            digest: layer.blob_sum,
            size: None,
            media_type: None,
        })
        .collect();

    Ok(ImageManifest {
        manifest_type,
        config: None,
        layers,
        labels,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: Option<String>,
    size: u64,
    digest: Digest,
}

impl From<Descriptor> for BlobRef {
    fn from(value: Descriptor) -> Self {
        Self {
            digest: value.digest,
            size: Some(value.size),
            media_type: value.media_type,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Schema2Document {
    config: Descriptor,
    layers: Vec<Descriptor>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

fn schema2(document: Value) -> RegistryResult<ImageManifest> {
    let document: Schema2Document = serde_json::from_value(document).map_err(invalid)?;

    Ok(ImageManifest {
        manifest_type: ManifestType::Schema2,
        config: Some(document.config.into()),
        layers: document.layers.into_iter().map(BlobRef::from).collect(),
        labels: document.annotations,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocument {
    manifests: Vec<PlatformManifest>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

fn list(document: Value) -> RegistryResult<ManifestList> {
    let document: ListDocument = serde_json::from_value(document).map_err(invalid)?;

    Ok(ManifestList {
        manifests: document.manifests,
        labels: document.annotations,
    })
}
