//! Manifest media types and `Accept` header parsing

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// Image config blob media type for schema2 manifests.
pub const CONTAINER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// The manifest schemas this registry stores and serves.
///
/// Declaration order is not significant; server-side preference lives in
/// [`ManifestType::preference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestType {
    /// Legacy unsigned schema version 1.
    Schema1,
    /// Legacy schema version 1 with JWS signatures.
    Schema1Signed,
    /// Image manifest, schema version 2.
    Schema2,
    /// Multi-platform manifest list, schema version 2.
    Schema2List,
}

impl ManifestType {
    /// Every type, most preferred first.
    pub const ALL: [ManifestType; 4] = [
        ManifestType::Schema2List,
        ManifestType::Schema2,
        ManifestType::Schema1Signed,
        ManifestType::Schema1,
    ];

    /// The wire content type.
    pub fn media_type(&self) -> &'static str {
        match self {
            ManifestType::Schema1 => "application/vnd.docker.distribution.manifest.v1+json",
            ManifestType::Schema1Signed => {
                "application/vnd.docker.distribution.manifest.v1+prettyjws"
            }
            ManifestType::Schema2 => "application/vnd.docker.distribution.manifest.v2+json",
            ManifestType::Schema2List => {
                "application/vnd.docker.distribution.manifest.list.v2+json"
            }
        }
    }

    /// The `schemaVersion` field this type carries.
    pub fn schema_version(&self) -> u64 {
        match self {
            ManifestType::Schema1 | ManifestType::Schema1Signed => 1,
            ManifestType::Schema2 | ManifestType::Schema2List => 2,
        }
    }

    /// Whether this is the multi-platform list type.
    pub fn is_list(&self) -> bool {
        matches!(self, ManifestType::Schema2List)
    }

    /// Server-side preference when several stored types are acceptable,
    /// lower is better.
    pub fn preference(&self) -> u8 {
        match self {
            ManifestType::Schema2List => 0,
            ManifestType::Schema2 => 1,
            ManifestType::Schema1Signed => 2,
            ManifestType::Schema1 => 3,
        }
    }

    /// Look up a type by media type, ignoring parameters and case.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let mime: mime::Mime = media_type.trim().parse().ok()?;
        let essence = mime.essence_str();
        Self::ALL
            .into_iter()
            .find(|kind| kind.media_type() == essence)
    }

    /// The manifest type of a push, taken from its declared `Content-Type`.
    ///
    /// The write path never sniffs the body: a missing or unknown content
    /// type is rejected.
    pub fn from_content_type(content_type: Option<&str>) -> RegistryResult<Self> {
        let content_type = content_type.ok_or_else(|| {
            RegistryError::UnsupportedManifestSchema("missing content type".to_string())
        })?;
        Self::from_media_type(content_type)
            .ok_or_else(|| RegistryError::UnsupportedManifestSchema(content_type.to_string()))
    }
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.media_type())
    }
}

/// The manifest types a client will accept, in the client's priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptableTypes {
    types: Vec<ManifestType>,
}

impl AcceptableTypes {
    /// Types assumed when the client does not say: every single-platform
    /// type. Clients that never send `Accept` predate manifest lists.
    const LEGACY: [ManifestType; 3] = [
        ManifestType::Schema2,
        ManifestType::Schema1Signed,
        ManifestType::Schema1,
    ];

    /// Parse one or more `Accept` header values.
    ///
    /// Values are comma separated and may carry `q` parameters; entries are
    /// ordered by descending `q` (stable), `q=0` entries are dropped, and
    /// media types that are not manifests are ignored. A wildcard stands for
    /// the legacy set, as does the absence of any value.
    pub fn parse<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut seen_any = false;
        let mut entries: Vec<(f32, ManifestType)> = Vec::new();

        for entry in values.into_iter().flat_map(|value| value.split(',')) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            seen_any = true;

            let Ok(mime) = entry.parse::<mime::Mime>() else {
                tracing::trace!(%entry, "ignoring unparseable accept entry");
                continue;
            };

            let quality = mime
                .get_param("q")
                .and_then(|q| q.as_str().parse::<f32>().ok())
                .unwrap_or(1.0);
            if quality <= 0.0 {
                continue;
            }

            if mime.essence_str() == "*/*" {
                entries.extend(Self::LEGACY.map(|kind| (quality, kind)));
            } else if let Some(kind) = ManifestType::from_media_type(mime.essence_str()) {
                entries.push((quality, kind));
            }
        }

        if !seen_any {
            return Self::legacy();
        }

        entries.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut types = Vec::with_capacity(entries.len());
        for (_, kind) in entries {
            if !types.contains(&kind) {
                types.push(kind);
            }
        }
        Self { types }
    }

    /// The set assumed for clients that send no `Accept` header.
    pub fn legacy() -> Self {
        Self {
            types: Self::LEGACY.to_vec(),
        }
    }

    /// Whether the client accepts this type.
    pub fn contains(&self, kind: ManifestType) -> bool {
        self.types.contains(&kind)
    }

    /// Whether no manifest type at all is acceptable.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Acceptable types, highest client priority first.
    pub fn iter(&self) -> impl Iterator<Item = ManifestType> + '_ {
        self.types.iter().copied()
    }

    /// Acceptable media types, for error reporting.
    pub fn media_types(&self) -> Vec<String> {
        self.iter().map(|kind| kind.media_type().to_string()).collect()
    }
}

impl FromIterator<ManifestType> for AcceptableTypes {
    fn from_iter<T: IntoIterator<Item = ManifestType>>(iter: T) -> Self {
        let mut types = Vec::new();
        for kind in iter {
            if !types.contains(&kind) {
                types.push(kind);
            }
        }
        Self { types }
    }
}
