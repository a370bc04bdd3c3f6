//! Read-side manifest type negotiation
//!
//! Picks which stored representation of a tag to serve. Writes never
//! negotiate: a push is stored as the type it declares.

use std::collections::BTreeSet;

use crate::error::{RegistryError, RegistryResult};
use crate::media::{AcceptableTypes, ManifestType};

/// Choose the manifest type to serve for `tag`.
///
/// A stored manifest list wins whenever the client accepts lists. Otherwise
/// the first of Schema2, Schema1Signed, Schema1 that is both stored and
/// acceptable is chosen, regardless of the client's own ordering among them.
pub fn negotiate(
    tag: &str,
    stored: &BTreeSet<ManifestType>,
    accept: &AcceptableTypes,
) -> RegistryResult<ManifestType> {
    let selected = ManifestType::ALL
        .into_iter()
        .filter(|kind| stored.contains(kind) && accept.contains(*kind))
        .min_by_key(ManifestType::preference);

    match selected {
        Some(kind) => {
            tracing::debug!(%tag, manifest_type = %kind, "negotiated manifest type");
            Ok(kind)
        }
        None => Err(RegistryError::ManifestUnknown {
            reference: tag.to_string(),
            accepted: accept.media_types(),
        }),
    }
}
