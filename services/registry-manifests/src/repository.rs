//! Repository coordinates and manifest references

use std::fmt;

use camino::Utf8PathBuf;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// The namespace a manifest, blob or tag lives in: `(project, name)`.
///
/// Nothing is ever shared between two coordinates, content addressing
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryCoordinate {
    project: String,
    name: String,
}

impl RepositoryCoordinate {
    /// Validate and build a coordinate.
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> RegistryResult<Self> {
        let project = project.into();
        let name = name.into();
        validate_component(&project)?;
        validate_component(&name)?;
        Ok(Self { project, name })
    }

    /// The project part.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The repository name part.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage prefix for everything under this coordinate.
    pub(crate) fn prefix(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.project).join(&self.name)
    }
}

impl fmt::Display for RepositoryCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

/// Lowercase alphanumeric runs joined by single `.`, `_` or `-`.
fn validate_component(component: &str) -> RegistryResult<()> {
    let invalid = || RegistryError::InvalidRepository(component.to_string());

    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let is_separator = |c: char| matches!(c, '.' | '_' | '-');

    let mut previous_separator = true;
    for c in component.chars() {
        if is_alnum(c) {
            previous_separator = false;
        } else if is_separator(c) && !previous_separator {
            previous_separator = true;
        } else {
            return Err(invalid());
        }
    }

    // Empty, or ending in a separator.
    if previous_separator {
        return Err(invalid());
    }
    Ok(())
}

/// How a manifest is addressed in a request: by tag or by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A mutable tag name.
    Tag(String),
    /// An immutable content digest.
    Digest(Digest),
}

impl Reference {
    /// Parse a reference: anything containing `:` must be a digest,
    /// everything else must be a valid tag.
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        if reference.contains(':') {
            return reference.parse().map(Reference::Digest);
        }

        let mut chars = reference.chars();
        let valid = reference.len() <= 128
            && chars
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

        if !valid {
            return Err(RegistryError::InvalidTag(reference.to_string()));
        }
        Ok(Reference::Tag(reference.to_string()))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => digest.fmt(f),
        }
    }
}
