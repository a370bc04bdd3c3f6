//! Content digests
//!
//! A [`Digest`] is always computed over the exact bytes received, never over
//! a re-serialized copy: clients re-derive the digest from what they pull.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{RegistryError, RegistryResult};

/// Hash algorithm of a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    /// `sha256`, used for everything the registry computes itself.
    Sha256,
    /// `sha512`, accepted when a client addresses content with it.
    Sha512,
}

impl Algorithm {
    /// Name used in the `<algorithm>:<hex>` form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    fn hash(&self, data: &[u8]) -> String {
        match self {
            Algorithm::Sha256 => hex::encode(Sha256::digest(data)),
            Algorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content identifier of the form `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Compute the sha256 digest of some bytes.
    pub fn sha256(data: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: Algorithm::Sha256.hash(data),
        }
    }

    /// Compute the digest of a manifest body.
    ///
    /// Unlike blobs, a manifest can never be empty.
    pub fn manifest(data: &[u8]) -> RegistryResult<Self> {
        if data.is_empty() {
            return Err(RegistryError::InvalidManifest(
                "manifest body is empty".to_string(),
            ));
        }
        Ok(Self::sha256(data))
    }

    /// The algorithm part.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex-encoded hash part.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Recompute the digest of `data` with this digest's algorithm and
    /// compare.
    pub fn verify(&self, data: &[u8]) -> RegistryResult<()> {
        let actual = Self {
            algorithm: self.algorithm,
            hex: self.algorithm.hash(data),
        };
        if actual != *self {
            return Err(RegistryError::DigestMismatch {
                expected: self.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Relative storage path for this digest: `<algorithm>/<hex>`.
    pub(crate) fn path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.algorithm.as_str()).join(&self.hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidDigest(s.to_string());

        let (algorithm, hex) = s.split_once(':').ok_or_else(invalid)?;
        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            _ => return Err(invalid()),
        };

        if hex.len() != algorithm.hex_len()
            || !hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid());
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}
