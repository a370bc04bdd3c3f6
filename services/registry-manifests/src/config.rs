//! Registry server configuration

use std::net::SocketAddr;

use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::api::RegistryBuilder;
use crate::process::DEFAULT_MAX_MANIFEST_SIZE;
use crate::sync::DEFAULT_CONCURRENCY;

/// How the server formats its logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Configuration for a registry server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Address to listen on
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Storage backend
    pub storage: StorageConfig,

    /// Bucket holding all repositories
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Existence checks in flight for one publish
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,

    /// Largest manifest accepted, in bytes
    #[serde(default = "default_max_manifest_size")]
    pub max_manifest_size: usize,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_bucket() -> String {
    "registry".to_string()
}

fn default_sync_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_max_manifest_size() -> usize {
    DEFAULT_MAX_MANIFEST_SIZE
}

impl RegistryConfig {
    /// Parse a TOML configuration document.
    #[cfg(feature = "cli")]
    pub fn from_toml(document: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(document)
    }

    /// Build the storage backend and a registry builder configured from this.
    pub async fn builder(&self) -> Result<RegistryBuilder, StorageError> {
        let storage = self.storage.clone().build().await?;
        Ok(RegistryBuilder::new(storage)
            .bucket(self.bucket.clone())
            .sync_concurrency(self.sync_concurrency.max(1))
            .max_manifest_size(self.max_manifest_size))
    }
}
