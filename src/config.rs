//! Client configuration.
//!
//! Loaded from a YAML file; a missing file yields the defaults so the client
//! starts with zero setup. Every field has a serde default, so partial
//! configs stay valid across upgrades.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::cache::CacheManifest;

// -----------------------------------------------------------------------------
// Config (root)
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        serde_yaml::from_str(&contents).map_err(ConfigError::Yaml)
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// ApiConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080/api/v1".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

// -----------------------------------------------------------------------------
// StorageConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".durachat/history")
}

// -----------------------------------------------------------------------------
// CacheConfig
// -----------------------------------------------------------------------------

/// Cache manifest configuration. Bump both generation identifiers whenever
/// the asset list or the API contract changes; activation then rotates the
/// tiers.
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_static_generation")]
    pub static_generation: String,
    #[serde(default = "default_dynamic_generation")]
    pub dynamic_generation: String,
    #[serde(default = "default_static_assets")]
    pub static_assets: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            static_generation: default_static_generation(),
            dynamic_generation: default_dynamic_generation(),
            static_assets: default_static_assets(),
        }
    }
}

impl From<&CacheConfig> for CacheManifest {
    fn from(config: &CacheConfig) -> Self {
        Self {
            static_generation: config.static_generation.clone(),
            dynamic_generation: config.dynamic_generation.clone(),
            static_assets: config.static_assets.clone(),
        }
    }
}

fn default_static_generation() -> String {
    "static-v3".to_string()
}

fn default_dynamic_generation() -> String {
    "dynamic-v3".to_string()
}

fn default_static_assets() -> Vec<String> {
    ["/", "/index.html", "/styles.css", "/app.js", "/manifest.json"]
        .into_iter()
        .map(String::from)
        .collect()
}
