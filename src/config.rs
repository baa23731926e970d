use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::DEFAULT_PACKAGE;
use crate::error::ScrnaseqError;
use crate::metadata::DEFAULT_BIOCONDUCTOR_VERSION;
use crate::store::default_cache_dir;

pub const DEFAULT_REST_URL: &str = "https://gypsum.artifactdb.com";
pub const DEFAULT_SCHEMA_URL: &str =
    "https://artifactdb.github.io/bioconductor-metadata-index/bioconductor/v1.json";
pub const DEFAULT_DATABASE_URL: &str = "https://github.com/ArtifactDB/bioconductor-metadata-index/releases/download/latest/bioconductor.sqlite3";
pub const DEFAULT_DATABASE_MODIFIED_URL: &str =
    "https://github.com/ArtifactDB/bioconductor-metadata-index/releases/download/latest/modified";

/// Client settings. Every field is optional in the JSON file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub cache_dir: Option<String>,
    pub rest_url: String,
    pub package: String,
    pub bioconductor_version: String,
    pub schema_url: String,
    pub database_url: String,
    pub database_modified_url: String,
    pub token: Option<String>,
    pub query_cache_capacity: usize,
    pub database_check_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            rest_url: DEFAULT_REST_URL.to_string(),
            package: DEFAULT_PACKAGE.to_string(),
            bioconductor_version: DEFAULT_BIOCONDUCTOR_VERSION.to_string(),
            schema_url: DEFAULT_SCHEMA_URL.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_modified_url: DEFAULT_DATABASE_MODIFIED_URL.to_string(),
            token: None,
            query_cache_capacity: 16,
            database_check_interval_secs: 3600,
        }
    }
}

impl ClientConfig {
    pub fn with_cache_dir(mut self, cache_dir: impl Into<String>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn with_rest_url(mut self, rest_url: impl Into<String>) -> Self {
        self.rest_url = rest_url.into();
        self
    }

    pub fn cache_root(&self) -> Result<Utf8PathBuf, ScrnaseqError> {
        match &self.cache_dir {
            Some(dir) => Ok(Utf8PathBuf::from(dir)),
            None => default_cache_dir(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ClientConfig, ScrnaseqError> {
        let Some(path) = path else {
            return Ok(ClientConfig::default());
        };
        let config_path = PathBuf::from(path);
        let content = fs::read_to_string(&config_path)
            .map_err(|_| ScrnaseqError::ConfigRead(config_path.clone()))?;
        Self::resolve_str(&content)
    }

    pub fn resolve_str(content: &str) -> Result<ClientConfig, ScrnaseqError> {
        let config: ClientConfig = serde_json::from_str(content)
            .map_err(|err| ScrnaseqError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(mut config: ClientConfig) -> Result<ClientConfig, ScrnaseqError> {
        config.package.parse::<crate::domain::AssetName>()?;
        config.rest_url = config.rest_url.trim_end_matches('/').to_string();
        if config.rest_url.is_empty() {
            return Err(ScrnaseqError::ConfigParse("rest_url must not be empty".to_string()));
        }
        if config.token.as_deref().is_some_and(|token| token.trim().is_empty()) {
            config.token = None;
        }
        Ok(config)
    }
}
