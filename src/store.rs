use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::AssetName;
use crate::error::ScrnaseqError;

#[derive(Debug, Clone)]
pub struct Store {
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new_with_root(cache_root: Utf8PathBuf) -> Self {
        Self { cache_root }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn bucket_root(&self) -> Utf8PathBuf {
        self.cache_root.join("bucket")
    }

    pub fn version_dir(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
    ) -> Utf8PathBuf {
        self.bucket_root()
            .join(package.as_str())
            .join(name.as_str())
            .join(version.as_str())
    }

    pub fn schema_path(&self) -> Utf8PathBuf {
        self.cache_root
            .join("schemas")
            .join("bioconductor")
            .join("v1.json")
    }

    pub fn database_path(&self) -> Utf8PathBuf {
        self.cache_root
            .join("databases")
            .join("bioconductor.sqlite3")
    }

    pub fn database_stamp_path(&self) -> Utf8PathBuf {
        self.cache_root
            .join("databases")
            .join("bioconductor.sqlite3.modified")
    }

    /// Splits a path inside the bucket into `(package, name, version, relative)`.
    pub fn parse_cached_path(&self, path: &Utf8Path) -> Option<CachedKey> {
        let relative = path.strip_prefix(self.bucket_root()).ok()?;
        let mut parts = relative.components().map(|part| part.as_str());
        let package = parts.next()?.to_string();
        let name = parts.next()?.to_string();
        let version = parts.next()?.to_string();
        let rest = parts.collect::<Vec<_>>();
        if rest.is_empty() {
            return None;
        }
        Some(CachedKey {
            package,
            name,
            version,
            path: rest.join("/"),
        })
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ScrnaseqError> {
        let parent = path
            .parent()
            .ok_or_else(|| ScrnaseqError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix(".scrnaseq-tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content)
            .map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), ScrnaseqError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| ScrnaseqError::Json(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Utf8Path) -> Result<T, ScrnaseqError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| ScrnaseqError::Filesystem(format!("{path}: {err}")))?;
        serde_json::from_str(&content).map_err(|err| ScrnaseqError::Json(format!("{path}: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedKey {
    pub package: String,
    pub name: String,
    pub version: String,
    pub path: String,
}

pub fn default_cache_dir() -> Result<Utf8PathBuf, ScrnaseqError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("scrnaseq")).ok()
        })
        .ok_or_else(|| ScrnaseqError::Filesystem("unable to resolve cache directory".to_string()))
}
