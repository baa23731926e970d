use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScrnaseqError;

pub const DEFAULT_PACKAGE: &str = "scRNAseq";

/// One path component of a gypsum key: a project, asset or version name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetName(String);

impl AssetName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AssetName {
    type Err = ScrnaseqError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && !normalized.starts_with("..")
            && !normalized.contains('/')
            && !normalized.contains('\\')
            && normalized.chars().all(|ch| !ch.is_control());
        if !is_valid {
            return Err(ScrnaseqError::InvalidName(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetId {
    pub package: AssetName,
    pub name: AssetName,
    pub version: AssetName,
    pub path: Option<String>,
}

impl DatasetId {
    pub fn new(name: &str, version: &str) -> Result<Self, ScrnaseqError> {
        Ok(Self {
            package: AssetName(DEFAULT_PACKAGE.to_string()),
            name: name.parse()?,
            version: version.parse()?,
            path: None,
        })
    }

    pub fn with_package(mut self, package: &str) -> Result<Self, ScrnaseqError> {
        self.package = package.parse()?;
        Ok(self)
    }

    pub fn with_path(mut self, path: Option<&str>) -> Result<Self, ScrnaseqError> {
        self.path = match path {
            Some(path) => Some(normalize_subpath(path)?),
            None => None,
        };
        Ok(self)
    }

    /// `package/name/version`, the prefix of every backend key of this version.
    pub fn version_key(&self) -> String {
        format!("{}/{}/{}", self.package, self.name, self.version)
    }

    pub fn metadata_path(&self) -> String {
        match &self.path {
            Some(path) => format!("{path}/_bioconductor.json"),
            None => "_bioconductor.json".to_string(),
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)?;
        if let Some(path) = &self.path {
            write!(f, "/{path}")?;
        }
        Ok(())
    }
}

impl FromStr for DatasetId {
    type Err = ScrnaseqError;

    /// Parses `name@version` or `name@version/sub/path`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (name, rest) = trimmed
            .split_once('@')
            .ok_or_else(|| ScrnaseqError::InvalidName(value.to_string()))?;
        let (version, path) = match rest.split_once('/') {
            Some((version, path)) => (version, Some(path)),
            None => (rest, None),
        };
        DatasetId::new(name, version)?.with_path(path)
    }
}

fn normalize_subpath(path: &str) -> Result<String, ScrnaseqError> {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty()
        || trimmed.starts_with('/')
        || trimmed.split('/').any(|part| part.is_empty() || part == "..")
    {
        return Err(ScrnaseqError::InvalidName(path.to_string()));
    }
    Ok(trimmed.to_string())
}
