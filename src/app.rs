use std::path::Path;

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::anndata::AnnData;
use crate::cache::QueryCache;
use crate::catalog::{Catalog, DatasetRecord};
use crate::codec::{RealizeHook, ReuseMode, read_object, read_object_type, save_object};
use crate::config::ClientConfig;
use crate::domain::{AssetName, DatasetId};
use crate::error::ScrnaseqError;
use crate::experiment::Experiment;
use crate::fs_util::remove_dir_if_exists;
use crate::metadata::{
    METADATA_FILE, SchemaValidator, attach_object_metadata, format_object_metadata,
    prepare_document,
};
use crate::registry::{GypsumClient, GypsumHttpClient};
use crate::search::SearchQuery;
use crate::store::Store;
use crate::transfer::UploadOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub path: Option<String>,
    pub package: Option<String>,
    pub overwrite: bool,
    pub realize_assays: bool,
    pub realize_reduced_dims: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            path: None,
            package: None,
            overwrite: false,
            realize_assays: false,
            realize_reduced_dims: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    pub latest: bool,
    pub overwrite: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            latest: true,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatasetObject {
    Experiment(Experiment),
    AnnData(AnnData),
}

impl DatasetObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            DatasetObject::Experiment(experiment) => experiment.kind().object_type(),
            DatasetObject::AnnData(_) => "AnnData",
        }
    }
}

impl From<Experiment> for DatasetObject {
    fn from(value: Experiment) -> Self {
        DatasetObject::Experiment(value)
    }
}

impl From<AnnData> for DatasetObject {
    fn from(value: AnnData) -> Self {
        DatasetObject::AnnData(value)
    }
}

pub type AnnDataConverter = Box<dyn Fn(AnnData) -> Result<Experiment, ScrnaseqError> + Send + Sync>;

pub struct SaveHandlers {
    anndata: Option<AnnDataConverter>,
}

impl Default for SaveHandlers {
    #[cfg(feature = "anndata")]
    fn default() -> Self {
        Self::empty().with_anndata(Box::new(AnnData::to_single_cell))
    }

    #[cfg(not(feature = "anndata"))]
    fn default() -> Self {
        Self::empty()
    }
}

impl SaveHandlers {
    pub fn empty() -> Self {
        Self { anndata: None }
    }

    pub fn with_anndata(mut self, converter: AnnDataConverter) -> Self {
        self.anndata = Some(converter);
        self
    }

    fn resolve(&self, x: DatasetObject) -> Result<Experiment, ScrnaseqError> {
        match x {
            DatasetObject::Experiment(experiment) => Ok(experiment),
            DatasetObject::AnnData(adata) => match &self.anndata {
                Some(convert) => convert(adata),
                None => Err(ScrnaseqError::UnsupportedType("AnnData".to_string())),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FetchKey {
    id: DatasetId,
    overwrite: bool,
    realize_assays: bool,
    realize_reduced_dims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListKey {
    query: Option<SearchQuery>,
    latest: bool,
}

pub struct Scrnaseq<C: GypsumClient> {
    client: C,
    config: ClientConfig,
    handlers: SaveHandlers,
    experiments: QueryCache<FetchKey, Experiment>,
    datasets: QueryCache<ListKey, Vec<DatasetRecord>>,
}

impl Scrnaseq<GypsumHttpClient> {
    pub fn from_config(config: ClientConfig) -> Result<Self, ScrnaseqError> {
        let client = GypsumHttpClient::new(&config)?;
        Ok(Self::new(client, config))
    }
}

impl<C: GypsumClient> Scrnaseq<C> {
    pub fn new(client: C, config: ClientConfig) -> Self {
        let capacity = config.query_cache_capacity;
        Self {
            client,
            config,
            handlers: SaveHandlers::default(),
            experiments: QueryCache::new(capacity),
            datasets: QueryCache::new(capacity),
        }
    }

    pub fn with_save_handlers(mut self, handlers: SaveHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Assays stay on disk unless `realize_assays` is set; reduced dimensions
    /// are pulled into memory unless `realize_reduced_dims` is cleared.
    pub fn fetch_dataset(
        &self,
        name: &str,
        version: &str,
        options: &FetchOptions,
    ) -> Result<Experiment, ScrnaseqError> {
        let id = self.dataset_id(name, version, options)?;
        let key = FetchKey {
            id: id.clone(),
            overwrite: options.overwrite,
            realize_assays: options.realize_assays,
            realize_reduced_dims: options.realize_reduced_dims,
        };
        let experiment = self.experiments.get_or_try_insert(key, options.overwrite, || {
            let version_dir =
                self.client
                    .save_version(&id.package, &id.name, &id.version, options.overwrite)?;
            let object_dir = match &id.path {
                Some(path) => version_dir.join(path),
                None => version_dir,
            };
            info!(dataset = %id, dir = %object_dir, "loading dataset");
            read_object(
                object_dir.as_std_path(),
                &RealizeHook {
                    realize_assays: options.realize_assays,
                    realize_reduced_dims: options.realize_reduced_dims,
                },
            )
        })?;
        Ok(Experiment::clone(&experiment))
    }

    pub fn fetch_metadata(
        &self,
        name: &str,
        version: &str,
        options: &FetchOptions,
    ) -> Result<Value, ScrnaseqError> {
        let id = self.dataset_id(name, version, options)?;
        let local = self.client.save_file(
            &id.package,
            &id.name,
            &id.version,
            &id.metadata_path(),
            options.overwrite,
        )?;
        Store::read_json(&local)
    }

    pub fn list_datasets(&self, options: &ListOptions) -> Result<Vec<DatasetRecord>, ScrnaseqError> {
        self.query_catalog(None, options)
    }

    pub fn search_datasets(
        &self,
        query: impl Into<SearchQuery>,
        options: &ListOptions,
    ) -> Result<Vec<DatasetRecord>, ScrnaseqError> {
        self.query_catalog(Some(query.into()), options)
    }

    pub fn list_versions(&self, name: &str) -> Result<Vec<String>, ScrnaseqError> {
        let package: AssetName = self.config.package.parse()?;
        self.client.list_versions(&package, &name.parse()?)
    }

    pub fn fetch_latest_version(&self, name: &str) -> Result<String, ScrnaseqError> {
        let package: AssetName = self.config.package.parse()?;
        self.client.fetch_latest(&package, &name.parse()?)
    }

    /// The metadata is validated against the Bioconductor schema before
    /// anything is written, and again once the object-derived block has been
    /// added. `_bioconductor.json` only exists when both checks pass.
    pub fn save_dataset<M: Serialize + ?Sized>(
        &self,
        x: impl Into<DatasetObject>,
        path: &Path,
        metadata: &M,
    ) -> Result<(), ScrnaseqError> {
        let x = x.into();
        debug!(object = x.type_name(), path = %path.display(), "saving dataset");
        let experiment = self.handlers.resolve(x)?;

        let mut document = prepare_document(metadata, &self.config.bioconductor_version)?;
        let validator = SchemaValidator::new(&self.client.fetch_metadata_schema(false)?)?;
        validator.validate(&Value::Object(document.clone()))?;

        remove_dir_if_exists(path)?;
        save_object(&experiment, path, ReuseMode::Symlink)?;

        let mut takane = format_object_metadata(&experiment);
        if let Value::Object(block) = &mut takane {
            block.insert("type".to_string(), Value::String(read_object_type(path)?));
        }
        attach_object_metadata(&mut document, takane)?;

        let serialized = serde_json::to_string_pretty(&Value::Object(document))
            .map_err(|err| ScrnaseqError::Json(err.to_string()))?;
        let reparsed: Value =
            serde_json::from_str(&serialized).map_err(|err| ScrnaseqError::Json(err.to_string()))?;
        validator.validate(&reparsed)?;

        let target = Utf8PathBuf::from_path_buf(path.join(METADATA_FILE)).map_err(|path| {
            ScrnaseqError::Filesystem(format!("non UTF-8 path {}", path.display()))
        })?;
        Store::write_bytes_atomic(&target, serialized.as_bytes())?;
        info!(path = %path.display(), "dataset saved");
        Ok(())
    }

    pub fn upload_dataset(
        &self,
        directory: &Path,
        name: &str,
        version: &str,
        options: &UploadOptions,
    ) -> Result<bool, ScrnaseqError> {
        let package: AssetName = self.config.package.parse()?;
        self.client.upload_directory(
            directory,
            &package,
            &name.parse()?,
            &version.parse()?,
            options,
        )
    }

    pub fn clear_cache(&self) {
        self.experiments.clear();
        self.datasets.clear();
    }

    fn dataset_id(
        &self,
        name: &str,
        version: &str,
        options: &FetchOptions,
    ) -> Result<DatasetId, ScrnaseqError> {
        let package = options.package.as_deref().unwrap_or(&self.config.package);
        DatasetId::new(name, version)?
            .with_package(package)?
            .with_path(options.path.as_deref())
    }

    fn query_catalog(
        &self,
        query: Option<SearchQuery>,
        options: &ListOptions,
    ) -> Result<Vec<DatasetRecord>, ScrnaseqError> {
        let key = ListKey {
            query: query.clone(),
            latest: options.latest,
        };
        let records = self.datasets.get_or_try_insert(key, options.overwrite, || {
            let database = self.client.fetch_metadata_database(options.overwrite)?;
            let catalog = Catalog::open(&database)?.with_project(&self.config.package);
            match &query {
                Some(query) => catalog.search_datasets(query, options.latest),
                None => catalog.list_datasets(options.latest),
            }
        })?;
        Ok(records.to_vec())
    }
}
