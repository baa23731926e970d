pub mod anndata;
pub mod app;
pub mod cache;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod experiment;
pub mod fs_util;
pub mod logging;
pub mod matrix;
pub mod metadata;
pub mod polish;
pub mod registry;
pub mod search;
pub mod store;
pub mod transfer;

pub use anndata::AnnData;
pub use app::{DatasetObject, FetchOptions, ListOptions, SaveHandlers, Scrnaseq};
pub use catalog::{DatasetRecord, SourceRecord};
pub use config::{ClientConfig, ConfigLoader};
pub use error::ScrnaseqError;
pub use experiment::{Annotations, Experiment, ExperimentKind};
pub use matrix::Matrix;
pub use metadata::{DatasetMetadata, SourceEntry};
pub use polish::{PolishOptions, polish_dataset};
pub use registry::{GypsumClient, GypsumHttpClient};
pub use search::{SearchQuery, define_text_query};
pub use transfer::{LinkMode, UploadOptions};
