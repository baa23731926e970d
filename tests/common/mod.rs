#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Poisson;
use rusqlite::{Connection, params};
use serde_json::{Value, json};

use scrnaseq::domain::AssetName;
use scrnaseq::error::ScrnaseqError;
use scrnaseq::registry::GypsumClient;
use scrnaseq::store::Store;
use scrnaseq::transfer::{UploadListing, UploadOptions, prepare_directory_upload};
use scrnaseq::{DatasetMetadata, SourceEntry};

/// Serves everything from a pre-populated cache directory.
pub struct MockGypsum {
    store: Store,
    schema: Value,
    database: Option<Utf8PathBuf>,
    pub version_calls: Mutex<usize>,
    pub database_calls: Mutex<usize>,
    pub uploads: Mutex<Vec<UploadListing>>,
}

impl MockGypsum {
    pub fn new(cache_root: &Utf8Path) -> Self {
        Self {
            store: Store::new_with_root(cache_root.to_path_buf()),
            schema: bioconductor_schema(),
            database: None,
            version_calls: Mutex::new(0),
            database_calls: Mutex::new(0),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_database(mut self, database: Utf8PathBuf) -> Self {
        self.database = Some(database);
        self
    }
}

impl GypsumClient for MockGypsum {
    fn store(&self) -> &Store {
        &self.store
    }

    fn save_version(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        _overwrite: bool,
    ) -> Result<Utf8PathBuf, ScrnaseqError> {
        *self.version_calls.lock().unwrap() += 1;
        let dir = self.store.version_dir(package, name, version);
        if !dir.exists() {
            return Err(ScrnaseqError::NotFound(format!("{package}/{name}/{version}")));
        }
        Ok(dir)
    }

    fn save_file(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        path: &str,
        _overwrite: bool,
    ) -> Result<Utf8PathBuf, ScrnaseqError> {
        let file = self.store.version_dir(package, name, version).join(path);
        if !file.exists() {
            return Err(ScrnaseqError::NotFound(file.to_string()));
        }
        Ok(file)
    }

    fn list_versions(
        &self,
        package: &AssetName,
        name: &AssetName,
    ) -> Result<Vec<String>, ScrnaseqError> {
        let dir = self.store.bucket_root().join(package.as_str()).join(name.as_str());
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|_| ScrnaseqError::NotFound(dir.to_string()))?;
        let mut versions = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect::<Vec<_>>();
        versions.sort();
        Ok(versions)
    }

    fn fetch_latest(
        &self,
        package: &AssetName,
        name: &AssetName,
    ) -> Result<String, ScrnaseqError> {
        self.list_versions(package, name)?
            .pop()
            .ok_or_else(|| ScrnaseqError::NotFound(format!("{package}/{name}")))
    }

    fn fetch_metadata_schema(&self, _overwrite: bool) -> Result<Value, ScrnaseqError> {
        Ok(self.schema.clone())
    }

    fn fetch_metadata_database(&self, _overwrite: bool) -> Result<Utf8PathBuf, ScrnaseqError> {
        *self.database_calls.lock().unwrap() += 1;
        self.database
            .clone()
            .ok_or_else(|| ScrnaseqError::NotFound("metadata database".to_string()))
    }

    fn upload_directory(
        &self,
        directory: &Path,
        _package: &AssetName,
        _name: &AssetName,
        _version: &AssetName,
        options: &UploadOptions,
    ) -> Result<bool, ScrnaseqError> {
        let listing = prepare_directory_upload(directory, self.store.cache_root(), options.links)?;
        self.uploads.lock().unwrap().push(listing);
        Ok(true)
    }
}

pub fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

/// Cut-down version of the Bioconductor metadata schema.
pub fn bioconductor_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema",
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "description": {"type": "string"},
            "taxonomy_id": {
                "type": "array",
                "items": {"type": "string", "pattern": "^[0-9]+$"}
            },
            "genome": {"type": "array", "items": {"type": "string"}},
            "sources": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "provider": {"type": "string", "enum": ["GEO", "ArrayExpress", "PubMed", "DOI", "URL", "other"]},
                        "id": {"type": "string"},
                        "version": {"type": "string"}
                    },
                    "required": ["provider", "id"]
                }
            },
            "maintainer_name": {"type": "string"},
            "maintainer_email": {"type": "string"},
            "bioconductor_version": {"type": "string", "pattern": "^[0-9]+\\.[0-9]+$"},
            "applications": {
                "type": "object",
                "properties": {
                    "takane": {
                        "type": "object",
                        "properties": {"type": {"type": "string"}},
                        "required": ["type"]
                    }
                }
            }
        },
        "required": [
            "title", "description", "taxonomy_id", "genome", "sources",
            "maintainer_name", "maintainer_email", "bioconductor_version"
        ]
    })
}

pub fn example_metadata() -> DatasetMetadata {
    DatasetMetadata {
        title: "Brain scRNA-seq data, 'Zeisel' style".to_string(),
        description: "Mouse somatosensory cortex and hippocampus.".to_string(),
        taxonomy_id: vec!["10090".to_string()],
        genome: vec!["GRCm38".to_string()],
        sources: vec![SourceEntry::new("GEO", "GSE60361")],
        maintainer_name: "Jane Doe".to_string(),
        maintainer_email: "jane@example.org".to_string(),
        bioconductor_version: None,
        extra: Default::default(),
    }
}

/// Seeded Poisson counts, so every run sees the same matrix.
pub fn poisson_counts(rows: usize, cols: usize, lambda: f64, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let poisson = Poisson::new(lambda).unwrap();
    Array2::from_shape_fn((rows, cols), |_| rng.sample(poisson))
}

const CATALOG_SCHEMA: &str = "
CREATE TABLE versions (vid INTEGER PRIMARY KEY, project TEXT, asset TEXT, version TEXT, latest INTEGER);
CREATE TABLE paths (pid INTEGER PRIMARY KEY, vid INTEGER, path TEXT, user_id TEXT, time INTEGER, metadata TEXT);
CREATE TABLE tokens (tid INTEGER PRIMARY KEY, token TEXT UNIQUE);
CREATE TABLE fields (fid INTEGER PRIMARY KEY, field TEXT UNIQUE);
CREATE TABLE links (pid INTEGER, fid INTEGER, tid INTEGER);
";

fn dataset_meta(title: &str, description: &str, taxonomy: &str, rows: u64, columns: u64) -> Value {
    json!({
        "title": title,
        "description": description,
        "taxonomy_id": [taxonomy],
        "genome": ["GRCm38"],
        "sources": [{"provider": "GEO", "id": "GSE00000"}],
        "maintainer_name": "Jane Doe",
        "maintainer_email": "jane@example.org",
        "bioconductor_version": "3.19",
        "applications": {"takane": {
            "type": "single_cell_experiment",
            "summarized_experiment": {
                "rows": rows,
                "columns": columns,
                "assays": ["counts"],
                "column_annotations": ["cell_type"]
            },
            "single_cell_experiment": {
                "reduced_dimensions": [],
                "alternative_experiments": []
            }
        }}
    })
}

fn index_text(conn: &Connection, pid: i64, field: &str, text: &str) {
    conn.execute("INSERT OR IGNORE INTO fields (field) VALUES (?1)", params![field])
        .unwrap();
    let fid: i64 = conn
        .query_row("SELECT fid FROM fields WHERE field = ?1", params![field], |row| row.get(0))
        .unwrap();
    let lowered = text.to_lowercase();
    for token in lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
    {
        conn.execute("INSERT OR IGNORE INTO tokens (token) VALUES (?1)", params![token])
            .unwrap();
        let tid: i64 = conn
            .query_row("SELECT tid FROM tokens WHERE token = ?1", params![token], |row| {
                row.get(0)
            })
            .unwrap();
        conn.execute(
            "INSERT INTO links (pid, fid, tid) VALUES (?1, ?2, ?3)",
            params![pid, fid, tid],
        )
        .unwrap();
    }
}

/// Builds a small metadata index:
///
/// * `zeisel-brain-2015` with an older and a latest version,
/// * `baron-pancreas-2016` stored under a `human/` sub-path,
/// * one dataset of an unrelated project.
pub fn build_catalog(path: &Utf8Path) {
    let conn = Connection::open(path.as_std_path()).unwrap();
    conn.execute_batch(CATALOG_SCHEMA).unwrap();

    let versions = [
        (1, "scRNAseq", "zeisel-brain-2015", "2023-12-13", 0),
        (2, "scRNAseq", "zeisel-brain-2015", "2023-12-14", 1),
        (3, "scRNAseq", "baron-pancreas-2016", "2023-12-14", 1),
        (4, "otherProject", "brain-atlas", "v1", 1),
    ];
    for (vid, project, asset, version, latest) in versions {
        conn.execute(
            "INSERT INTO versions (vid, project, asset, version, latest) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![vid, project, asset, version, latest],
        )
        .unwrap();
    }

    let zeisel = (
        "Brain scRNA-seq data",
        "Mouse somatosensory cortex and hippocampus",
        "10090",
    );
    let baron = ("Pancreas scRNA-seq data", "Human islet cells", "9606");
    let paths = [
        (1, 1, "_bioconductor.json", zeisel, 3005),
        (2, 2, "_bioconductor.json", zeisel, 3005),
        (3, 3, "human/_bioconductor.json", baron, 8569),
        (4, 4, "_bioconductor.json", zeisel, 10),
    ];
    for (pid, vid, path, (title, description, taxonomy), columns) in paths {
        let meta = dataset_meta(title, description, taxonomy, 20006, columns);
        conn.execute(
            "INSERT INTO paths (pid, vid, path, user_id, time, metadata) VALUES (?1, ?2, ?3, 'jane', 0, ?4)",
            params![pid, vid, path, meta.to_string()],
        )
        .unwrap();
        index_text(&conn, pid, "title", title);
        index_text(&conn, pid, "description", description);
        index_text(&conn, pid, "taxonomy_id", taxonomy);
    }
}
