mod common;

use std::fs;

use assert_matches::assert_matches;
use ndarray::{Array2, array};
use serde_json::{Value, json};

use scrnaseq::domain::AssetName;
use scrnaseq::experiment::{AnnotationColumn, Annotations, Experiment, ExperimentKind};
use scrnaseq::matrix::Matrix;
use scrnaseq::metadata::METADATA_FILE;
use scrnaseq::{
    AnnData, ClientConfig, FetchOptions, PolishOptions, SaveHandlers, Scrnaseq, ScrnaseqError,
    UploadOptions, polish_dataset,
};

use common::{MockGypsum, bioconductor_schema, example_metadata, poisson_counts, temp_root};

fn client(root: &camino::Utf8Path) -> Scrnaseq<MockGypsum> {
    scrnaseq::logging::init_logging(true);
    Scrnaseq::new(
        MockGypsum::new(root),
        ClientConfig::default().with_cache_dir(root.as_str()),
    )
}

fn version_dir(root: &camino::Utf8Path, name: &str, version: &str) -> camino::Utf8PathBuf {
    let package: AssetName = "scRNAseq".parse().unwrap();
    scrnaseq::store::Store::new_with_root(root.to_path_buf()).version_dir(
        &package,
        &name.parse().unwrap(),
        &version.parse().unwrap(),
    )
}

fn example_experiment() -> Experiment {
    let spikes = Experiment::builder(ExperimentKind::SingleCell, (3, 6))
        .assay("counts", poisson_counts(3, 6, 1.0, 1))
        .column_data(Annotations::new(6))
        .build()
        .unwrap();
    let x = Experiment::builder(ExperimentKind::SingleCell, (40, 6))
        .assay("counts", poisson_counts(40, 6, 0.2, 2))
        .column_data(
            Annotations::new(6)
                .with_column(
                    "cell_type",
                    AnnotationColumn::Text(
                        ["neuron", "glia", "neuron", "glia", "neuron", "glia"]
                            .iter()
                            .map(|label| Some(label.to_string()))
                            .collect(),
                    ),
                )
                .unwrap(),
        )
        .reduced_dim("PCA", Array2::from_shape_fn((6, 2), |(i, j)| (i * 2 + j) as f64 / 10.0))
        .alternative_experiment("ERCC", spikes)
        .build()
        .unwrap();
    polish_dataset(x, &PolishOptions::default()).unwrap()
}

#[test]
fn save_then_fetch_round_trip() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    let dir = version_dir(&root, "test-dataset", "v1");
    let x = example_experiment();

    app.save_dataset(x.clone(), dir.as_std_path(), &example_metadata())
        .unwrap();

    let written: Value =
        serde_json::from_str(&fs::read_to_string(dir.join(METADATA_FILE)).unwrap()).unwrap();
    assert_eq!(written["bioconductor_version"], "3.19");
    let takane = &written["applications"]["takane"];
    assert_eq!(takane["type"], "single_cell_experiment");
    assert_eq!(takane["summarized_experiment"]["rows"], 40);
    assert_eq!(takane["summarized_experiment"]["columns"], 6);
    assert_eq!(takane["summarized_experiment"]["column_annotations"], json!(["cell_type"]));
    assert_eq!(takane["single_cell_experiment"]["reduced_dimensions"], json!(["PCA"]));
    assert_eq!(takane["single_cell_experiment"]["alternative_experiments"], json!(["ERCC"]));

    let fetched = app
        .fetch_dataset("test-dataset", "v1", &FetchOptions::default())
        .unwrap();
    assert_eq!(fetched.shape(), (40, 6));
    assert!(!fetched.assay("counts").unwrap().is_realized());
    assert!(fetched.reduced_dims().get("PCA").unwrap().is_realized());
    assert_eq!(fetched.reduced_dims().get("PCA").unwrap().value(5, 1), Some(1.1));

    let realized = app
        .fetch_dataset(
            "test-dataset",
            "v1",
            &FetchOptions {
                realize_assays: true,
                ..FetchOptions::default()
            },
        )
        .unwrap();
    assert_eq!(realized.assays(), x.assays());
    assert_eq!(realized.column_data(), x.column_data());

    let metadata = app
        .fetch_metadata("test-dataset", "v1", &FetchOptions::default())
        .unwrap();
    assert_eq!(metadata["title"], "Brain scRNA-seq data, 'Zeisel' style");
}

#[test]
fn invalid_metadata_writes_nothing() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    let dir = version_dir(&root, "bad", "v1");
    let mut metadata = example_metadata();
    metadata.taxonomy_id = vec!["mouse".to_string()];

    let err = app
        .save_dataset(example_experiment(), dir.as_std_path(), &metadata)
        .unwrap_err();
    assert_matches!(err, ScrnaseqError::Validation(_));
    assert!(!dir.join(METADATA_FILE).exists());
    assert!(!dir.exists());
}

#[test]
fn object_block_is_validated_before_metadata_is_written() {
    let (_temp, root) = temp_root();
    let mut schema = bioconductor_schema();
    schema
        .pointer_mut("/properties/applications/properties/takane/properties")
        .unwrap()
        .as_object_mut()
        .unwrap()
        .insert(
            "summarized_experiment".to_string(),
            json!({"type": "object", "properties": {"rows": {"maximum": 1}}}),
        );
    let app = Scrnaseq::new(
        MockGypsum::new(&root).with_schema(schema),
        ClientConfig::default().with_cache_dir(root.as_str()),
    );
    let dir = version_dir(&root, "too-many-rows", "v1");

    let err = app
        .save_dataset(example_experiment(), dir.as_std_path(), &example_metadata())
        .unwrap_err();
    assert_matches!(err, ScrnaseqError::Validation(message) if message.contains("rows"));
    assert!(!dir.join(METADATA_FILE).exists());
    assert!(dir.join("OBJECT").exists());
    assert!(dir.join("assays/0/OBJECT").exists());
}

#[test]
fn explicit_bioconductor_version_is_kept() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    let dir = root.join("out");
    let mut metadata = example_metadata();
    metadata.bioconductor_version = Some("3.20".to_string());

    app.save_dataset(example_experiment(), dir.as_std_path(), &metadata)
        .unwrap();
    let written: Value =
        serde_json::from_str(&fs::read_to_string(dir.join(METADATA_FILE)).unwrap()).unwrap();
    assert_eq!(written["bioconductor_version"], "3.20");
}

#[test]
fn saving_replaces_existing_directory() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    let dir = root.join("out");
    fs::create_dir_all(dir.join("stale")).unwrap();
    fs::write(dir.join("stale/file.txt"), b"old").unwrap();

    app.save_dataset(example_experiment(), dir.as_std_path(), &example_metadata())
        .unwrap();
    assert!(!dir.join("stale").exists());
    assert!(dir.join(METADATA_FILE).exists());
}

fn example_anndata() -> AnnData {
    AnnData::new(Annotations::new(3), Annotations::new(4))
        .with_x(array![
            [1.0, 0.0, 0.0, 2.0],
            [0.0, 0.0, 3.0, 0.0],
            [4.0, 0.0, 0.0, 0.0]
        ])
        .unwrap()
}

#[cfg(feature = "anndata")]
#[test]
fn anndata_is_saved_as_single_cell_experiment() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    let dir = root.join("adata");

    app.save_dataset(example_anndata(), dir.as_std_path(), &example_metadata())
        .unwrap();
    let written: Value =
        serde_json::from_str(&fs::read_to_string(dir.join(METADATA_FILE)).unwrap()).unwrap();
    let takane = &written["applications"]["takane"];
    assert_eq!(takane["type"], "single_cell_experiment");
    assert_eq!(takane["summarized_experiment"]["rows"], 4);
    assert_eq!(takane["summarized_experiment"]["columns"], 3);
    assert_eq!(takane["summarized_experiment"]["assays"], json!(["X"]));
}

#[test]
fn anndata_without_adapter_is_unsupported() {
    let (_temp, root) = temp_root();
    let app = client(&root).with_save_handlers(SaveHandlers::empty());
    let dir = root.join("adata");

    let err = app
        .save_dataset(example_anndata(), dir.as_std_path(), &example_metadata())
        .unwrap_err();
    assert_matches!(err, ScrnaseqError::UnsupportedType(name) if name == "AnnData");
    assert!(!dir.exists());
}

#[test]
fn summarized_experiments_have_no_single_cell_block() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    let dir = root.join("se");
    let x = Experiment::builder(ExperimentKind::Summarized, (2, 2))
        .assay("counts", Matrix::from(array![[1i64, 2], [3, 4]]))
        .build()
        .unwrap();

    app.save_dataset(x, dir.as_std_path(), &example_metadata())
        .unwrap();
    let written: Value =
        serde_json::from_str(&fs::read_to_string(dir.join(METADATA_FILE)).unwrap()).unwrap();
    let takane = &written["applications"]["takane"];
    assert_eq!(takane["type"], "summarized_experiment");
    assert!(takane.get("single_cell_experiment").is_none());
}

#[test]
fn fetches_are_memoised_until_cleared() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    let dir = version_dir(&root, "memo", "v1");
    app.save_dataset(example_experiment(), dir.as_std_path(), &example_metadata())
        .unwrap();

    app.fetch_dataset("memo", "v1", &FetchOptions::default()).unwrap();
    app.fetch_dataset("memo", "v1", &FetchOptions::default()).unwrap();
    assert_eq!(*app.client().version_calls.lock().unwrap(), 1);

    app.clear_cache();
    app.fetch_dataset("memo", "v1", &FetchOptions::default()).unwrap();
    assert_eq!(*app.client().version_calls.lock().unwrap(), 2);
}

#[test]
fn missing_dataset_is_not_found() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    assert_matches!(
        app.fetch_dataset("nothing-here", "v1", &FetchOptions::default()),
        Err(ScrnaseqError::NotFound(_))
    );
    assert_matches!(
        app.fetch_dataset("bad/name", "v1", &FetchOptions::default()),
        Err(ScrnaseqError::InvalidName(_))
    );
}

#[test]
fn versions_come_from_the_registry() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    for version in ["2023-12-13", "2023-12-14"] {
        let dir = version_dir(&root, "zeisel-brain-2015", version);
        app.save_dataset(example_experiment(), dir.as_std_path(), &example_metadata())
            .unwrap();
    }
    assert_eq!(
        app.list_versions("zeisel-brain-2015").unwrap(),
        vec!["2023-12-13", "2023-12-14"]
    );
    assert_eq!(app.fetch_latest_version("zeisel-brain-2015").unwrap(), "2023-12-14");
}

#[cfg(unix)]
#[test]
fn resaved_datasets_upload_cached_arrays_as_links() {
    let (_temp, root) = temp_root();
    let app = client(&root);
    let original = version_dir(&root, "zeisel-brain-2015", "2023-12-14");
    app.save_dataset(example_experiment(), original.as_std_path(), &example_metadata())
        .unwrap();

    let fetched = app
        .fetch_dataset("zeisel-brain-2015", "2023-12-14", &FetchOptions::default())
        .unwrap();
    let staging = root.join("staging");
    app.save_dataset(fetched, staging.as_std_path(), &example_metadata())
        .unwrap();
    assert!(
        fs::symlink_metadata(staging.join("assays/0/OBJECT"))
            .unwrap()
            .file_type()
            .is_symlink()
    );

    assert!(app
        .upload_dataset(staging.as_std_path(), "zeisel-brain-2015", "2024-01-01", &UploadOptions::default())
        .unwrap());
    let uploads = app.client().uploads.lock().unwrap();
    let listing = &uploads[0];
    let link = listing
        .links
        .iter()
        .find(|link| link.path == "assays/0/OBJECT")
        .unwrap();
    assert_eq!(link.target.name, "zeisel-brain-2015");
    assert_eq!(link.target.version, "2023-12-14");
    assert_eq!(link.target.path, "assays/0/OBJECT");
    assert!(listing.files.iter().any(|file| file.path == METADATA_FILE));
}
