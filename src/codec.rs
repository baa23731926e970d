use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ScrnaseqError;
use crate::experiment::{Annotations, Experiment, ExperimentKind, NamedList};
use crate::fs_util::{fs_error, hard_link_or_copy, symlink_file};
use crate::matrix::{Csr, ElementType, Matrix, ReloadedArray};

pub const OBJECT_FILE: &str = "OBJECT";
const FORMAT_VERSION: &str = "1.0";
const DENSE_ARRAY: &str = "dense_array";
const SPARSE_MATRIX: &str = "compressed_sparse_matrix";
const DATA_FRAME: &str = "data_frame";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReuseMode {
    None,
    /// Hard-link the existing files, copying when linking fails.
    Link,
    #[default]
    Symlink,
    Copy,
}

pub trait LoadHook {
    fn assay(&self, matrix: Matrix) -> Result<Matrix, ScrnaseqError> {
        Ok(matrix)
    }

    fn reduced_dim(&self, matrix: Matrix) -> Result<Matrix, ScrnaseqError> {
        Ok(matrix)
    }
}

/// Leaves every matrix as an on-disk handle.
pub struct DefaultLoad;

impl LoadHook for DefaultLoad {}

/// Pulls on-disk arrays into memory, keeping their dense or sparse layout.
#[derive(Debug, Clone, Copy)]
pub struct RealizeHook {
    pub realize_assays: bool,
    pub realize_reduced_dims: bool,
}

impl Default for RealizeHook {
    fn default() -> Self {
        Self {
            realize_assays: false,
            realize_reduced_dims: true,
        }
    }
}

impl LoadHook for RealizeHook {
    fn assay(&self, matrix: Matrix) -> Result<Matrix, ScrnaseqError> {
        match matrix {
            Matrix::Reloaded(array) if self.realize_assays => realize_array(&array),
            other => Ok(other),
        }
    }

    fn reduced_dim(&self, matrix: Matrix) -> Result<Matrix, ScrnaseqError> {
        match matrix {
            Matrix::Reloaded(array) if self.realize_reduced_dims => realize_array(&array),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectFile {
    #[serde(rename = "type")]
    object_type: String,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shape: Option<[usize; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    element: Option<ElementType>,
}

impl ObjectFile {
    fn new(object_type: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            version: FORMAT_VERSION.to_string(),
            shape: None,
            element: None,
        }
    }
}

pub fn save_object(x: &Experiment, path: &Path, reuse: ReuseMode) -> Result<(), ScrnaseqError> {
    if path.exists() {
        return Err(ScrnaseqError::Codec(format!(
            "{} already exists",
            path.display()
        )));
    }
    fs::create_dir_all(path).map_err(|err| fs_error(path, err))?;

    let (rows, cols) = x.shape();
    let mut object = ObjectFile::new(x.kind().object_type());
    object.shape = Some([rows, cols]);
    write_object_file(path, &object)?;

    save_matrices(&path.join("assays"), x.assays(), reuse)?;
    if let Some(row_data) = x.row_data() {
        save_annotations(&path.join("row_data"), row_data)?;
    }
    if let Some(column_data) = x.column_data() {
        save_annotations(&path.join("column_data"), column_data)?;
    }
    if x.kind() == ExperimentKind::SingleCell {
        if !x.reduced_dims().is_empty() {
            save_matrices(&path.join("reduced_dimensions"), x.reduced_dims(), reuse)?;
        }
        if !x.alternative_experiments().is_empty() {
            let root = path.join("alternative_experiments");
            fs::create_dir_all(&root).map_err(|err| fs_error(&root, err))?;
            write_names(&root, &x.alternative_experiment_names())?;
            for (index, (_, altexp)) in x.alternative_experiments().iter().enumerate() {
                save_object(altexp, &root.join(index.to_string()), reuse)?;
            }
        }
    }
    debug!(path = %path.display(), "saved object");
    Ok(())
}

pub fn read_object(path: &Path, hook: &dyn LoadHook) -> Result<Experiment, ScrnaseqError> {
    let object = read_object_file(path)?;
    let kind = ExperimentKind::from_object_type(&object.object_type).ok_or_else(|| {
        ScrnaseqError::Codec(format!(
            "unsupported object type '{}' at {}",
            object.object_type,
            path.display()
        ))
    })?;
    let [rows, cols] = object
        .shape
        .ok_or_else(|| ScrnaseqError::Codec(format!("missing shape in {}", path.display())))?;

    let assays = read_matrices(&path.join("assays"))?
        .map_values(|_, matrix| hook.assay(matrix))?;
    let reduced_dims = read_matrices(&path.join("reduced_dimensions"))?
        .map_values(|_, matrix| hook.reduced_dim(matrix))?;

    let mut alternatives = NamedList::new();
    let alt_root = path.join("alternative_experiments");
    if alt_root.exists() {
        for (index, name) in read_names(&alt_root)?.into_iter().enumerate() {
            alternatives.insert(name, read_object(&alt_root.join(index.to_string()), hook)?);
        }
    }

    let experiment = Experiment::builder(kind, (rows, cols)).build()?;
    experiment
        .set_assays(assays)?
        .set_row_data(read_annotations(&path.join("row_data"))?)?
        .set_column_data(read_annotations(&path.join("column_data"))?)?
        .set_reduced_dims(reduced_dims)?
        .set_alternative_experiments(alternatives)
}

pub fn read_object_type(path: &Path) -> Result<String, ScrnaseqError> {
    Ok(read_object_file(path)?.object_type)
}

pub fn realize_array(array: &ReloadedArray) -> Result<Matrix, ScrnaseqError> {
    let object = read_object_file(&array.path)?;
    let [rows, cols] = object.shape.unwrap_or(array.shape);
    let element = object.element.unwrap_or(array.element);
    match object.object_type.as_str() {
        DENSE_ARRAY => {
            let bytes = read_gz(&array.path.join("values.bin.gz"))?;
            match element {
                ElementType::Float => {
                    let values = decode_words(&bytes, f64::from_le_bytes)?;
                    Ok(Matrix::DenseFloat(to_array(rows, cols, values)?))
                }
                ElementType::Integer => {
                    let values = decode_words(&bytes, i64::from_le_bytes)?;
                    Ok(Matrix::DenseInteger(to_array(rows, cols, values)?))
                }
            }
        }
        SPARSE_MATRIX => {
            let indices = decode_words(&read_gz(&array.path.join("indices.bin.gz"))?, u64::from_le_bytes)?;
            let indptr = decode_words(&read_gz(&array.path.join("indptr.bin.gz"))?, u64::from_le_bytes)?
                .into_iter()
                .map(|value| value as usize)
                .collect::<Vec<_>>();
            let data = read_gz(&array.path.join("data.bin.gz"))?;
            match element {
                ElementType::Float => Ok(Matrix::SparseFloat(Csr::new(
                    [rows, cols],
                    decode_words(&data, f64::from_le_bytes)?,
                    indices,
                    indptr,
                )?)),
                ElementType::Integer => Ok(Matrix::SparseInteger(Csr::new(
                    [rows, cols],
                    decode_words(&data, i64::from_le_bytes)?,
                    indices,
                    indptr,
                )?)),
            }
        }
        other => Err(ScrnaseqError::Codec(format!(
            "unsupported array type '{other}' at {}",
            array.path.display()
        ))),
    }
}

fn save_matrices(
    root: &Path,
    matrices: &NamedList<Matrix>,
    reuse: ReuseMode,
) -> Result<(), ScrnaseqError> {
    fs::create_dir_all(root).map_err(|err| fs_error(root, err))?;
    write_names(root, &matrices.names())?;
    for (index, matrix) in matrices.values().enumerate() {
        save_array(matrix, &root.join(index.to_string()), reuse)?;
    }
    Ok(())
}

fn read_matrices(root: &Path) -> Result<NamedList<Matrix>, ScrnaseqError> {
    let mut matrices = NamedList::new();
    if !root.exists() {
        return Ok(matrices);
    }
    for (index, name) in read_names(root)?.into_iter().enumerate() {
        matrices.insert(name, Matrix::Reloaded(reload_array(&root.join(index.to_string()))?));
    }
    Ok(matrices)
}

fn save_array(matrix: &Matrix, dir: &Path, reuse: ReuseMode) -> Result<(), ScrnaseqError> {
    if let Matrix::Reloaded(array) = matrix {
        if reuse == ReuseMode::None {
            return save_array(&realize_array(array)?, dir, reuse);
        }
        return reuse_array(array, dir, reuse);
    }

    fs::create_dir_all(dir).map_err(|err| fs_error(dir, err))?;
    let (rows, cols) = matrix.shape();
    let mut object = ObjectFile::new(if matrix.is_sparse() {
        SPARSE_MATRIX
    } else {
        DENSE_ARRAY
    });
    object.shape = Some([rows, cols]);
    object.element = Some(matrix.element_type());
    write_object_file(dir, &object)?;

    match matrix {
        Matrix::DenseFloat(dense) => write_gz(
            &dir.join("values.bin.gz"),
            &encode_words(dense.iter().map(|value| value.to_le_bytes())),
        ),
        Matrix::DenseInteger(dense) => write_gz(
            &dir.join("values.bin.gz"),
            &encode_words(dense.iter().map(|value| value.to_le_bytes())),
        ),
        Matrix::SparseFloat(csr) => {
            write_gz(
                &dir.join("data.bin.gz"),
                &encode_words(csr.data.iter().map(|value| value.to_le_bytes())),
            )?;
            write_csr_layout(dir, &csr.indices, &csr.indptr)
        }
        Matrix::SparseInteger(csr) => {
            write_gz(
                &dir.join("data.bin.gz"),
                &encode_words(csr.data.iter().map(|value| value.to_le_bytes())),
            )?;
            write_csr_layout(dir, &csr.indices, &csr.indptr)
        }
        Matrix::Reloaded(_) => Ok(()),
    }
}

fn write_csr_layout(dir: &Path, indices: &[u64], indptr: &[usize]) -> Result<(), ScrnaseqError> {
    write_gz(
        &dir.join("indices.bin.gz"),
        &encode_words(indices.iter().map(|value| value.to_le_bytes())),
    )?;
    write_gz(
        &dir.join("indptr.bin.gz"),
        &encode_words(indptr.iter().map(|value| (*value as u64).to_le_bytes())),
    )
}

fn reuse_array(array: &ReloadedArray, dir: &Path, reuse: ReuseMode) -> Result<(), ScrnaseqError> {
    fs::create_dir_all(dir).map_err(|err| fs_error(dir, err))?;
    let entries = fs::read_dir(&array.path).map_err(|err| fs_error(&array.path, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        let dest = dir.join(entry.file_name());
        let result = match reuse {
            ReuseMode::Symlink => {
                let target = fs::canonicalize(&source).map_err(|err| fs_error(&source, err))?;
                symlink_file(&target, &dest)
            }
            ReuseMode::Link => hard_link_or_copy(&source, &dest),
            ReuseMode::Copy | ReuseMode::None => fs::copy(&source, &dest).map(|_| ()),
        };
        result.map_err(|err| fs_error(&dest, err))?;
    }
    Ok(())
}

fn reload_array(dir: &Path) -> Result<ReloadedArray, ScrnaseqError> {
    let object = read_object_file(dir)?;
    let sparse = match object.object_type.as_str() {
        DENSE_ARRAY => false,
        SPARSE_MATRIX => true,
        other => {
            return Err(ScrnaseqError::Codec(format!(
                "unsupported array type '{other}' at {}",
                dir.display()
            )));
        }
    };
    let shape = object
        .shape
        .ok_or_else(|| ScrnaseqError::Codec(format!("missing shape in {}", dir.display())))?;
    let path = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    Ok(ReloadedArray {
        path,
        shape,
        sparse,
        element: object.element.unwrap_or(ElementType::Float),
    })
}

fn save_annotations(dir: &Path, data: &Annotations) -> Result<(), ScrnaseqError> {
    fs::create_dir_all(dir).map_err(|err| fs_error(dir, err))?;
    write_object_file(dir, &ObjectFile::new(DATA_FRAME))?;
    write_json(&dir.join("data_frame.json"), data)
}

fn read_annotations(dir: &Path) -> Result<Option<Annotations>, ScrnaseqError> {
    if !dir.exists() {
        return Ok(None);
    }
    let object = read_object_file(dir)?;
    if object.object_type != DATA_FRAME {
        return Err(ScrnaseqError::Codec(format!(
            "expected a data frame at {}, found '{}'",
            dir.display(),
            object.object_type
        )));
    }
    read_json(&dir.join("data_frame.json")).map(Some)
}

fn write_object_file(dir: &Path, object: &ObjectFile) -> Result<(), ScrnaseqError> {
    write_json(&dir.join(OBJECT_FILE), object)
}

fn read_object_file(dir: &Path) -> Result<ObjectFile, ScrnaseqError> {
    let path = dir.join(OBJECT_FILE);
    if !path.exists() {
        return Err(ScrnaseqError::NotFound(format!("no object at {}", dir.display())));
    }
    read_json(&path)
}

fn write_names(dir: &Path, names: &[String]) -> Result<(), ScrnaseqError> {
    write_json(&dir.join("names.json"), &names)
}

fn read_names(dir: &Path) -> Result<Vec<String>, ScrnaseqError> {
    read_json(&dir.join("names.json"))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ScrnaseqError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| ScrnaseqError::Json(err.to_string()))?;
    fs::write(path, content).map_err(|err| fs_error(path, err))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ScrnaseqError> {
    let content = fs::read_to_string(path).map_err(|err| fs_error(path, err))?;
    serde_json::from_str(&content)
        .map_err(|err| ScrnaseqError::Codec(format!("{}: {err}", path.display())))
}

fn write_gz(path: &Path, bytes: &[u8]) -> Result<(), ScrnaseqError> {
    let file = File::create(path).map_err(|err| fs_error(path, err))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    encoder.write_all(bytes).map_err(|err| fs_error(path, err))?;
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .map_err(|err| fs_error(path, err))
}

fn read_gz(path: &Path) -> Result<Vec<u8>, ScrnaseqError> {
    let file = File::open(path).map_err(|err| fs_error(path, err))?;
    let mut bytes = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut bytes)
        .map_err(|err| fs_error(path, err))?;
    Ok(bytes)
}

fn encode_words(words: impl Iterator<Item = [u8; 8]>) -> Vec<u8> {
    words.flatten().collect()
}

fn decode_words<T>(bytes: &[u8], decode: fn([u8; 8]) -> T) -> Result<Vec<T>, ScrnaseqError> {
    if bytes.len() % 8 != 0 {
        return Err(ScrnaseqError::Codec(format!(
            "payload of {} bytes is not a whole number of 8-byte words",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            decode(word)
        })
        .collect())
}

fn to_array<T>(rows: usize, cols: usize, values: Vec<T>) -> Result<Array2<T>, ScrnaseqError> {
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|err| ScrnaseqError::Codec(format!("dense payload does not match shape: {err}")))
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn words_roundtrip_through_bytes() {
        let values = [1.5f64, -0.0, f64::NAN];
        let bytes = encode_words(values.iter().map(|value| value.to_le_bytes()));
        let decoded = decode_words(&bytes, f64::from_le_bytes).unwrap();
        assert_eq!(decoded[0], 1.5);
        assert!(decoded[2].is_nan());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert!(decode_words(&[0u8; 12], u64::from_le_bytes).is_err());
    }

    #[test]
    fn dense_array_realizes_with_values() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("array");
        let matrix = Matrix::from(array![[1i64, 0], [0, 7]]);
        save_array(&matrix, &dir, ReuseMode::Symlink).unwrap();

        let reloaded = reload_array(&dir).unwrap();
        assert!(!reloaded.sparse);
        assert_eq!(reloaded.element, ElementType::Integer);
        assert_eq!(realize_array(&reloaded).unwrap(), matrix);
    }

    #[test]
    fn sparse_payload_with_repeated_columns_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("array");
        let csr = Csr::new([1, 2], vec![1.0, 2.0], vec![0, 1], vec![0, 2]).unwrap();
        save_array(&Matrix::from(csr), &dir, ReuseMode::None).unwrap();
        write_gz(
            &dir.join("indices.bin.gz"),
            &encode_words([0u64, 0].iter().map(|value| value.to_le_bytes())),
        )
        .unwrap();

        let reloaded = reload_array(&dir).unwrap();
        assert!(matches!(
            realize_array(&reloaded),
            Err(ScrnaseqError::InvalidShape(_))
        ));
    }

    fn small_experiment() -> Experiment {
        Experiment::builder(ExperimentKind::SingleCell, (2, 3))
            .assay("counts", array![[1.0, 0.0, 2.0], [0.0, 0.0, 3.0]])
            .reduced_dim("PCA", array![[0.1], [0.2], [0.3]])
            .build()
            .unwrap()
    }

    #[test]
    fn default_load_keeps_arrays_on_disk() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("sce");
        save_object(&small_experiment(), &dir, ReuseMode::Symlink).unwrap();
        assert_eq!(read_object_type(&dir).unwrap(), "single_cell_experiment");

        let loaded = read_object(&dir, &DefaultLoad).unwrap();
        assert!(!loaded.assay("counts").unwrap().is_realized());
        assert!(!loaded.reduced_dims().get("PCA").unwrap().is_realized());

        let copy = temp.path().join("copy");
        save_object(&loaded, &copy, ReuseMode::Copy).unwrap();
        let realized = read_object(
            &copy,
            &RealizeHook {
                realize_assays: true,
                realize_reduced_dims: true,
            },
        )
        .unwrap();
        assert_eq!(realized.assay("counts"), small_experiment().assay("counts"));
    }

    #[test]
    fn linked_arrays_read_back() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("sce");
        save_object(&small_experiment(), &dir, ReuseMode::None).unwrap();
        let loaded = read_object(&dir, &DefaultLoad).unwrap();

        let linked = temp.path().join("linked");
        save_object(&loaded, &linked, ReuseMode::Link).unwrap();
        let values = linked.join("assays/0/values.bin.gz");
        let meta = fs::symlink_metadata(&values).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(
            fs::read(&values).unwrap(),
            fs::read(dir.join("assays/0/values.bin.gz")).unwrap()
        );

        let realized = read_object(
            &linked,
            &RealizeHook {
                realize_assays: true,
                realize_reduced_dims: true,
            },
        )
        .unwrap();
        assert_eq!(realized.assay("counts"), small_experiment().assay("counts"));
        assert_eq!(
            realized.reduced_dims().get("PCA"),
            small_experiment().reduced_dims().get("PCA")
        );
    }

    #[test]
    fn refuses_to_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        assert!(save_object(&small_experiment(), temp.path(), ReuseMode::None).is_err());
    }
}
