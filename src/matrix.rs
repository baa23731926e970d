use std::fmt;
use std::path::PathBuf;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::ScrnaseqError;

const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    #[serde(rename = "float64")]
    Float,
    #[serde(rename = "int64")]
    Integer,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Float => write!(f, "float64"),
            ElementType::Integer => write!(f, "int64"),
        }
    }
}

pub trait Element: Copy + PartialEq + Default + fmt::Debug {
    /// Whether the value can be dropped from a sparse encoding.
    fn is_zero(&self) -> bool;
    fn to_f64(self) -> f64;
}

impl Element for f64 {
    fn is_zero(&self) -> bool {
        // NaN compares unequal to zero, so it stays a stored entry.
        *self == 0.0
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl Element for i64 {
    fn is_zero(&self) -> bool {
        *self == 0
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

/// Fields follow the scipy attribute names: the column indices of row `r`
/// live in `indices[indptr[r]..indptr[r + 1]]`, with their values at the same
/// positions of `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Csr<T> {
    pub data: Vec<T>,
    pub indices: Vec<u64>,
    pub indptr: Vec<usize>,
    pub shape: [usize; 2],
}

impl<T: Element> Csr<T> {
    pub fn new(
        shape: [usize; 2],
        data: Vec<T>,
        indices: Vec<u64>,
        indptr: Vec<usize>,
    ) -> Result<Self, ScrnaseqError> {
        let [rows, cols] = shape;
        if indptr.len() != rows + 1 {
            return Err(ScrnaseqError::InvalidShape(format!(
                "indptr has {} entries for {rows} rows",
                indptr.len()
            )));
        }
        if indptr.first() != Some(&0) || indptr.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(ScrnaseqError::InvalidShape(
                "indptr must start at zero and be non-decreasing".to_string(),
            ));
        }
        if indptr[rows] != data.len() || indices.len() != data.len() {
            return Err(ScrnaseqError::InvalidShape(format!(
                "expected {} stored entries, found {} values and {} indices",
                indptr[rows],
                data.len(),
                indices.len()
            )));
        }
        if indices.iter().any(|&col| col as usize >= cols) {
            return Err(ScrnaseqError::InvalidShape(format!(
                "column index out of bounds for {cols} columns"
            )));
        }
        for row in 0..rows {
            let columns = &indices[indptr[row]..indptr[row + 1]];
            if columns.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(ScrnaseqError::InvalidShape(format!(
                    "column indices of row {row} must be strictly increasing"
                )));
            }
        }
        Ok(Self {
            data,
            indices,
            indptr,
            shape,
        })
    }

    pub fn from_dense(dense: &Array2<T>) -> Self {
        let (rows, cols) = dense.dim();
        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = Vec::with_capacity(rows + 1);
        indptr.push(0);
        for row in dense.rows() {
            for (col, value) in row.iter().enumerate() {
                if !value.is_zero() {
                    data.push(*value);
                    indices.push(col as u64);
                }
            }
            indptr.push(data.len());
        }
        Self {
            data,
            indices,
            indptr,
            shape: [rows, cols],
        }
    }

    pub fn to_dense(&self) -> Array2<T> {
        let [rows, cols] = self.shape;
        let mut dense = Array2::from_elem((rows, cols), T::default());
        for row in 0..rows {
            for pos in self.indptr[row]..self.indptr[row + 1] {
                dense[[row, self.indices[pos] as usize]] = self.data[pos];
            }
        }
        dense
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if row >= self.shape[0] || col >= self.shape[1] {
            return None;
        }
        let found = (self.indptr[row]..self.indptr[row + 1])
            .find(|&pos| self.indices[pos] as usize == col)
            .map(|pos| self.data[pos]);
        Some(found.unwrap_or_default())
    }

    pub fn transpose(&self) -> Csr<T> {
        let [rows, cols] = self.shape;
        let mut indptr = vec![0usize; cols + 1];
        for &col in &self.indices {
            indptr[col as usize + 1] += 1;
        }
        for col in 0..cols {
            indptr[col + 1] += indptr[col];
        }
        let mut next = indptr.clone();
        let mut data = vec![T::default(); self.nnz()];
        let mut indices = vec![0u64; self.nnz()];
        for row in 0..rows {
            for pos in self.indptr[row]..self.indptr[row + 1] {
                let col = self.indices[pos] as usize;
                let dest = next[col];
                data[dest] = self.data[pos];
                indices[dest] = row as u64;
                next[col] += 1;
            }
        }
        Csr {
            data,
            indices,
            indptr,
            shape: [cols, rows],
        }
    }

    fn map<U: Element>(&self, f: impl Fn(T) -> U) -> Csr<U> {
        Csr {
            data: self.data.iter().map(|&value| f(value)).collect(),
            indices: self.indices.clone(),
            indptr: self.indptr.clone(),
            shape: self.shape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadedArray {
    pub path: PathBuf,
    pub shape: [usize; 2],
    pub sparse: bool,
    pub element: ElementType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Matrix {
    DenseFloat(Array2<f64>),
    DenseInteger(Array2<i64>),
    SparseFloat(Csr<f64>),
    SparseInteger(Csr<i64>),
    Reloaded(ReloadedArray),
}

impl Matrix {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Matrix::DenseFloat(dense) => dense.dim(),
            Matrix::DenseInteger(dense) => dense.dim(),
            Matrix::SparseFloat(csr) => (csr.shape[0], csr.shape[1]),
            Matrix::SparseInteger(csr) => (csr.shape[0], csr.shape[1]),
            Matrix::Reloaded(array) => (array.shape[0], array.shape[1]),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Matrix::DenseFloat(_) | Matrix::SparseFloat(_) => ElementType::Float,
            Matrix::DenseInteger(_) | Matrix::SparseInteger(_) => ElementType::Integer,
            Matrix::Reloaded(array) => array.element,
        }
    }

    pub fn is_sparse(&self) -> bool {
        match self {
            Matrix::SparseFloat(_) | Matrix::SparseInteger(_) => true,
            Matrix::DenseFloat(_) | Matrix::DenseInteger(_) => false,
            Matrix::Reloaded(array) => array.sparse,
        }
    }

    pub fn is_realized(&self) -> bool {
        !matches!(self, Matrix::Reloaded(_))
    }

    /// Fraction of entries that are non-zero or NaN.
    ///
    /// Returns `None` for arrays that are not resident in memory. An empty
    /// matrix reports a density of 1.0.
    pub fn density(&self) -> Option<f64> {
        let (rows, cols) = self.shape();
        let total = rows * cols;
        if total == 0 {
            return self.is_realized().then_some(1.0);
        }
        let filled = match self {
            Matrix::DenseFloat(dense) => dense
                .iter()
                .filter(|value| **value != 0.0 || value.is_nan())
                .count(),
            Matrix::DenseInteger(dense) => dense.iter().filter(|value| **value != 0).count(),
            Matrix::SparseFloat(csr) => csr
                .data
                .iter()
                .filter(|value| **value != 0.0 || value.is_nan())
                .count(),
            Matrix::SparseInteger(csr) => csr.data.iter().filter(|value| **value != 0).count(),
            Matrix::Reloaded(_) => return None,
        };
        Some(filled as f64 / total as f64)
    }

    pub fn to_sparse(self) -> Matrix {
        match self {
            Matrix::DenseFloat(dense) => Matrix::SparseFloat(Csr::from_dense(&dense)),
            Matrix::DenseInteger(dense) => Matrix::SparseInteger(Csr::from_dense(&dense)),
            other => other,
        }
    }

    pub fn to_dense(self) -> Matrix {
        match self {
            Matrix::SparseFloat(csr) => Matrix::DenseFloat(csr.to_dense()),
            Matrix::SparseInteger(csr) => Matrix::DenseInteger(csr.to_dense()),
            other => other,
        }
    }

    /// Recasts a floating-point matrix to `i64` when every stored value is a
    /// whole number inside the `i64` range. Anything else is returned as is.
    pub fn to_integer_if_whole(self) -> Matrix {
        match self {
            Matrix::DenseFloat(dense) if dense.iter().all(|value| is_whole(*value)) => {
                Matrix::DenseInteger(dense.mapv(|value| value as i64))
            }
            Matrix::SparseFloat(csr) if csr.data.iter().all(|value| is_whole(*value)) => {
                Matrix::SparseInteger(csr.map(|value| value as i64))
            }
            other => other,
        }
    }

    pub fn transpose(self) -> Result<Matrix, ScrnaseqError> {
        Ok(match self {
            Matrix::DenseFloat(dense) => {
                Matrix::DenseFloat(dense.reversed_axes().as_standard_layout().into_owned())
            }
            Matrix::DenseInteger(dense) => {
                Matrix::DenseInteger(dense.reversed_axes().as_standard_layout().into_owned())
            }
            Matrix::SparseFloat(csr) => Matrix::SparseFloat(csr.transpose()),
            Matrix::SparseInteger(csr) => Matrix::SparseInteger(csr.transpose()),
            Matrix::Reloaded(array) => {
                return Err(ScrnaseqError::InvalidShape(format!(
                    "cannot transpose on-disk array at {}",
                    array.path.display()
                )));
            }
        })
    }

    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        match self {
            Matrix::DenseFloat(dense) => dense.get((row, col)).copied(),
            Matrix::DenseInteger(dense) => dense.get((row, col)).map(|value| value.to_f64()),
            Matrix::SparseFloat(csr) => csr.get(row, col),
            Matrix::SparseInteger(csr) => csr.get(row, col).map(Element::to_f64),
            Matrix::Reloaded(_) => None,
        }
    }
}

impl From<Array2<f64>> for Matrix {
    fn from(value: Array2<f64>) -> Self {
        Matrix::DenseFloat(value)
    }
}

impl From<Array2<i64>> for Matrix {
    fn from(value: Array2<i64>) -> Self {
        Matrix::DenseInteger(value)
    }
}

impl From<Csr<f64>> for Matrix {
    fn from(value: Csr<f64>) -> Self {
        Matrix::SparseFloat(value)
    }
}

impl From<Csr<i64>> for Matrix {
    fn from(value: Csr<i64>) -> Self {
        Matrix::SparseInteger(value)
    }
}

/// NaN and infinities fail the `% 1.0` test because the remainder is NaN.
fn is_whole(value: f64) -> bool {
    value % 1.0 == 0.0 && (I64_LOWER..I64_UPPER).contains(&value)
}
