use serde::{Deserialize, Serialize};

use crate::error::ScrnaseqError;
use crate::matrix::Matrix;

#[derive(Debug, Clone, PartialEq)]
pub struct NamedList<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for NamedList<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> NamedList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the value in place when `name` exists, appends otherwise.
    pub fn insert(&mut self, name: impl Into<String>, value: T) -> Option<T> {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        let index = self.entries.iter().position(|(key, _)| key == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn map_values<U, E>(
        self,
        mut f: impl FnMut(&str, T) -> Result<U, E>,
    ) -> Result<NamedList<U>, E> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (name, value) in self.entries {
            let mapped = f(&name, value)?;
            entries.push((name, mapped));
        }
        Ok(NamedList { entries })
    }
}

impl<T> FromIterator<(String, T)> for NamedList<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut list = NamedList::new();
        for (name, value) in iter {
            list.insert(name, value);
        }
        list
    }
}

impl<T> IntoIterator for NamedList<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum AnnotationColumn {
    Text(Vec<Option<String>>),
    Number(Vec<Option<f64>>),
    Integer(Vec<Option<i64>>),
    Boolean(Vec<Option<bool>>),
}

impl AnnotationColumn {
    pub fn len(&self) -> usize {
        match self {
            AnnotationColumn::Text(values) => values.len(),
            AnnotationColumn::Number(values) => values.len(),
            AnnotationColumn::Integer(values) => values.len(),
            AnnotationColumn::Boolean(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    nrows: usize,
    #[serde(default)]
    row_names: Option<Vec<String>>,
    #[serde(default)]
    columns: Vec<(String, AnnotationColumn)>,
}

impl Annotations {
    pub fn new(nrows: usize) -> Self {
        Self {
            nrows,
            row_names: None,
            columns: Vec::new(),
        }
    }

    pub fn with_row_names(mut self, names: Vec<String>) -> Result<Self, ScrnaseqError> {
        if names.len() != self.nrows {
            return Err(ScrnaseqError::InvalidShape(format!(
                "{} row names for {} rows",
                names.len(),
                self.nrows
            )));
        }
        self.row_names = Some(names);
        Ok(self)
    }

    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column: AnnotationColumn,
    ) -> Result<Self, ScrnaseqError> {
        let name = name.into();
        if column.len() != self.nrows {
            return Err(ScrnaseqError::InvalidShape(format!(
                "annotation column '{name}' has {} values for {} rows",
                column.len(),
                self.nrows
            )));
        }
        match self.columns.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => *slot = column,
            None => self.columns.push((name, column)),
        }
        Ok(self)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn row_names(&self) -> Option<&[String]> {
        self.row_names.as_deref()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&AnnotationColumn> {
        self.columns
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, column)| column)
    }

    fn check_lengths(&self) -> Result<(), ScrnaseqError> {
        if let Some(names) = &self.row_names
            && names.len() != self.nrows
        {
            return Err(ScrnaseqError::InvalidShape(format!(
                "{} row names for {} rows",
                names.len(),
                self.nrows
            )));
        }
        for (name, column) in &self.columns {
            if column.len() != self.nrows {
                return Err(ScrnaseqError::InvalidShape(format!(
                    "annotation column '{name}' has {} values for {} rows",
                    column.len(),
                    self.nrows
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    Summarized,
    SingleCell,
}

impl ExperimentKind {
    pub fn object_type(&self) -> &'static str {
        match self {
            ExperimentKind::Summarized => "summarized_experiment",
            ExperimentKind::SingleCell => "single_cell_experiment",
        }
    }

    pub fn from_object_type(value: &str) -> Option<Self> {
        match value {
            "summarized_experiment" => Some(ExperimentKind::Summarized),
            "single_cell_experiment" => Some(ExperimentKind::SingleCell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    kind: ExperimentKind,
    shape: (usize, usize),
    assays: NamedList<Matrix>,
    row_data: Option<Annotations>,
    column_data: Option<Annotations>,
    reduced_dims: NamedList<Matrix>,
    alternative_experiments: NamedList<Experiment>,
}

impl Experiment {
    pub fn builder(kind: ExperimentKind, shape: (usize, usize)) -> ExperimentBuilder {
        ExperimentBuilder::new(kind, shape)
    }

    pub fn kind(&self) -> ExperimentKind {
        self.kind
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn assays(&self) -> &NamedList<Matrix> {
        &self.assays
    }

    pub fn assay(&self, name: &str) -> Option<&Matrix> {
        self.assays.get(name)
    }

    pub fn assay_names(&self) -> Vec<String> {
        self.assays.names()
    }

    pub fn row_data(&self) -> Option<&Annotations> {
        self.row_data.as_ref()
    }

    pub fn column_data(&self) -> Option<&Annotations> {
        self.column_data.as_ref()
    }

    pub fn column_annotation_names(&self) -> Vec<String> {
        self.column_data
            .as_ref()
            .map(Annotations::column_names)
            .unwrap_or_default()
    }

    pub fn reduced_dims(&self) -> &NamedList<Matrix> {
        &self.reduced_dims
    }

    pub fn reduced_dim_names(&self) -> Vec<String> {
        self.reduced_dims.names()
    }

    pub fn alternative_experiments(&self) -> &NamedList<Experiment> {
        &self.alternative_experiments
    }

    pub fn alternative_experiment(&self, name: &str) -> Option<&Experiment> {
        self.alternative_experiments.get(name)
    }

    pub fn alternative_experiment_names(&self) -> Vec<String> {
        self.alternative_experiments.names()
    }

    pub fn set_assays(mut self, assays: NamedList<Matrix>) -> Result<Self, ScrnaseqError> {
        for (name, matrix) in assays.iter() {
            check_assay(self.shape, name, matrix)?;
        }
        self.assays = assays;
        Ok(self)
    }

    pub fn set_column_data(mut self, data: Option<Annotations>) -> Result<Self, ScrnaseqError> {
        if let Some(data) = &data {
            check_annotations(self.shape.1, "column", data)?;
        }
        self.column_data = data;
        Ok(self)
    }

    pub fn set_row_data(mut self, data: Option<Annotations>) -> Result<Self, ScrnaseqError> {
        if let Some(data) = &data {
            check_annotations(self.shape.0, "row", data)?;
        }
        self.row_data = data;
        Ok(self)
    }

    pub fn set_reduced_dims(mut self, dims: NamedList<Matrix>) -> Result<Self, ScrnaseqError> {
        if !dims.is_empty() {
            self.require_single_cell("reduced dimensions")?;
        }
        for (name, matrix) in dims.iter() {
            check_reduced_dim(self.shape, name, matrix)?;
        }
        self.reduced_dims = dims;
        Ok(self)
    }

    pub fn set_alternative_experiments(
        mut self,
        experiments: NamedList<Experiment>,
    ) -> Result<Self, ScrnaseqError> {
        if !experiments.is_empty() {
            self.require_single_cell("alternative experiments")?;
        }
        for (name, experiment) in experiments.iter() {
            check_alternative(self.shape, name, experiment)?;
        }
        self.alternative_experiments = experiments;
        Ok(self)
    }

    /// Splits the experiment so each part can be rewritten independently.
    pub(crate) fn into_parts(self) -> (Experiment, NamedList<Matrix>, NamedList<Experiment>) {
        let Experiment {
            kind,
            shape,
            assays,
            row_data,
            column_data,
            reduced_dims,
            alternative_experiments,
        } = self;
        let shell = Experiment {
            kind,
            shape,
            assays: NamedList::new(),
            row_data,
            column_data,
            reduced_dims,
            alternative_experiments: NamedList::new(),
        };
        (shell, assays, alternative_experiments)
    }

    fn require_single_cell(&self, what: &str) -> Result<(), ScrnaseqError> {
        if self.kind != ExperimentKind::SingleCell {
            return Err(ScrnaseqError::UnsupportedType(format!(
                "{} with {what}",
                self.kind.object_type()
            )));
        }
        Ok(())
    }
}

pub struct ExperimentBuilder {
    kind: ExperimentKind,
    shape: (usize, usize),
    assays: NamedList<Matrix>,
    row_data: Option<Annotations>,
    column_data: Option<Annotations>,
    reduced_dims: NamedList<Matrix>,
    alternative_experiments: NamedList<Experiment>,
}

impl ExperimentBuilder {
    pub fn new(kind: ExperimentKind, shape: (usize, usize)) -> Self {
        Self {
            kind,
            shape,
            assays: NamedList::new(),
            row_data: None,
            column_data: None,
            reduced_dims: NamedList::new(),
            alternative_experiments: NamedList::new(),
        }
    }

    pub fn assay(mut self, name: impl Into<String>, matrix: impl Into<Matrix>) -> Self {
        self.assays.insert(name, matrix.into());
        self
    }

    pub fn row_data(mut self, data: Annotations) -> Self {
        self.row_data = Some(data);
        self
    }

    pub fn column_data(mut self, data: Annotations) -> Self {
        self.column_data = Some(data);
        self
    }

    pub fn reduced_dim(mut self, name: impl Into<String>, matrix: impl Into<Matrix>) -> Self {
        self.reduced_dims.insert(name, matrix.into());
        self
    }

    pub fn alternative_experiment(mut self, name: impl Into<String>, experiment: Experiment) -> Self {
        self.alternative_experiments.insert(name, experiment);
        self
    }

    pub fn build(self) -> Result<Experiment, ScrnaseqError> {
        let experiment = Experiment {
            kind: self.kind,
            shape: self.shape,
            assays: NamedList::new(),
            row_data: None,
            column_data: None,
            reduced_dims: NamedList::new(),
            alternative_experiments: NamedList::new(),
        };
        experiment
            .set_assays(self.assays)?
            .set_row_data(self.row_data)?
            .set_column_data(self.column_data)?
            .set_reduced_dims(self.reduced_dims)?
            .set_alternative_experiments(self.alternative_experiments)
    }
}

fn check_assay(shape: (usize, usize), name: &str, matrix: &Matrix) -> Result<(), ScrnaseqError> {
    if matrix.shape() != shape {
        return Err(ScrnaseqError::InvalidShape(format!(
            "assay '{name}' is {:?}, experiment is {shape:?}",
            matrix.shape()
        )));
    }
    Ok(())
}

fn check_annotations(
    expected: usize,
    axis: &str,
    data: &Annotations,
) -> Result<(), ScrnaseqError> {
    data.check_lengths()?;
    if data.nrows() != expected {
        return Err(ScrnaseqError::InvalidShape(format!(
            "{axis} data has {} records for {expected} {axis}s",
            data.nrows()
        )));
    }
    Ok(())
}

fn check_reduced_dim(
    shape: (usize, usize),
    name: &str,
    matrix: &Matrix,
) -> Result<(), ScrnaseqError> {
    if matrix.shape().0 != shape.1 {
        return Err(ScrnaseqError::InvalidShape(format!(
            "reduced dimension '{name}' has {} rows for {} columns",
            matrix.shape().0,
            shape.1
        )));
    }
    Ok(())
}

fn check_alternative(
    shape: (usize, usize),
    name: &str,
    experiment: &Experiment,
) -> Result<(), ScrnaseqError> {
    if experiment.shape().1 != shape.1 {
        return Err(ScrnaseqError::InvalidShape(format!(
            "alternative experiment '{name}' has {} columns, expected {}",
            experiment.shape().1,
            shape.1
        )));
    }
    Ok(())
}
