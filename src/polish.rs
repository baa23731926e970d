use tracing::debug;

use crate::error::ScrnaseqError;
use crate::experiment::{Experiment, NamedList};
use crate::matrix::Matrix;

#[derive(Debug, Clone, PartialEq)]
pub struct PolishOptions {
    /// Assays with a density below this value become sparse, the rest dense.
    /// `None` keeps every assay in its current encoding.
    pub reformat_assay_by_density: Option<f64>,
    pub attempt_integer_conversion: bool,
    pub remove_altexp_coldata: bool,
    pub forbid_nested_altexp: bool,
}

impl Default for PolishOptions {
    fn default() -> Self {
        Self {
            reformat_assay_by_density: Some(0.3),
            attempt_integer_conversion: true,
            remove_altexp_coldata: true,
            forbid_nested_altexp: true,
        }
    }
}

impl PolishOptions {
    pub fn with_density_threshold(mut self, threshold: Option<f64>) -> Self {
        self.reformat_assay_by_density = threshold;
        self
    }

    pub fn with_integer_conversion(mut self, enabled: bool) -> Self {
        self.attempt_integer_conversion = enabled;
        self
    }

    pub fn with_remove_altexp_coldata(mut self, enabled: bool) -> Self {
        self.remove_altexp_coldata = enabled;
        self
    }

    pub fn with_forbid_nested_altexp(mut self, enabled: bool) -> Self {
        self.forbid_nested_altexp = enabled;
        self
    }

    fn validate(&self) -> Result<(), ScrnaseqError> {
        if let Some(threshold) = self.reformat_assay_by_density
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(ScrnaseqError::Validation(format!(
                "density threshold must lie in [0, 1], got {threshold}"
            )));
        }
        Ok(())
    }
}

/// Arrays that are still on disk are left alone; they are persisted by link.
pub fn polish_dataset(x: Experiment, options: &PolishOptions) -> Result<Experiment, ScrnaseqError> {
    options.validate()?;
    polish_level(x, options, 0)
}

fn polish_level(
    x: Experiment,
    options: &PolishOptions,
    level: usize,
) -> Result<Experiment, ScrnaseqError> {
    if options.forbid_nested_altexp && level > 0 && !x.alternative_experiments().is_empty() {
        return Err(ScrnaseqError::Validation(
            "nested alternative experiments are forbidden".to_string(),
        ));
    }

    let (shell, assays, alternatives) = x.into_parts();

    let assays = assays.map_values(|name, matrix| {
        Ok::<_, ScrnaseqError>(polish_matrix(name, matrix, options))
    })?;
    let shell = shell.set_assays(assays)?;

    let alternatives: NamedList<Experiment> = alternatives.map_values(|name, altexp| {
        debug!(altexp = name, level, "polishing alternative experiment");
        let altexp = if options.remove_altexp_coldata {
            altexp.set_column_data(None)?
        } else {
            altexp
        };
        polish_level(altexp, options, level + 1)
    })?;
    shell.set_alternative_experiments(alternatives)
}

fn polish_matrix(name: &str, matrix: Matrix, options: &PolishOptions) -> Matrix {
    if !matrix.is_realized() {
        debug!(assay = name, "leaving on-disk assay untouched");
        return matrix;
    }

    let mut matrix = matrix;
    if let Some(threshold) = options.reformat_assay_by_density
        && let Some(density) = matrix.density()
    {
        if density < threshold {
            if !matrix.is_sparse() {
                debug!(assay = name, density, "converting dense assay to sparse");
                matrix = matrix.to_sparse();
            }
        } else if matrix.is_sparse() {
            debug!(assay = name, density, "converting sparse assay to dense");
            matrix = matrix.to_dense();
        }
    }

    if options.attempt_integer_conversion {
        matrix = matrix.to_integer_if_whole();
    }
    matrix
}
