use crate::error::ScrnaseqError;
use crate::experiment::{Annotations, NamedList};
use crate::matrix::Matrix;
#[cfg(feature = "anndata")]
use crate::experiment::{Experiment, ExperimentKind};

#[derive(Debug, Clone, PartialEq)]
pub struct AnnData {
    x: Option<Matrix>,
    obs: Annotations,
    var: Annotations,
    layers: NamedList<Matrix>,
    obsm: NamedList<Matrix>,
}

impl AnnData {
    pub fn new(obs: Annotations, var: Annotations) -> Self {
        Self {
            x: None,
            obs,
            var,
            layers: NamedList::new(),
            obsm: NamedList::new(),
        }
    }

    pub fn n_obs(&self) -> usize {
        self.obs.nrows()
    }

    pub fn n_vars(&self) -> usize {
        self.var.nrows()
    }

    pub fn with_x(mut self, x: impl Into<Matrix>) -> Result<Self, ScrnaseqError> {
        let x = x.into();
        self.check_layer("X", &x)?;
        self.x = Some(x);
        Ok(self)
    }

    pub fn with_layer(
        mut self,
        name: impl Into<String>,
        layer: impl Into<Matrix>,
    ) -> Result<Self, ScrnaseqError> {
        let name = name.into();
        let layer = layer.into();
        self.check_layer(&name, &layer)?;
        self.layers.insert(name, layer);
        Ok(self)
    }

    pub fn with_obsm(
        mut self,
        name: impl Into<String>,
        embedding: impl Into<Matrix>,
    ) -> Result<Self, ScrnaseqError> {
        let name = name.into();
        let embedding = embedding.into();
        if embedding.shape().0 != self.n_obs() {
            return Err(ScrnaseqError::InvalidShape(format!(
                "obsm '{name}' has {} rows for {} observations",
                embedding.shape().0,
                self.n_obs()
            )));
        }
        self.obsm.insert(name, embedding);
        Ok(self)
    }

    pub fn x(&self) -> Option<&Matrix> {
        self.x.as_ref()
    }

    pub fn layers(&self) -> &NamedList<Matrix> {
        &self.layers
    }

    fn check_layer(&self, name: &str, matrix: &Matrix) -> Result<(), ScrnaseqError> {
        let expected = (self.n_obs(), self.n_vars());
        if matrix.shape() != expected {
            return Err(ScrnaseqError::InvalidShape(format!(
                "layer '{name}' is {:?}, expected {expected:?}",
                matrix.shape()
            )));
        }
        Ok(())
    }
}

#[cfg(feature = "anndata")]
impl AnnData {
    /// Genes × cells single-cell experiment with `X` as the first assay.
    pub fn to_single_cell(self) -> Result<Experiment, ScrnaseqError> {
        let shape = (self.n_vars(), self.n_obs());
        let mut builder = Experiment::builder(ExperimentKind::SingleCell, shape)
            .row_data(self.var)
            .column_data(self.obs);
        if let Some(x) = self.x {
            builder = builder.assay("X", realized(x)?.transpose()?);
        }
        for (name, layer) in self.layers {
            builder = builder.assay(name, realized(layer)?.transpose()?);
        }
        for (name, embedding) in self.obsm {
            builder = builder.reduced_dim(name, embedding);
        }
        builder.build()
    }
}

#[cfg(feature = "anndata")]
fn realized(matrix: Matrix) -> Result<Matrix, ScrnaseqError> {
    match matrix {
        Matrix::Reloaded(array) => crate::codec::realize_array(&array),
        other => Ok(other),
    }
}
