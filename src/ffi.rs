//! Python FFI bindings via PyO3.
//!
//! Exposes [`crate::RepMetLoss`] to a Python training loop. Embeddings are
//! passed as lists of float rows, labels as a list of ints. Gradients come
//! back as nested lists so they can be fed to any tensor library.
//!
//! # Building the Python extension
//!
//! ```bash
//! pip install maturin
//! maturin develop --features python-ffi
//! ```
//!
//! # Usage
//!
//! ```python
//! from repmet_core import RepMetLoss
//!
//! loss = RepMetLoss(num_clusters_per_class=3, embedding_dim=128, margin_alpha=1.0, seed=0)
//! loss.update_clusters(all_embeddings, all_labels)   # every epoch
//!
//! total, losses, acc = loss.loss(batch, batch_labels)
//! grad_x = loss.backward(batch)                      # d total / d batch
//! loss.step(0.01)                                     # SGD on the centroids
//! ```

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::config::{LossFormulation, RepMetConfig, VarianceMode};
use crate::distance::DistanceMeasure;
use crate::error::RepMetError;
use crate::loss::LossOutput;
use crate::matrix::Matrix;
use crate::{Label, RepMetLoss as RustRepMetLoss};

fn to_py_err(err: RepMetError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn rows_to_matrix(rows: &[Vec<f32>]) -> PyResult<Matrix> {
    Matrix::from_rows(rows).map_err(to_py_err)
}

fn parse_formulation(name: &str) -> PyResult<LossFormulation> {
    match name.to_ascii_lowercase().as_str() {
        "probabilistic" | "eq5" => Ok(LossFormulation::Probabilistic),
        "margin" | "eq4" => Ok(LossFormulation::Margin),
        "combined" => Ok(LossFormulation::Combined),
        other => Err(PyValueError::new_err(format!("unknown formulation {other:?}"))),
    }
}

// ── RepMetLoss ────────────────────────────────────────────────────────────────

/// RepMet clustering loss with trainable centroids.
///
/// Call ``update_clusters`` on the full training population before the first
/// ``loss`` call and periodically afterwards. ``backward`` must be called
/// after ``loss`` on the same batch and before the next ``update_clusters``.
#[pyclass(name = "RepMetLoss")]
pub struct PyRepMetLoss {
    inner: RustRepMetLoss,
    last: Option<LossOutput>,
}

#[pymethods]
impl PyRepMetLoss {
    /// Create a new RepMetLoss.
    ///
    /// Args:
    ///     num_clusters_per_class: centroids per class (default 3)
    ///     embedding_dim:          embedding width (default 128)
    ///     margin_alpha:           hinge margin (default 1.0)
    ///     variance:               fixed variance; None estimates it per batch (default 0.5)
    ///     distance:               "euclidean", "l2" or "cosine" (default "euclidean")
    ///     formulation:            "probabilistic", "margin" or "combined"
    ///     seed:                   seed for centre selection (default: random)
    #[new]
    #[pyo3(signature = (
        num_clusters_per_class=3,
        embedding_dim=128,
        margin_alpha=1.0,
        variance=Some(0.5),
        distance="euclidean",
        formulation="probabilistic",
        seed=None,
    ))]
    pub fn new(
        num_clusters_per_class: usize,
        embedding_dim: usize,
        margin_alpha: f32,
        variance: Option<f32>,
        distance: &str,
        formulation: &str,
        seed: Option<u64>,
    ) -> PyResult<Self> {
        let mut config = RepMetConfig::new(num_clusters_per_class, embedding_dim)
            .with_margin(margin_alpha)
            .with_variance(variance.map_or(VarianceMode::Batch, VarianceMode::Fixed))
            .with_distance(distance.parse::<DistanceMeasure>().map_err(to_py_err)?)
            .with_formulation(parse_formulation(formulation)?);
        config.seed = seed;
        Ok(Self {
            inner: RustRepMetLoss::new(config).map_err(to_py_err)?,
            last: None,
        })
    }

    /// Re-cluster the training population into fresh centroids.
    ///
    /// Returns the seed used, so the pass can be reproduced.
    pub fn update_clusters(&mut self, embeddings: Vec<Vec<f32>>, labels: Vec<Label>) -> PyResult<u64> {
        let x = rows_to_matrix(&embeddings)?;
        let report = self.inner.update_clusters(&x, &labels).map_err(to_py_err)?;
        let seed = report.seed;
        self.last = None;
        Ok(seed)
    }

    /// Compute the loss for a batch.
    ///
    /// Returns:
    ///     (total_loss, per_example_losses, accuracy)
    pub fn loss(&mut self, embeddings: Vec<Vec<f32>>, labels: Vec<Label>) -> PyResult<(f32, Vec<f32>, f32)> {
        let x = rows_to_matrix(&embeddings)?;
        let out = self.inner.loss(&x, &labels).map_err(to_py_err)?;
        let result = (out.total_loss, out.per_example_losses.clone(), out.accuracy);
        self.last = Some(out);
        Ok(result)
    }

    /// Gradient of the last ``loss`` with respect to its batch.
    ///
    /// The centroid gradient is accumulated internally and applied by ``step``.
    pub fn backward(&mut self, embeddings: Vec<Vec<f32>>) -> PyResult<Vec<Vec<f32>>> {
        let out = self
            .last
            .as_ref()
            .ok_or_else(|| PyValueError::new_err("backward called before loss"))?;
        let x = rows_to_matrix(&embeddings)?;
        let grads = self.inner.backward(&x, out).map_err(to_py_err)?;
        // Only a successful call consumes the output; a failed one can be retried.
        self.last = None;
        Ok(grads.embeddings.to_rows())
    }

    /// SGD step on the centroids, then clear their gradient.
    pub fn step(&mut self, learning_rate: f32) {
        self.inner.step(learning_rate);
    }

    /// Current centroids as a list of rows (empty before clustering).
    pub fn centroids(&self) -> Vec<Vec<f32>> {
        self.inner
            .centroids()
            .map(|c| c.values().to_rows())
            .unwrap_or_default()
    }

    /// Owning class of each centroid row.
    pub fn centroid_classes(&self) -> Vec<Label> {
        self.inner
            .centroids()
            .map(|c| c.classes().to_vec())
            .unwrap_or_default()
    }

    /// Smoothed variance across loss calls, or None before the first.
    #[getter]
    pub fn avg_variance(&self) -> Option<f32> {
        self.inner.avg_variance()
    }

    /// Python repr string.
    pub fn __repr__(&self) -> String {
        let cfg = self.inner.config();
        format!(
            "RepMetLoss(num_clusters_per_class={}, embedding_dim={}, margin_alpha={:.2})",
            cfg.num_clusters_per_class, cfg.embedding_dim, cfg.margin_alpha,
        )
    }
}

// ── Module entry point ────────────────────────────────────────────────────────

/// RepMet — representative-based metric learning loss.
#[pymodule]
pub fn repmet_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyRepMetLoss>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
