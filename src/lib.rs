//! # repmet-core
//!
//! Representative-based metric learning: per-class centroid clustering and
//! the RepMet / Magnet loss with analytic gradients.
//!
//! ---
//!
//! ## Two components, two cadences
//!
//! **Re-clustering** — every few hundred steps (or once per epoch) the whole
//! training population is embedded and every class is partitioned into `k`
//! sub-clusters. The centres become a fresh trainable centroid parameter.
//!
//! **Per-batch loss** — every step, each example is compared against every
//! centroid. The loss pulls it towards its nearest own-class centroid and
//! pushes it away from centroids of other classes, either as a probabilistic
//! ratio (eq. 5) or a hinge on the margin (eq. 4).
//!
//! ```text
//! population ──update_clusters──▶ Centroids ──┐
//!                                              ├─▶ loss ─▶ LossOutput ─▶ backward ─▶ Gradients
//! batch ───────────────────────────────────────┘
//! ```
//!
//! Re-clustering produces a new parameter with a new generation number.
//! Gradients computed against an older generation are rejected.
//!
//! ## Module overview
//!
//! | Module | Key types | What it does |
//! |--------|-----------|--------------|
//! | [`config`] | [`RepMetConfig`], [`VarianceMode`], [`LossFormulation`] | Validated hyper-parameters |
//! | [`matrix`] | [`Matrix`] | Dense row-major `f32` storage |
//! | [`distance`] | [`DistanceMeasure`] | Cost function and its gradient |
//! | [`centroids`] | [`Centroids`], [`CentroidParameter`] | Trainable centroid state, SGD step |
//! | [`cluster`] | [`ClusterManager`], [`ClusterReport`] | Seeded per-class k-means |
//! | [`mask`] | [`mask::ClassMask`] | Same-class masks and masked minima |
//! | [`loss`] | [`LossEngine`], [`LossOutput`], [`Gradients`] | Forward and backward pass |
//! | [`snapshot`] | [`snapshot::CentroidSnapshot`] | Serialisable centroid checkpoint (requires `serde` feature) |
//! | [`ffi`] | `RepMetLoss` Python class | PyO3 bindings (requires `python-ffi` feature) |
//!
//! ## Example
//!
//! ```rust
//! use repmet_core::{Matrix, RepMetConfig, RepMetLoss};
//!
//! let config = RepMetConfig::new(1, 2).with_seed(7);
//! let mut repmet = RepMetLoss::new(config).unwrap();
//!
//! let population = Matrix::from_rows(&[[0.0f32, 0.0], [0.2, 0.1], [5.0, 5.0], [5.1, 4.9]]).unwrap();
//! repmet.update_clusters(&population, &[0, 0, 1, 1]).unwrap();
//!
//! let batch = Matrix::from_rows(&[[0.1f32, 0.0], [4.8, 5.0]]).unwrap();
//! let out = repmet.loss(&batch, &[0, 1]).unwrap();
//! assert_eq!(out.accuracy, 1.0);
//!
//! let grads = repmet.backward(&batch, &out).unwrap();
//! repmet.step(0.1);
//! assert_eq!(grads.embeddings.shape(), (2, 2));
//! ```
//!
//! ## License
//!
//! Business Source License 1.1.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod centroids;
pub mod cluster;
pub mod config;
pub mod distance;
pub mod error;
pub mod loss;
pub mod mask;
pub mod matrix;
#[cfg(feature = "serde")]
pub mod snapshot;

#[cfg(feature = "python-ffi")]
pub mod ffi;

pub use centroids::{CentroidParameter, Centroids};
pub use cluster::{ClassClusterStats, ClusterManager, ClusterReport};
pub use config::{
    DegradedClassPolicy, LossFormulation, RepMetConfig, Seeding, VarianceMode, DEFAULT_VARIANCE,
    MIN_VARIANCE,
};
pub use distance::DistanceMeasure;
pub use error::{RepMetError, Result};
pub use loss::{Gradients, LossEngine, LossOutput, NumericalWarning};
pub use matrix::Matrix;

/// Class identifier attached to every example and every centroid.
pub type Label = u32;

// ─── RepMetLoss ─────────────────────────────────────────────────────────────

/// Clustering and loss bundled around one centroid parameter.
///
/// `update_clusters` and `loss` both take `&mut self`, so a loss call can
/// never observe a half-built centroid set.
#[derive(Clone, Debug)]
pub struct RepMetLoss {
    manager: ClusterManager,
    engine: LossEngine,
    centroids: Option<Centroids>,
    last_report: Option<ClusterReport>,
}

impl RepMetLoss {
    /// Create the loss. Fails if the configuration is invalid.
    pub fn new(config: RepMetConfig) -> Result<Self> {
        Ok(Self {
            manager: ClusterManager::new(config.clone())?,
            engine: LossEngine::new(config)?,
            centroids: None,
            last_report: None,
        })
    }

    /// Require every class in `classes` to be present at each re-clustering.
    #[must_use]
    pub fn with_classes(mut self, classes: &[Label]) -> Self {
        self.manager = self.manager.with_classes(classes);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &RepMetConfig {
        self.engine.config()
    }

    /// Re-cluster with the configured `max_iterations`.
    pub fn update_clusters(&mut self, embeddings: &Matrix, labels: &[Label]) -> Result<&ClusterReport> {
        let max_iterations = self.config().max_iterations;
        self.update_clusters_with(embeddings, labels, max_iterations)
    }

    /// Re-cluster the population and replace the centroid parameter.
    ///
    /// On error the previous centroids stay installed.
    pub fn update_clusters_with(
        &mut self,
        embeddings: &Matrix,
        labels: &[Label],
        max_iterations: usize,
    ) -> Result<&ClusterReport> {
        let (centroids, report) = self.manager.update_clusters(embeddings, labels, max_iterations)?;
        self.centroids = Some(centroids);
        Ok(self.last_report.insert(report))
    }

    /// Score a batch against the current centroids.
    pub fn loss(&mut self, embeddings: &Matrix, labels: &[Label]) -> Result<LossOutput> {
        let centroids = self.centroids.as_ref().ok_or(RepMetError::NoCentroids)?;
        self.engine.loss(centroids, embeddings, labels)
    }

    /// Gradients for `output`. The centroid part is also added to the
    /// centroid parameter's gradient buffer.
    pub fn backward(&mut self, embeddings: &Matrix, output: &LossOutput) -> Result<Gradients> {
        let centroids = self.centroids.as_mut().ok_or(RepMetError::NoCentroids)?;
        let grads = self.engine.backward(centroids, embeddings, output)?;
        centroids.accumulate_grad(&grads.centroids)?;
        Ok(grads)
    }

    /// SGD step on the centroids. No-op before the first re-clustering.
    pub fn step(&mut self, learning_rate: f32) {
        if let Some(centroids) = self.centroids.as_mut() {
            centroids.step(learning_rate);
        }
    }

    /// Current centroids, if any.
    pub fn centroids(&self) -> Option<&Centroids> {
        self.centroids.as_ref()
    }

    /// Install centroids directly, e.g. from a checkpoint.
    ///
    /// Later re-clustering passes are numbered above the installed generation.
    pub fn set_centroids(&mut self, centroids: Centroids) -> Result<()> {
        if !centroids.is_empty() && centroids.dim() != self.config().embedding_dim {
            return Err(RepMetError::DimensionMismatch {
                expected: self.config().embedding_dim,
                got: centroids.dim(),
            });
        }
        self.manager.observe_generation(centroids.generation());
        self.centroids = Some(centroids);
        Ok(())
    }

    /// Report of the last successful re-clustering.
    pub fn last_report(&self) -> Option<&ClusterReport> {
        self.last_report.as_ref()
    }

    /// Smoothed variance across loss calls.
    pub fn avg_variance(&self) -> Option<f32> {
        self.engine.avg_variance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn population() -> (Matrix, Vec<Label>) {
        let x = Matrix::from_rows(&[
            [0.0f32, 0.0],
            [0.2, 0.1],
            [0.1, 0.3],
            [5.0, 5.0],
            [5.1, 4.9],
            [4.8, 5.2],
        ])
        .unwrap();
        (x, vec![0, 0, 0, 1, 1, 1])
    }

    #[test]
    fn test_loss_before_clustering_fails() {
        let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2)).unwrap();
        let x = Matrix::from_rows(&[[0.0f32, 0.0]]).unwrap();
        assert_eq!(repmet.loss(&x, &[0]).unwrap_err(), RepMetError::NoCentroids);
    }

    #[test]
    fn test_training_step_reduces_loss() {
        let (x, y) = population();
        let cfg = RepMetConfig::new(1, 2).with_seed(3).with_margin(4.0);
        let mut repmet = RepMetLoss::new(cfg).unwrap();
        repmet.update_clusters(&x, &y).unwrap();

        let batch = Matrix::from_rows(&[[2.6f32, 2.6], [2.4, 2.4]]).unwrap();
        let before = repmet.loss(&batch, &[0, 1]).unwrap();
        repmet.backward(&batch, &before).unwrap();
        repmet.step(0.05);
        let after = repmet.loss(&batch, &[0, 1]).unwrap();
        assert!(after.total_loss < before.total_loss);
    }

    #[test]
    fn test_backward_accumulates_into_centroids() {
        let (x, y) = population();
        let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2).with_seed(1).with_margin(4.0)).unwrap();
        repmet.update_clusters(&x, &y).unwrap();
        let batch = Matrix::from_rows(&[[2.5f32, 2.5]]).unwrap();
        let out = repmet.loss(&batch, &[0]).unwrap();
        let grads = repmet.backward(&batch, &out).unwrap();
        assert_eq!(repmet.centroids().unwrap().grad(), &grads.centroids);
        repmet.step(0.1);
        assert!(repmet.centroids().unwrap().grad().as_slice().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_reclustering_invalidates_pending_output() {
        let (x, y) = population();
        let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2).with_seed(1)).unwrap();
        repmet.update_clusters(&x, &y).unwrap();
        let out = repmet.loss(&x, &y).unwrap();
        repmet.update_clusters(&x, &y).unwrap();
        assert!(matches!(
            repmet.backward(&x, &out),
            Err(RepMetError::StaleCentroids { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn test_failed_reclustering_keeps_previous_centroids() {
        let (x, y) = population();
        let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2).with_seed(1)).unwrap();
        repmet.update_clusters(&x, &y).unwrap();
        let before = repmet.centroids().cloned();
        assert!(repmet.update_clusters(&x, &y[..2]).is_err());
        assert_eq!(repmet.centroids().cloned(), before);
        assert_eq!(repmet.last_report().unwrap().generation, 1);
    }

    #[test]
    fn test_reclustering_after_restore_invalidates_pending_output() {
        let (x, y) = population();
        let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2).with_seed(2)).unwrap();
        let restored = Centroids::new(
            Matrix::from_rows(&[[0.0f32, 0.0], [5.0, 5.0]]).unwrap(),
            vec![0, 1],
            1,
        )
        .unwrap();
        repmet.set_centroids(restored).unwrap();
        let out = repmet.loss(&x, &y).unwrap();

        let report = repmet.update_clusters(&x, &y).unwrap();
        assert_eq!(report.generation, 2);
        assert!(matches!(
            repmet.backward(&x, &out),
            Err(RepMetError::StaleCentroids { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn test_failed_backward_can_be_retried() {
        let (x, y) = population();
        let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2).with_seed(1).with_margin(40.0)).unwrap();
        repmet.update_clusters(&x, &y).unwrap();
        let out = repmet.loss(&x, &y).unwrap();

        assert!(repmet.backward(&Matrix::zeros(6, 3), &out).is_err());
        assert!(repmet.centroids().unwrap().grad().as_slice().iter().all(|&g| g == 0.0));

        let grads = repmet.backward(&x, &out).unwrap();
        assert_eq!(repmet.centroids().unwrap().grad(), &grads.centroids);
    }

    #[test]
    fn test_set_centroids_checks_dimension() {
        let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2)).unwrap();
        let wrong = Centroids::new(Matrix::zeros(1, 3), vec![0], 0).unwrap();
        assert!(repmet.set_centroids(wrong).is_err());
        let right = Centroids::new(Matrix::zeros(1, 2), vec![0], 0).unwrap();
        repmet.set_centroids(right).unwrap();
        assert_eq!(repmet.centroids().unwrap().len(), 1);
    }
}
