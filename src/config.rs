//! Loss and re-clustering configuration.
//!
//! Supplied once at construction and never mutated afterwards. Call
//! [`RepMetConfig::validate`] (done by every constructor in this crate)
//! before use.

use crate::distance::DistanceMeasure;
use crate::error::{RepMetError, Result};

/// Variance used by the paper and the default fixed variance.
pub const DEFAULT_VARIANCE: f32 = 0.5;

/// Smallest variance accepted from a data-driven estimate.
pub const MIN_VARIANCE: f32 = 1e-6;

/// How the variance that scales distances is obtained on each loss call.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum VarianceMode {
    /// Constant variance. Default `0.5`.
    Fixed(f32),
    /// `Σ min_match / (N - 1)` of the current batch.
    Batch,
    /// Batch estimate smoothed by an exponential moving average:
    /// `avg ← momentum · avg + (1 − momentum) · estimate`.
    RunningAverage {
        /// Weight of the previous average, in `[0, 1)`.
        momentum: f32,
    },
}

impl Default for VarianceMode {
    fn default() -> Self {
        Self::Fixed(DEFAULT_VARIANCE)
    }
}

/// Which per-example loss contributes to `total_loss`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LossFormulation {
    /// `relu(-ln(num / (den + ε) + ε) + α)` (RepMet eq. 5).
    #[default]
    Probabilistic,
    /// `relu(min_match − min_non_match + α)` (RepMet eq. 4).
    Margin,
    /// Sum of both per example.
    Combined,
}

/// How the first `k` centres of a class are chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Seeding {
    /// Random first centre, then repeatedly the example farthest from every
    /// chosen centre.
    #[default]
    FarthestPoint,
    /// `k` distinct examples sampled uniformly.
    Random,
}

/// What to do with a class that has fewer examples than `k`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DegradedClassPolicy {
    /// Every example becomes a centre and the remaining slots repeat those
    /// centres in order, so the class still owns exactly `k` centroids.
    #[default]
    Duplicate,
    /// The class owns one centroid per example (fewer than `k`).
    Shrink,
}

/// Configuration for [`crate::RepMetLoss`], [`crate::ClusterManager`] and
/// [`crate::LossEngine`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RepMetConfig {
    /// Centroids per class (`k`). Default: 3.
    pub num_clusters_per_class: usize,
    /// Embedding dimensionality. Default: 128.
    pub embedding_dim: usize,
    /// Cost between an example and a centroid. Default: squared Euclidean.
    pub distance: DistanceMeasure,
    /// Hinge margin `α`. Default: 1.0.
    pub margin_alpha: f32,
    /// Variance source. Default: fixed `0.5`.
    pub variance: VarianceMode,
    /// Loss used for `total_loss`. Default: probabilistic (eq. 5).
    pub formulation: LossFormulation,
    /// Centre seeding strategy. Default: farthest point.
    pub seeding: Seeding,
    /// Handling of classes with fewer than `k` examples. Default: duplicate.
    pub degraded_policy: DegradedClassPolicy,
    /// Refinement iterations per re-clustering pass. Default: 20.
    pub max_iterations: usize,
    /// Seed for centre selection. `None` draws one from OS entropy.
    pub seed: Option<u64>,
}

impl Default for RepMetConfig {
    fn default() -> Self {
        Self {
            num_clusters_per_class: 3,
            embedding_dim: 128,
            distance: DistanceMeasure::default(),
            margin_alpha: 1.0,
            variance: VarianceMode::default(),
            formulation: LossFormulation::default(),
            seeding: Seeding::default(),
            degraded_policy: DegradedClassPolicy::default(),
            max_iterations: 20,
            seed: None,
        }
    }
}

impl RepMetConfig {
    /// Config with the given `k` and dimensionality, defaults elsewhere.
    pub fn new(num_clusters_per_class: usize, embedding_dim: usize) -> Self {
        Self {
            num_clusters_per_class,
            embedding_dim,
            ..Self::default()
        }
    }

    /// Builder: set the distance measure.
    #[must_use]
    pub fn with_distance(mut self, distance: DistanceMeasure) -> Self {
        self.distance = distance;
        self
    }

    /// Builder: set the margin `α`.
    #[must_use]
    pub fn with_margin(mut self, alpha: f32) -> Self {
        self.margin_alpha = alpha;
        self
    }

    /// Builder: set the variance mode.
    #[must_use]
    pub fn with_variance(mut self, variance: VarianceMode) -> Self {
        self.variance = variance;
        self
    }

    /// Builder: set the loss formulation.
    #[must_use]
    pub fn with_formulation(mut self, formulation: LossFormulation) -> Self {
        self.formulation = formulation;
        self
    }

    /// Builder: set a deterministic seed for centre selection.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reject values that would make clustering or the loss meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.num_clusters_per_class == 0 {
            return Err(RepMetError::InvalidConfig(
                "num_clusters_per_class must be at least 1".into(),
            ));
        }
        if self.embedding_dim == 0 {
            return Err(RepMetError::InvalidConfig(
                "embedding_dim must be at least 1".into(),
            ));
        }
        if !self.margin_alpha.is_finite() {
            return Err(RepMetError::InvalidConfig(format!(
                "margin_alpha must be finite, got {}",
                self.margin_alpha
            )));
        }
        match self.variance {
            VarianceMode::Fixed(v) if !(v.is_finite() && v > 0.0) => {
                Err(RepMetError::InvalidConfig(format!(
                    "fixed variance must be positive, got {v}"
                )))
            }
            VarianceMode::RunningAverage { momentum } if !(0.0..1.0).contains(&momentum) => {
                Err(RepMetError::InvalidConfig(format!(
                    "variance momentum must be in [0, 1), got {momentum}"
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_the_paper() {
        let c = RepMetConfig::default();
        assert_eq!(c.variance, VarianceMode::Fixed(0.5));
        assert_eq!(c.formulation, LossFormulation::Probabilistic);
        assert_eq!(c.distance, DistanceMeasure::SquaredEuclidean);
        assert_eq!(c.margin_alpha, 1.0);
        assert_eq!(c.max_iterations, 20);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_zero_clusters_rejected() {
        assert!(RepMetConfig::new(0, 4).validate().is_err());
        assert!(RepMetConfig::new(2, 0).validate().is_err());
    }

    #[test]
    fn test_variance_bounds() {
        let c = RepMetConfig::new(1, 2).with_variance(VarianceMode::Fixed(0.0));
        assert!(c.validate().is_err());
        let c = RepMetConfig::new(1, 2).with_variance(VarianceMode::RunningAverage { momentum: 1.0 });
        assert!(c.validate().is_err());
        let c = RepMetConfig::new(1, 2).with_variance(VarianceMode::RunningAverage { momentum: 0.5 });
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_nan_margin_rejected() {
        assert!(RepMetConfig::new(1, 2).with_margin(f32::NAN).validate().is_err());
    }
}
