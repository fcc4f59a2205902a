/*
 * This source code is licensed under the Business Source License 1.1.
 */

//! Per-batch RepMet loss against the current centroids.
//!
//! # Forward
//!
//! For a batch `x` with labels `y` and centroids `c` owned by `classes`:
//!
//! ```text
//! C[i][j]          = d(x_i, c_j)
//! min_match[i]     = min { C[i][j] : classes[j] == y_i }
//! min_non_match[i] = min { C[i][j] : classes[j] != y_i }
//! η                = -1 / (2σ²)
//! num[i]           = exp(η · min_match[i])
//! den[i]           = Σ { exp(η · C[i][j]) : classes[j] != y_i }
//! eq5[i]           = relu(-ln(num / (den + ε) + ε) + α)
//! eq4[i]           = relu(min_match − min_non_match + α)
//! total            = mean(loss[i])
//! ```
//!
//! `loss[i]` is eq. 5, eq. 4 or their sum per [`LossFormulation`]. Both
//! minima are explicit masked reductions; exponentials and logarithms are
//! evaluated in `f64`.
//!
//! # Backward
//!
//! [`LossEngine::backward`] returns `∂total/∂x` and `∂total/∂c`. The
//! variance is a constant of the backward pass, and the minima route their
//! gradient to the selected centroid only.
//!
//! # Numerical edges
//!
//! Underflowing numerators or denominators are absorbed by ε and reported
//! as [`NumericalWarning`]; they never fail the call. Non-finite inputs are
//! rejected up front. Costs that overflow to infinity are reported too, and a
//! resulting NaN is carried into the loss rather than clipped to zero.

use tracing::debug;

use crate::centroids::Centroids;
use crate::config::{LossFormulation, RepMetConfig, VarianceMode, MIN_VARIANCE};
use crate::error::{RepMetError, Result};
use crate::mask::{argmin, masked_argmin, ClassMask};
use crate::matrix::Matrix;
use crate::Label;

/// Additive guard in the eq. 5 ratio and logarithm.
pub const EPSILON: f64 = 1e-8;

/// Weight of the previous average when the variance is not running-averaged.
const DEFAULT_VARIANCE_MOMENTUM: f32 = 0.5;

// ─── outputs ────────────────────────────────────────────────────────────────

/// Non-fatal numerical condition met while scoring an example.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumericalWarning {
    /// Every different-class term `exp(η · C)` underflowed to zero.
    DenominatorUnderflow {
        /// Batch row.
        example: usize,
    },
    /// `exp(η · min_match)` underflowed to zero.
    NumeratorUnderflow {
        /// Batch row.
        example: usize,
    },
    /// A cost was NaN or infinite.
    NonFiniteCost {
        /// Batch row.
        example: usize,
    },
}

/// Per-example terms kept for the backward pass.
#[derive(Clone, Debug, PartialEq)]
struct ExampleTerms {
    match_index: usize,
    non_match_index: Option<usize>,
    ratio: f64,
    denominator: f64,
    probabilistic_active: bool,
    margin_active: bool,
}

/// Result of one loss call.
#[derive(Clone, Debug, PartialEq)]
pub struct LossOutput {
    /// Mean of `per_example_losses`.
    pub total_loss: f32,
    /// Loss per batch row under the configured formulation.
    pub per_example_losses: Vec<f32>,
    /// Fraction of rows whose nearest centroid has the true class. No gradient.
    pub accuracy: f32,
    /// Eq. 5 loss per row, whatever the formulation.
    pub probabilistic_losses: Vec<f32>,
    /// Eq. 4 loss per row, whatever the formulation. Zero for rows without a
    /// different-class centroid.
    pub margin_losses: Vec<f32>,
    /// Smallest cost to a same-class centroid.
    pub min_match: Vec<f32>,
    /// Smallest cost to a different-class centroid; `None` if there is none.
    pub min_non_match: Vec<Option<f32>>,
    /// Class of the nearest centroid per row.
    pub predicted_classes: Vec<Label>,
    /// Variance used to scale distances on this call.
    pub variance: f32,
    /// `N × C` cost matrix.
    pub sample_costs: Matrix,
    /// Numerical edges met on this call.
    pub warnings: Vec<NumericalWarning>,
    formulation: LossFormulation,
    norm: f64,
    generation: u64,
    terms: Vec<ExampleTerms>,
}

impl LossOutput {
    /// Batch size.
    pub fn len(&self) -> usize {
        self.per_example_losses.len()
    }

    /// `true` for an empty batch (never produced by [`LossEngine::loss`]).
    pub fn is_empty(&self) -> bool {
        self.per_example_losses.is_empty()
    }

    /// Mean eq. 4 loss over the batch.
    pub fn margin_total(&self) -> f32 {
        mean(&self.margin_losses)
    }

    /// Centroid generation the loss was computed against.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Gradients of `total_loss`.
#[derive(Clone, Debug, PartialEq)]
pub struct Gradients {
    /// `∂total/∂x`, `N × D`.
    pub embeddings: Matrix,
    /// `∂total/∂c`, `C × D`.
    pub centroids: Matrix,
}

// ─── LossEngine ─────────────────────────────────────────────────────────────

/// Computes the RepMet loss and its gradients for one batch at a time.
///
/// Owns the smoothed variance estimate `avg_variance`, updated on every call
/// with `avg ← m · avg + (1 − m) · σ²` (first call initialises it).
#[derive(Clone, Debug)]
pub struct LossEngine {
    config: RepMetConfig,
    avg_variance: Option<f32>,
}

impl LossEngine {
    /// Create an engine. Fails if the configuration is invalid.
    pub fn new(config: RepMetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            avg_variance: None,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &RepMetConfig {
        &self.config
    }

    /// Smoothed variance across calls, `None` before the first call.
    pub fn avg_variance(&self) -> Option<f32> {
        self.avg_variance
    }

    /// Forget the smoothed variance.
    pub fn reset_variance(&mut self) {
        self.avg_variance = None;
    }

    /// Score a batch against `centroids`.
    pub fn loss(
        &mut self,
        centroids: &Centroids,
        embeddings: &Matrix,
        labels: &[Label],
    ) -> Result<LossOutput> {
        self.check_batch(centroids, embeddings, labels)?;

        let n = embeddings.rows();
        let sample_costs = self.config.distance.cost_matrix(embeddings, centroids.values());
        let mask = ClassMask::new(labels, centroids.classes());

        let mut min_match = Vec::with_capacity(n);
        let mut min_non_match = Vec::with_capacity(n);
        let mut match_index = Vec::with_capacity(n);
        let mut non_match_index = Vec::with_capacity(n);
        for (i, &label) in labels.iter().enumerate() {
            let costs = sample_costs.row(i);
            let (a, m) = masked_argmin(costs, mask.row(i), true)
                .ok_or(RepMetError::UnknownClass { label })?;
            let other = masked_argmin(costs, mask.row(i), false);
            min_match.push(m);
            match_index.push(a);
            min_non_match.push(other.map(|(_, v)| v));
            non_match_index.push(other.map(|(b, _)| b));
        }

        let variance = self.resolve_variance(&min_match);
        let norm = -1.0 / (2.0 * variance as f64);
        let alpha = self.config.margin_alpha as f64;

        let mut warnings = Vec::new();
        let mut per_example_losses = Vec::with_capacity(n);
        let mut probabilistic_losses = Vec::with_capacity(n);
        let mut margin_losses = Vec::with_capacity(n);
        let mut predicted_classes = Vec::with_capacity(n);
        let mut terms = Vec::with_capacity(n);
        let mut correct = 0usize;
        let mut total = 0.0f64;

        for i in 0..n {
            let costs = sample_costs.row(i);
            let same = mask.row(i);
            if costs.iter().any(|c| !c.is_finite()) {
                warnings.push(NumericalWarning::NonFiniteCost { example: i });
            }

            let m = min_match[i] as f64;
            let numerator = (norm * m).exp();
            let denominator: f64 = costs
                .iter()
                .zip(same)
                .filter(|&(_, &s)| !s)
                .map(|(&c, _)| (norm * c as f64).exp())
                .sum();
            if numerator == 0.0 {
                warnings.push(NumericalWarning::NumeratorUnderflow { example: i });
            }
            if denominator == 0.0 && mask.has_other(i) {
                warnings.push(NumericalWarning::DenominatorUnderflow { example: i });
            }

            let ratio = numerator / (denominator + EPSILON);
            let eq5_raw = -(ratio + EPSILON).ln() + alpha;
            let eq4_raw = min_non_match[i].map(|nm| m - nm as f64 + alpha);
            let eq5 = relu(eq5_raw);
            let eq4 = relu(eq4_raw.unwrap_or(0.0));

            let loss = match self.config.formulation {
                LossFormulation::Probabilistic => eq5,
                LossFormulation::Margin => eq4,
                LossFormulation::Combined => eq4 + eq5,
            };
            total += loss;
            per_example_losses.push(loss as f32);
            probabilistic_losses.push(eq5 as f32);
            margin_losses.push(eq4 as f32);

            // A row with a same-class centroid always has an argmin.
            let predicted = argmin(costs).map_or(labels[i], |j| centroids.classes()[j]);
            if predicted == labels[i] {
                correct += 1;
            }
            predicted_classes.push(predicted);

            terms.push(ExampleTerms {
                match_index: match_index[i],
                non_match_index: non_match_index[i],
                ratio,
                denominator,
                probabilistic_active: eq5_raw > 0.0,
                margin_active: eq4_raw.is_some_and(|v| v > 0.0),
            });
        }

        let output = LossOutput {
            total_loss: (total / n as f64) as f32,
            per_example_losses,
            accuracy: correct as f32 / n as f32,
            probabilistic_losses,
            margin_losses,
            min_match,
            min_non_match,
            predicted_classes,
            variance,
            sample_costs,
            warnings,
            formulation: self.config.formulation,
            norm,
            generation: centroids.generation(),
            terms,
        };

        debug!(
            batch = n,
            total_loss = output.total_loss,
            accuracy = output.accuracy,
            variance,
            avg_variance = self.avg_variance,
            warnings = output.warnings.len(),
            "repmet loss"
        );
        if !output.warnings.is_empty() {
            debug!(warnings = ?output.warnings, "numerical edges absorbed by epsilon");
        }
        Ok(output)
    }

    /// Gradients of `output.total_loss` with respect to the batch and the centroids.
    ///
    /// `centroids` and `embeddings` must be the values `output` was computed from.
    pub fn backward(
        &self,
        centroids: &Centroids,
        embeddings: &Matrix,
        output: &LossOutput,
    ) -> Result<Gradients> {
        if centroids.generation() != output.generation {
            return Err(RepMetError::StaleCentroids {
                expected: output.generation,
                got: centroids.generation(),
            });
        }
        if embeddings.rows() != output.len() {
            return Err(RepMetError::LengthMismatch {
                embeddings: embeddings.rows(),
                labels: output.len(),
            });
        }
        if centroids.len() != output.sample_costs.cols() {
            return Err(RepMetError::DimensionMismatch {
                expected: output.sample_costs.cols(),
                got: centroids.len(),
            });
        }
        if embeddings.cols() != centroids.dim() {
            return Err(RepMetError::DimensionMismatch {
                expected: centroids.dim(),
                got: embeddings.cols(),
            });
        }

        let n = embeddings.rows();
        let dim = embeddings.cols();
        let measure = self.config.distance;
        let scale = 1.0 / n as f64;
        let norm = output.norm;
        let use_eq5 = matches!(
            output.formulation,
            LossFormulation::Probabilistic | LossFormulation::Combined
        );
        let use_eq4 = matches!(
            output.formulation,
            LossFormulation::Margin | LossFormulation::Combined
        );

        let mut grad_x = Matrix::zeros(n, dim);
        let mut grad_c = Matrix::zeros(centroids.len(), dim);
        let mut coeff = vec![0.0f64; centroids.len()];

        for (i, t) in output.terms.iter().enumerate() {
            coeff.iter_mut().for_each(|g| *g = 0.0);

            if use_eq5 && t.probabilistic_active {
                let shared = t.ratio / (t.ratio + EPSILON);
                coeff[t.match_index] += -norm * shared;
                let costs = output.sample_costs.row(i);
                let label = centroids.classes()[t.match_index];
                for (j, (&c, &class)) in costs.iter().zip(centroids.classes()).enumerate() {
                    if class != label {
                        let e = (norm * c as f64).exp();
                        coeff[j] += norm * shared * e / (t.denominator + EPSILON);
                    }
                }
            }
            if use_eq4 && t.margin_active {
                coeff[t.match_index] += 1.0;
                if let Some(b) = t.non_match_index {
                    coeff[b] -= 1.0;
                }
            }

            let x = embeddings.row(i);
            for (j, &g) in coeff.iter().enumerate() {
                if g == 0.0 {
                    continue;
                }
                let g = (g * scale) as f32;
                let c = centroids.values().row(j);
                measure.accumulate_grad(x, c, g, grad_x.row_mut(i));
                measure.accumulate_grad(c, x, g, grad_c.row_mut(j));
            }
        }

        Ok(Gradients {
            embeddings: grad_x,
            centroids: grad_c,
        })
    }

    fn check_batch(&self, centroids: &Centroids, embeddings: &Matrix, labels: &[Label]) -> Result<()> {
        if embeddings.rows() != labels.len() {
            return Err(RepMetError::LengthMismatch {
                embeddings: embeddings.rows(),
                labels: labels.len(),
            });
        }
        if embeddings.is_empty() {
            return Err(RepMetError::EmptyInput("batch"));
        }
        if embeddings.cols() != self.config.embedding_dim {
            return Err(RepMetError::DimensionMismatch {
                expected: self.config.embedding_dim,
                got: embeddings.cols(),
            });
        }
        if centroids.is_empty() {
            return Err(RepMetError::NoCentroids);
        }
        if centroids.dim() != embeddings.cols() {
            return Err(RepMetError::DimensionMismatch {
                expected: embeddings.cols(),
                got: centroids.dim(),
            });
        }
        if let Some(row) = embeddings.first_non_finite_row() {
            return Err(RepMetError::NonFiniteInput { what: "embeddings", row });
        }
        if let Some(row) = centroids.values().first_non_finite_row() {
            return Err(RepMetError::NonFiniteInput { what: "centroids", row });
        }
        Ok(())
    }

    /// Variance for this call; also advances `avg_variance`.
    fn resolve_variance(&mut self, min_match: &[f32]) -> f32 {
        let variance = match self.config.variance {
            VarianceMode::Fixed(v) => v,
            VarianceMode::Batch | VarianceMode::RunningAverage { .. } => {
                batch_variance(min_match)
            }
        };
        let momentum = match self.config.variance {
            VarianceMode::RunningAverage { momentum } => momentum,
            _ => DEFAULT_VARIANCE_MOMENTUM,
        };
        let avg = match self.avg_variance {
            None => variance,
            Some(avg) => momentum * avg + (1.0 - momentum) * variance,
        };
        self.avg_variance = Some(avg);
        match self.config.variance {
            VarianceMode::RunningAverage { .. } => avg,
            _ => variance,
        }
    }
}

/// `Σ min_match / (N − 1)`, floored at [`MIN_VARIANCE`].
fn batch_variance(min_match: &[f32]) -> f32 {
    let denom = min_match.len().saturating_sub(1).max(1) as f64;
    let sum: f64 = min_match.iter().map(|&v| v as f64).sum();
    ((sum / denom) as f32).max(MIN_VARIANCE)
}

/// `max(v, 0)` that keeps NaN.
#[inline]
fn relu(v: f64) -> f64 {
    if v.is_nan() || v > 0.0 {
        v
    } else {
        0.0
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64) as f32
}
