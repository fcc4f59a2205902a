//! Distance measures between embeddings and centroids.
//!
//! The loss and the re-clustering pass both score example/centroid pairs
//! through [`DistanceMeasure`]. The default is squared Euclidean distance
//! (Euclidean without the final root), which keeps the cost a smooth
//! quadratic and makes `exp(-cost / 2σ²)` a Gaussian kernel.
//!
//! Each measure also provides the gradient of the cost with respect to the
//! example, which the backward pass chains through. The gradient with
//! respect to the centroid is the same expression with the arguments
//! swapped, since every measure here is symmetric.

use crate::matrix::Matrix;

/// Norm below which a vector is treated as zero by the cosine measure.
const COSINE_EPSILON: f32 = 1e-9;

/// Cost function applied between an example and a centroid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DistanceMeasure {
    /// `Σ (a - b)²`.
    #[default]
    SquaredEuclidean,
    /// `sqrt(Σ (a - b)²)`.
    Euclidean,
    /// `1 - cos(a, b)`. A zero-norm vector has cost `1` to everything.
    Cosine,
}

impl DistanceMeasure {
    /// Cost between two equally sized vectors.
    pub fn cost(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::SquaredEuclidean => squared_euclidean(a, b),
            Self::Euclidean => squared_euclidean(a, b).sqrt(),
            Self::Cosine => {
                let (dot, norm_a, norm_b) = dot_and_norms(a, b);
                if norm_a < COSINE_EPSILON || norm_b < COSINE_EPSILON {
                    1.0
                } else {
                    1.0 - dot / (norm_a * norm_b)
                }
            }
        }
    }

    /// `costs[i][j] = cost(embeddings[i], centroids[j])`.
    ///
    /// Callers guarantee equal widths.
    pub fn cost_matrix(&self, embeddings: &Matrix, centroids: &Matrix) -> Matrix {
        debug_assert_eq!(embeddings.cols(), centroids.cols());
        let mut costs = Matrix::zeros(embeddings.rows(), centroids.rows());
        for (i, x) in embeddings.iter_rows().enumerate() {
            let out = costs.row_mut(i);
            for (j, c) in centroids.iter_rows().enumerate() {
                out[j] = self.cost(x, c);
            }
        }
        costs
    }

    /// Add `scale * ∂cost(x, c)/∂x` into `out`.
    ///
    /// Points where the cost is not differentiable (coincident vectors for
    /// [`Self::Euclidean`], zero vectors for [`Self::Cosine`]) contribute a
    /// zero subgradient.
    pub fn accumulate_grad(&self, x: &[f32], c: &[f32], scale: f32, out: &mut [f32]) {
        match self {
            Self::SquaredEuclidean => {
                for ((o, &xi), &ci) in out.iter_mut().zip(x).zip(c) {
                    *o += scale * 2.0 * (xi - ci);
                }
            }
            Self::Euclidean => {
                let d = squared_euclidean(x, c).sqrt();
                if d <= f32::EPSILON {
                    return;
                }
                for ((o, &xi), &ci) in out.iter_mut().zip(x).zip(c) {
                    *o += scale * (xi - ci) / d;
                }
            }
            Self::Cosine => {
                let (dot, norm_x, norm_c) = dot_and_norms(x, c);
                if norm_x < COSINE_EPSILON || norm_c < COSINE_EPSILON {
                    return;
                }
                // ∂(1 - x·c / |x||c|)/∂x = -(c / |x||c| - (x·c) x / |x|³|c|)
                let inv = 1.0 / (norm_x * norm_c);
                let proj = dot / (norm_x * norm_x * norm_x * norm_c);
                for ((o, &xi), &ci) in out.iter_mut().zip(x).zip(c) {
                    *o += scale * -(ci * inv - xi * proj);
                }
            }
        }
    }
}

impl core::str::FromStr for DistanceMeasure {
    type Err = crate::error::RepMetError;

    /// Parses `"euclidean"` as the squared form, matching the usual
    /// meaning of the option in metric-learning configs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "sqeuclidean" | "squared_euclidean" => Ok(Self::SquaredEuclidean),
            "l2" | "euclidean_root" => Ok(Self::Euclidean),
            "cosine" => Ok(Self::Cosine),
            other => Err(crate::error::RepMetError::InvalidConfig(format!(
                "unknown distance measure {other:?}"
            ))),
        }
    }
}

#[inline]
fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[inline]
fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let sq_a: f32 = a.iter().map(|x| x * x).sum();
    let sq_b: f32 = b.iter().map(|x| x * x).sum();
    (dot, sq_a.sqrt(), sq_b.sqrt())
}
