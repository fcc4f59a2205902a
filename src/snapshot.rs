//! Portable snapshot of the centroid state for checkpointing.
//!
//! A [`CentroidSnapshot`] stores the centroid rows row-major together with
//! their classes and the re-clustering generation. It carries no gradient:
//! [`CentroidSnapshot::restore`] always yields a fresh parameter.
//!
//! # Example
//!
//! ```rust,ignore
//! use repmet_core::snapshot::CentroidSnapshot;
//!
//! let snapshot = CentroidSnapshot::from_centroids(&centroids);
//! let json = serde_json::to_string(&snapshot).unwrap();
//! let restored = serde_json::from_str::<CentroidSnapshot>(&json)?.restore()?;
//! ```

use crate::centroids::Centroids;
use crate::error::{RepMetError, Result};
use crate::matrix::Matrix;
use crate::Label;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Serializable record of a [`Centroids`] value.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct CentroidSnapshot {
    /// Format version, [`SNAPSHOT_VERSION`] for newly created snapshots.
    pub version: u16,
    /// Re-clustering generation the centroids belong to.
    pub generation: u64,
    /// Embedding dimensionality.
    pub dimension: usize,
    /// Owning class per centroid.
    pub classes: Vec<Label>,
    /// Centroid values, `classes.len() × dimension`, row-major.
    pub values: Vec<f32>,
}

impl CentroidSnapshot {
    /// Capture the current centroid values. The gradient is not stored.
    pub fn from_centroids(centroids: &Centroids) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            generation: centroids.generation(),
            dimension: centroids.dim(),
            classes: centroids.classes().to_vec(),
            values: centroids.values().as_slice().to_vec(),
        }
    }

    /// Number of centroids recorded.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// `true` if no centroids are recorded.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Rebuild [`Centroids`] with a zero gradient.
    ///
    /// Fails on an unknown version or when `values` does not hold
    /// `classes.len() × dimension` entries.
    pub fn restore(&self) -> Result<Centroids> {
        if self.version != SNAPSHOT_VERSION {
            return Err(RepMetError::InvalidConfig(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        let values = Matrix::from_vec(self.classes.len(), self.dimension, self.values.clone())?;
        Centroids::new(values, self.classes.clone(), self.generation)
    }
}

impl From<&Centroids> for CentroidSnapshot {
    fn from(centroids: &Centroids) -> Self {
        Self::from_centroids(centroids)
    }
}
