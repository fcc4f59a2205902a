//! Error taxonomy.
//!
//! Every shape or consistency problem in caller input is surfaced as a
//! [`RepMetError`] before any arithmetic runs, so a bad batch never turns
//! into a silent NaN loss. Numerical edge conditions are not errors; they
//! are absorbed by the ε guards and reported as
//! [`crate::loss::NumericalWarning`].

use thiserror::Error;

use crate::Label;

/// Errors returned by clustering and loss computation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepMetError {
    /// Embedding rows and labels disagree in count.
    #[error("length mismatch: {embeddings} embeddings but {labels} labels")]
    LengthMismatch {
        /// Number of embedding rows supplied.
        embeddings: usize,
        /// Number of labels supplied.
        labels: usize,
    },

    /// Embedding width differs from the configured dimensionality.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Configured `embedding_dim`.
        expected: usize,
        /// Width of the supplied rows.
        got: usize,
    },

    /// No embeddings were supplied.
    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    /// An embedding or centroid row holds NaN or an infinity.
    #[error("non-finite value in {what} row {row}")]
    NonFiniteInput {
        /// Which input: `"embeddings"` or `"centroids"`.
        what: &'static str,
        /// First offending row.
        row: usize,
    },

    /// A declared class has no examples in the re-clustering population.
    #[error("class {label} has no examples")]
    EmptyClass {
        /// The class without examples.
        label: Label,
    },

    /// A batch label has no centroid of its own class.
    #[error("class {label} has no centroid")]
    UnknownClass {
        /// The label that could not be matched.
        label: Label,
    },

    /// The loss was called before any centroids were installed.
    #[error("no centroids: call update_clusters before computing the loss")]
    NoCentroids,

    /// Backward was called with centroids from a different re-clustering
    /// pass than the forward output.
    #[error("stale centroids: loss computed against generation {expected}, got {got}")]
    StaleCentroids {
        /// Generation used by the forward pass.
        expected: u64,
        /// Generation supplied to backward.
        got: u64,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RepMetError {
    /// `true` for input-shape and lookup errors raised by a training step.
    ///
    /// Configuration errors are raised at construction time instead.
    pub fn is_invalid_input(&self) -> bool {
        !matches!(self, Self::InvalidConfig(_))
    }
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, RepMetError>;
