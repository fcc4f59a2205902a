//! Trainable centroid state.
//!
//! A [`Centroids`] value pairs the centroid parameter with the class that
//! owns each row. It is produced wholesale by a re-clustering pass and
//! afterwards only changed by gradient steps from the training loop.
//!
//! # Invariants
//!
//! - `values.rows() == classes.len() == grad.rows()`.
//! - A re-clustering pass never edits an existing parameter; it builds a
//!   new [`CentroidParameter`] with a zeroed gradient and the next
//!   generation number, so no gradient accumulated against the previous
//!   centroids can leak into the new ones.

use hashbrown::HashMap;

use crate::error::{RepMetError, Result};
use crate::matrix::Matrix;
use crate::Label;

// ─── CentroidParameter ──────────────────────────────────────────────────────

/// Centroid values plus their gradient buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct CentroidParameter {
    values: Matrix,
    grad: Matrix,
    generation: u64,
}

impl CentroidParameter {
    /// Fresh leaf parameter: zero gradient, given generation.
    pub fn new(values: Matrix, generation: u64) -> Self {
        let (rows, cols) = values.shape();
        Self {
            values,
            grad: Matrix::zeros(rows, cols),
            generation,
        }
    }

    /// Current centroid values (`C × D`).
    pub fn values(&self) -> &Matrix {
        &self.values
    }

    /// Accumulated gradient (`C × D`).
    pub fn grad(&self) -> &Matrix {
        &self.grad
    }

    /// Re-clustering epoch this parameter belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ─── Centroids ──────────────────────────────────────────────────────────────

/// Centroid parameter and the parallel list of owning classes.
#[derive(Clone, Debug, PartialEq)]
pub struct Centroids {
    parameter: CentroidParameter,
    classes: Vec<Label>,
}

impl Centroids {
    /// Wrap centroid rows and their classes as a new parameter.
    ///
    /// Fails with [`RepMetError::LengthMismatch`] when the counts differ.
    pub fn new(values: Matrix, classes: Vec<Label>, generation: u64) -> Result<Self> {
        if values.rows() != classes.len() {
            return Err(RepMetError::LengthMismatch {
                embeddings: values.rows(),
                labels: classes.len(),
            });
        }
        Ok(Self {
            parameter: CentroidParameter::new(values, generation),
            classes,
        })
    }

    /// Number of centroids.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// `true` when there are no centroids.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Embedding dimensionality.
    pub fn dim(&self) -> usize {
        self.parameter.values.cols()
    }

    /// Centroid rows.
    pub fn values(&self) -> &Matrix {
        &self.parameter.values
    }

    /// Owning class of each centroid.
    pub fn classes(&self) -> &[Label] {
        &self.classes
    }

    /// Accumulated centroid gradient.
    pub fn grad(&self) -> &Matrix {
        &self.parameter.grad
    }

    /// Re-clustering epoch of the current parameter.
    pub fn generation(&self) -> u64 {
        self.parameter.generation
    }

    /// Underlying parameter.
    pub fn parameter(&self) -> &CentroidParameter {
        &self.parameter
    }

    /// Indices of the centroids owned by `class`.
    pub fn indices_of(&self, class: Label) -> Vec<usize> {
        self.classes
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == class)
            .map(|(j, _)| j)
            .collect()
    }

    /// Centroid count per class.
    pub fn class_counts(&self) -> HashMap<Label, usize> {
        let mut counts = HashMap::new();
        for &c in &self.classes {
            *counts.entry(c).or_insert(0) += 1;
        }
        counts
    }

    /// Reset the gradient buffer to zero.
    pub fn zero_grad(&mut self) {
        self.parameter.grad.fill_zero();
    }

    /// Add `grad` (`C × D`, e.g. from [`crate::Gradients::centroids`]) into the buffer.
    pub fn accumulate_grad(&mut self, grad: &Matrix) -> Result<()> {
        if grad.shape() != self.parameter.grad.shape() {
            return Err(RepMetError::DimensionMismatch {
                expected: self.parameter.grad.as_slice().len(),
                got: grad.as_slice().len(),
            });
        }
        for (g, &d) in self.parameter.grad.as_mut_slice().iter_mut().zip(grad.as_slice()) {
            *g += d;
        }
        Ok(())
    }

    /// One SGD step: `value -= learning_rate * grad`, then zero the gradient.
    pub fn step(&mut self, learning_rate: f32) {
        let CentroidParameter { values, grad, .. } = &mut self.parameter;
        for (v, &g) in values.as_mut_slice().iter_mut().zip(grad.as_slice()) {
            *v -= learning_rate * g;
        }
        grad.fill_zero();
    }
}
