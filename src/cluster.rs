/*
 * This source code is licensed under the Business Source License 1.1.
 */

//! Periodic per-class re-clustering of the training population.
//!
//! [`ClusterManager::update_clusters`] partitions the embeddings of every
//! class independently into `k` clusters and returns the concatenated
//! centres as a fresh [`Centroids`] parameter. It is called every few
//! hundred steps or once per epoch, never per batch.
//!
//! # Algorithm (per class)
//!
//! ```text
//! seed k centres from the class's own embeddings
//! repeat up to max_iterations:
//!     assign every embedding to its nearest centre
//!     stop if no assignment changed
//!     move every centre to the mean of its members
//! ```
//!
//! A centre that loses all of its members keeps its previous position.
//! With `max_iterations == 0` the output is exactly the seeding.
//!
//! # Degraded classes
//!
//! A class with `n < k` examples cannot host `k` distinct centres. Every
//! example becomes a centre and [`DegradedClassPolicy`] decides whether the
//! remaining slots repeat those centres (default, keeps `k` per class) or
//! stay empty. The class is reported in [`ClusterReport::degraded_classes`].
//!
//! # Output order
//!
//! Classes ascend by label; within a class, centres keep seeding order.
//! Given a fixed seed the whole pass is deterministic.

use hashbrown::HashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::centroids::Centroids;
use crate::config::{DegradedClassPolicy, RepMetConfig, Seeding};
use crate::distance::DistanceMeasure;
use crate::error::{RepMetError, Result};
use crate::matrix::Matrix;
use crate::Label;

// ─── Report ─────────────────────────────────────────────────────────────────

/// Outcome of clustering one class.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassClusterStats {
    /// Class label.
    pub label: Label,
    /// Examples of this class in the population.
    pub examples: usize,
    /// Centroids emitted for this class.
    pub centroids: usize,
    /// Refinement iterations actually run.
    pub iterations: usize,
    /// `true` if assignments stopped changing before the iteration cap.
    pub converged: bool,
    /// Sum of example-to-nearest-centre costs after refinement.
    pub inertia: f32,
}

/// Summary of one re-clustering pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterReport {
    /// Per-class statistics, ascending by label.
    pub classes: Vec<ClassClusterStats>,
    /// Classes with fewer than `k` examples.
    pub degraded_classes: Vec<Label>,
    /// Seed that drove centre selection. Re-use it to reproduce the pass.
    pub seed: u64,
    /// Generation number of the centroids produced by this pass.
    pub generation: u64,
}

impl ClusterReport {
    /// Total inertia over all classes.
    pub fn inertia(&self) -> f32 {
        self.classes.iter().map(|c| c.inertia).sum()
    }

    /// `true` if every class converged before the iteration cap.
    pub fn all_converged(&self) -> bool {
        self.classes.iter().all(|c| c.converged)
    }
}

// ─── ClusterManager ─────────────────────────────────────────────────────────

/// Builds per-class centroids from the full training population.
#[derive(Clone, Debug)]
pub struct ClusterManager {
    config: RepMetConfig,
    declared_classes: Option<Vec<Label>>,
    generation: u64,
}

impl ClusterManager {
    /// Create a manager. Fails if the configuration is invalid.
    pub fn new(config: RepMetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            declared_classes: None,
            generation: 0,
        })
    }

    /// Declare the full class set of the training population.
    ///
    /// Every declared class must then have at least one example in each
    /// call to [`Self::update_clusters`].
    #[must_use]
    pub fn with_classes(mut self, classes: &[Label]) -> Self {
        let mut classes = classes.to_vec();
        classes.sort_unstable();
        classes.dedup();
        self.declared_classes = Some(classes);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &RepMetConfig {
        &self.config
    }

    /// Generation of the most recently produced centroids (0 before the first pass).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record a generation installed from elsewhere, e.g. a checkpoint.
    ///
    /// The next pass is numbered above every observed generation.
    pub fn observe_generation(&mut self, generation: u64) {
        self.generation = self.generation.max(generation);
    }

    /// Re-cluster the population and return a fresh centroid parameter.
    ///
    /// `embeddings` is `N × embedding_dim`, `labels` has length `N`.
    pub fn update_clusters(
        &mut self,
        embeddings: &Matrix,
        labels: &[Label],
        max_iterations: usize,
    ) -> Result<(Centroids, ClusterReport)> {
        if embeddings.rows() != labels.len() {
            return Err(RepMetError::LengthMismatch {
                embeddings: embeddings.rows(),
                labels: labels.len(),
            });
        }
        if embeddings.is_empty() {
            return Err(RepMetError::EmptyInput("re-clustering population"));
        }
        if embeddings.cols() != self.config.embedding_dim {
            return Err(RepMetError::DimensionMismatch {
                expected: self.config.embedding_dim,
                got: embeddings.cols(),
            });
        }
        if let Some(row) = embeddings.first_non_finite_row() {
            return Err(RepMetError::NonFiniteInput { what: "embeddings", row });
        }

        let mut members: HashMap<Label, Vec<usize>> = HashMap::new();
        for (i, &label) in labels.iter().enumerate() {
            members.entry(label).or_default().push(i);
        }
        if let Some(declared) = &self.declared_classes {
            if let Some(&missing) = declared.iter().find(|c| !members.contains_key(*c)) {
                return Err(RepMetError::EmptyClass { label: missing });
            }
        }
        let mut class_order: Vec<Label> = members.keys().copied().collect();
        class_order.sort_unstable();

        let seed = self.config.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let k = self.config.num_clusters_per_class;

        let mut values = Matrix::with_cols(embeddings.cols());
        let mut classes = Vec::with_capacity(class_order.len() * k);
        let mut stats = Vec::with_capacity(class_order.len());
        let mut degraded_classes = Vec::new();

        for label in class_order {
            let class_data = embeddings.select_rows(&members[&label]);
            let n = class_data.rows();

            let fit = if n <= k {
                if n < k {
                    warn!(
                        class = label,
                        examples = n,
                        clusters_per_class = k,
                        policy = ?self.config.degraded_policy,
                        "class has fewer examples than clusters"
                    );
                    degraded_classes.push(label);
                }
                degraded_fit(&class_data, k, self.config.degraded_policy, self.config.distance)
            } else {
                let seeds = match self.config.seeding {
                    Seeding::FarthestPoint => {
                        farthest_point_seeds(&class_data, k, self.config.distance, &mut rng)
                    }
                    Seeding::Random => rand::seq::index::sample(&mut rng, n, k).into_vec(),
                };
                lloyd(&class_data, class_data.select_rows(&seeds), self.config.distance, max_iterations)
            };

            debug!(
                class = label,
                examples = n,
                centroids = fit.centres.rows(),
                iterations = fit.iterations,
                converged = fit.converged,
                inertia = fit.inertia,
                "class re-clustered"
            );

            for centre in fit.centres.iter_rows() {
                values.push_row(centre);
                classes.push(label);
            }
            stats.push(ClassClusterStats {
                label,
                examples: n,
                centroids: fit.centres.rows(),
                iterations: fit.iterations,
                converged: fit.converged,
                inertia: fit.inertia,
            });
        }

        self.generation += 1;
        let centroids = Centroids::new(values, classes, self.generation)?;
        let report = ClusterReport {
            classes: stats,
            degraded_classes,
            seed,
            generation: self.generation,
        };
        info!(
            generation = report.generation,
            centroids = centroids.len(),
            classes = report.classes.len(),
            degraded = report.degraded_classes.len(),
            inertia = report.inertia(),
            seed,
            "re-clustering complete"
        );
        Ok((centroids, report))
    }
}

// ─── per-class kernels ──────────────────────────────────────────────────────

struct ClassFit {
    centres: Matrix,
    iterations: usize,
    converged: bool,
    inertia: f32,
}

/// Centres for a class with `n ≤ k` examples: every example, then repeats.
fn degraded_fit(
    data: &Matrix,
    k: usize,
    policy: DegradedClassPolicy,
    measure: DistanceMeasure,
) -> ClassFit {
    let n = data.rows();
    let slots = match policy {
        DegradedClassPolicy::Duplicate => k,
        DegradedClassPolicy::Shrink => n,
    };
    let order: Vec<usize> = (0..slots).map(|s| s % n).collect();
    let centres = data.select_rows(&order);
    let inertia = inertia(data, &centres, measure);
    ClassFit {
        centres,
        iterations: 0,
        converged: true,
        inertia,
    }
}

/// Farthest-point seeding. Requires `data.rows() > k`.
///
/// The first centre is drawn from `rng`; each following centre is the
/// unchosen example with the largest cost to its nearest chosen centre,
/// lowest index on ties.
fn farthest_point_seeds(
    data: &Matrix,
    k: usize,
    measure: DistanceMeasure,
    rng: &mut ChaCha8Rng,
) -> Vec<usize> {
    let n = data.rows();
    let first = rng.random_range(0..n);
    let mut chosen = Vec::with_capacity(k);
    let mut is_chosen = vec![false; n];
    chosen.push(first);
    is_chosen[first] = true;

    let mut nearest: Vec<f32> = data
        .iter_rows()
        .map(|x| measure.cost(x, data.row(first)))
        .collect();

    while chosen.len() < k {
        let mut next = None;
        let mut best = f32::NEG_INFINITY;
        for (i, &d) in nearest.iter().enumerate() {
            if !is_chosen[i] && d > best {
                best = d;
                next = Some(i);
            }
        }
        let Some(next) = next else { break };
        chosen.push(next);
        is_chosen[next] = true;
        let centre = data.row(next);
        for (i, x) in data.iter_rows().enumerate() {
            let d = measure.cost(x, centre);
            if d < nearest[i] {
                nearest[i] = d;
            }
        }
    }
    chosen
}

/// Lloyd refinement starting from `centres`.
fn lloyd(data: &Matrix, mut centres: Matrix, measure: DistanceMeasure, max_iterations: usize) -> ClassFit {
    let (n, dim) = data.shape();
    let k = centres.rows();
    let mut assignment = vec![usize::MAX; n];
    let mut iterations = 0;
    let mut converged = false;

    for _ in 0..max_iterations {
        iterations += 1;

        let mut changed = false;
        for (i, x) in data.iter_rows().enumerate() {
            let (best, _) = nearest_centre(x, &centres, measure);
            if assignment[i] != best {
                assignment[i] = best;
                changed = true;
            }
        }
        if !changed {
            converged = true;
            break;
        }

        let mut sums = Matrix::zeros(k, dim);
        let mut counts = vec![0usize; k];
        for (x, &c) in data.iter_rows().zip(&assignment) {
            counts[c] += 1;
            for (s, &v) in sums.row_mut(c).iter_mut().zip(x) {
                *s += v;
            }
        }
        for (c, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let inv = 1.0 / count as f32;
            let mean = sums.row(c);
            for (dst, &s) in centres.row_mut(c).iter_mut().zip(mean) {
                *dst = s * inv;
            }
        }
    }

    let inertia = inertia(data, &centres, measure);
    ClassFit {
        centres,
        iterations,
        converged,
        inertia,
    }
}

/// Index and cost of the nearest centre, lowest index on ties.
fn nearest_centre(x: &[f32], centres: &Matrix, measure: DistanceMeasure) -> (usize, f32) {
    let mut best = 0;
    let mut best_cost = f32::INFINITY;
    for (j, c) in centres.iter_rows().enumerate() {
        let cost = measure.cost(x, c);
        if cost < best_cost {
            best_cost = cost;
            best = j;
        }
    }
    (best, best_cost)
}

fn inertia(data: &Matrix, centres: &Matrix, measure: DistanceMeasure) -> f32 {
    data.iter_rows()
        .map(|x| nearest_centre(x, centres, measure).1)
        .sum()
}
