//! End-to-end loss behaviour through the public API.
//!
//! Each test builds centroids either by re-clustering a small population or
//! by hand, then checks one documented property of the per-batch loss.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use repmet_core::{
    Centroids, DistanceMeasure, Label, LossEngine, LossFormulation, Matrix, RepMetConfig,
    RepMetError, RepMetLoss, VarianceMode,
};

// ─── helpers ─────────────────────────────────────────────────────────────────

/// `per_class` noisy points around each of `centres`, labelled by index.
fn blobs(centres: &[[f32; 2]], per_class: usize, spread: f32, seed: u64) -> (Matrix, Vec<Label>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for (label, c) in centres.iter().enumerate() {
        for _ in 0..per_class {
            rows.push([
                c[0] + rng.random_range(-spread..spread),
                c[1] + rng.random_range(-spread..spread),
            ]);
            labels.push(label as Label);
        }
    }
    (Matrix::from_rows(&rows).unwrap(), labels)
}

fn hand_centroids(rows: &[[f32; 2]], classes: &[Label]) -> Centroids {
    Centroids::new(Matrix::from_rows(rows).unwrap(), classes.to_vec(), 1).unwrap()
}

// ─── scenarios ───────────────────────────────────────────────────────────────

#[test]
fn test_well_separated_example_is_classified_correctly() {
    let c = hand_centroids(&[[0.0, 0.0], [10.0, 10.0]], &[0, 1]);
    let mut engine = LossEngine::new(RepMetConfig::new(1, 2)).unwrap();
    let out = engine
        .loss(&c, &Matrix::from_rows(&[[0.0f32, 0.0]]).unwrap(), &[0])
        .unwrap();
    assert!(out.min_match[0].abs() < 1e-6);
    assert!((out.min_non_match[0].unwrap() - 200.0).abs() < 1e-3);
    assert_eq!(out.predicted_classes, vec![0]);
    assert_eq!(out.accuracy, 1.0);
}

#[test]
fn test_sample_costs_have_batch_by_centroid_shape() {
    let (x, y) = blobs(&[[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]], 10, 0.5, 1);
    let mut repmet = RepMetLoss::new(RepMetConfig::new(2, 2).with_seed(5)).unwrap();
    repmet.update_clusters(&x, &y).unwrap();
    let out = repmet.loss(&x, &y).unwrap();
    assert_eq!(out.sample_costs.shape(), (30, 6));
    assert_eq!(out.len(), 30);
    assert!(out.sample_costs.as_slice().iter().all(|&c| c >= 0.0));
}

#[test]
fn test_clustered_population_scores_perfect_accuracy() {
    let (x, y) = blobs(&[[0.0, 0.0], [6.0, 0.0], [0.0, 6.0]], 15, 0.5, 2);
    let mut repmet = RepMetLoss::new(RepMetConfig::new(3, 2).with_seed(9)).unwrap();
    repmet.update_clusters(&x, &y).unwrap();
    let out = repmet.loss(&x, &y).unwrap();
    assert_eq!(out.accuracy, 1.0);
    assert_eq!(out.predicted_classes, y);
    assert!(out.per_example_losses.iter().all(|&l| l >= 0.0));
}

#[test]
fn test_minima_are_consistent_with_the_cost_matrix() {
    let (x, y) = blobs(&[[0.0, 0.0], [1.0, 1.0]], 12, 1.5, 3);
    let mut repmet = RepMetLoss::new(RepMetConfig::new(3, 2).with_seed(1)).unwrap();
    repmet.update_clusters(&x, &y).unwrap();
    let out = repmet.loss(&x, &y).unwrap();
    let classes = repmet.centroids().unwrap().classes().to_vec();
    for (i, &label) in y.iter().enumerate() {
        for (j, &cost) in out.sample_costs.row(i).iter().enumerate() {
            if classes[j] == label {
                assert!(out.min_match[i] <= cost);
            } else {
                assert!(out.min_non_match[i].unwrap() <= cost);
            }
        }
    }
}

#[test]
fn test_mislabelled_batch_scores_zero_accuracy() {
    let c = hand_centroids(&[[0.0, 0.0], [5.0, 5.0]], &[0, 1]);
    let x = Matrix::from_rows(&[[0.1f32, 0.0], [5.0, 4.9]]).unwrap();
    let mut engine = LossEngine::new(RepMetConfig::new(1, 2)).unwrap();
    let out = engine.loss(&c, &x, &[1, 0]).unwrap();
    assert_eq!(out.accuracy, 0.0);
    assert!(out.total_loss > 0.0);
}

#[test]
fn test_label_without_centroid_is_an_error() {
    let (x, y) = blobs(&[[0.0, 0.0], [3.0, 3.0]], 5, 0.3, 4);
    let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2).with_seed(0)).unwrap();
    repmet.update_clusters(&x, &y).unwrap();
    let err = repmet
        .loss(&Matrix::from_rows(&[[0.0f32, 0.0]]).unwrap(), &[7])
        .unwrap_err();
    assert_eq!(err, RepMetError::UnknownClass { label: 7 });
}

#[test]
fn test_far_away_examples_stay_finite() {
    let c = hand_centroids(&[[0.0, 0.0], [1.0e3, 1.0e3]], &[0, 1]);
    let x = Matrix::from_rows(&[[-1.0e3f32, 0.0], [5.0e2, 5.0e2]]).unwrap();
    for formulation in [
        LossFormulation::Probabilistic,
        LossFormulation::Margin,
        LossFormulation::Combined,
    ] {
        let mut engine =
            LossEngine::new(RepMetConfig::new(1, 2).with_formulation(formulation)).unwrap();
        let out = engine.loss(&c, &x, &[0, 1]).unwrap();
        assert!(out.total_loss.is_finite(), "{formulation:?}");
        let grads = engine.backward(&c, &x, &out).unwrap();
        assert!(grads.embeddings.as_slice().iter().all(|g| g.is_finite()));
        assert!(grads.centroids.as_slice().iter().all(|g| g.is_finite()));
    }
}

#[test]
fn test_batch_variance_is_shared_by_the_whole_batch() {
    let (x, y) = blobs(&[[0.0, 0.0], [4.0, 4.0]], 8, 1.0, 5);
    let cfg = RepMetConfig::new(2, 2)
        .with_seed(3)
        .with_variance(VarianceMode::Batch);
    let mut repmet = RepMetLoss::new(cfg).unwrap();
    repmet.update_clusters(&x, &y).unwrap();
    let out = repmet.loss(&x, &y).unwrap();
    let expected = out.min_match.iter().map(|&m| m as f64).sum::<f64>() / (x.rows() - 1) as f64;
    assert!((out.variance as f64 - expected.max(1e-6)).abs() < 1e-4);
}

#[test]
fn test_cosine_training_pulls_examples_towards_their_class() {
    let c = hand_centroids(&[[1.0, 0.0], [0.0, 1.0]], &[0, 1]);
    let mut x = Matrix::from_rows(&[[0.6f32, 0.8]]).unwrap();
    let cfg = RepMetConfig::new(1, 2)
        .with_distance(DistanceMeasure::Cosine)
        .with_formulation(LossFormulation::Margin);
    let mut engine = LossEngine::new(cfg).unwrap();
    let before = engine.loss(&c, &x, &[0]).unwrap();
    let grads = engine.backward(&c, &x, &before).unwrap();
    for (v, g) in x.as_mut_slice().iter_mut().zip(grads.embeddings.as_slice()) {
        *v -= 0.1 * g;
    }
    let after = engine.loss(&c, &x, &[0]).unwrap();
    assert!(after.total_loss < before.total_loss);
}

#[test]
fn test_nan_embedding_is_an_input_error() {
    let (x, y) = blobs(&[[0.0, 0.0], [3.0, 3.0]], 5, 0.3, 6);
    let mut repmet = RepMetLoss::new(RepMetConfig::new(1, 2).with_seed(0)).unwrap();
    repmet.update_clusters(&x, &y).unwrap();
    let batch = Matrix::from_rows(&[[0.0f32, 0.0], [1.0, f32::NAN]]).unwrap();
    let err = repmet.loss(&batch, &[0, 1]).unwrap_err();
    assert_eq!(err, RepMetError::NonFiniteInput { what: "embeddings", row: 1 });
    assert!(err.is_invalid_input());
}
