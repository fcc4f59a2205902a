//! Centroid snapshot round-trip tests.
//!
//! Captures centroids produced by a re-clustering pass, serialises them to
//! JSON, restores them and checks the loss is unchanged.

#[cfg(feature = "serde")]
mod tests {
    use repmet_core::snapshot::{CentroidSnapshot, SNAPSHOT_VERSION};
    use repmet_core::{LossEngine, Matrix, RepMetConfig, RepMetLoss, VarianceMode};

    fn trained() -> (RepMetLoss, Matrix, Vec<u32>) {
        let x = Matrix::from_rows(&[
            [0.0f32, 0.0],
            [0.5, 0.2],
            [0.3, 0.9],
            [4.0, 4.0],
            [4.4, 3.8],
            [3.9, 4.5],
        ])
        .unwrap();
        let y = vec![0, 0, 0, 1, 1, 1];
        let mut repmet = RepMetLoss::new(RepMetConfig::new(2, 2).with_seed(21)).unwrap();
        repmet.update_clusters(&x, &y).unwrap();
        (repmet, x, y)
    }

    #[test]
    fn test_json_round_trip_preserves_centroids() {
        let (repmet, _, _) = trained();
        let centroids = repmet.centroids().unwrap();
        let snapshot = CentroidSnapshot::from_centroids(centroids);
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.len(), 4);

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: CentroidSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);

        let restored = decoded.restore().unwrap();
        assert_eq!(restored.values(), centroids.values());
        assert_eq!(restored.classes(), centroids.classes());
        assert_eq!(restored.generation(), centroids.generation());
    }

    #[test]
    fn test_restored_centroids_give_the_same_loss() {
        let (mut repmet, x, y) = trained();
        let expected = repmet.loss(&x, &y).unwrap();

        let json = serde_json::to_string(&CentroidSnapshot::from_centroids(
            repmet.centroids().unwrap(),
        ))
        .unwrap();
        let restored = serde_json::from_str::<CentroidSnapshot>(&json)
            .unwrap()
            .restore()
            .unwrap();

        let mut engine = LossEngine::new(RepMetConfig::new(2, 2)).unwrap();
        let out = engine.loss(&restored, &x, &y).unwrap();
        assert_eq!(out.per_example_losses, expected.per_example_losses);
        assert_eq!(out.accuracy, expected.accuracy);

        let mut fresh = RepMetLoss::new(RepMetConfig::new(2, 2)).unwrap();
        fresh.set_centroids(restored).unwrap();
        assert_eq!(fresh.loss(&x, &y).unwrap().total_loss, expected.total_loss);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let cfg = RepMetConfig::new(4, 64)
            .with_margin(0.5)
            .with_variance(VarianceMode::RunningAverage { momentum: 0.9 })
            .with_seed(3);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RepMetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_missing_config_fields_take_defaults() {
        let cfg: RepMetConfig = serde_json::from_str(r#"{"embedding_dim": 16}"#).unwrap();
        assert_eq!(cfg.embedding_dim, 16);
        assert_eq!(cfg.num_clusters_per_class, RepMetConfig::default().num_clusters_per_class);
    }
}
