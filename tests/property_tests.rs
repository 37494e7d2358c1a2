use dipdeck::cluster::{Clustering, DipDeck, DipDeckParams, InitialClusterer, Kmeans};
use dipdeck::dip::{TableDipTest, UnimodalityTest};
use dipdeck::net::Autoencoder;
use dipdeck::Result;
use proptest::prelude::*;

/// Identity autoencoder, so DipDECK properties can be checked without
/// training noise.
struct Identity {
    dim: usize,
}

impl Autoencoder for Identity {
    fn embedding_size(&self) -> usize {
        self.dim
    }
    fn encode(&self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        Ok(batch.to_vec())
    }
    fn decode(&self, embedded: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        Ok(embedded.to_vec())
    }
    fn step(
        &mut self,
        _batch: &[Vec<f32>],
        _embedding_grad: Option<&[Vec<f32>]>,
        _learning_rate: f32,
    ) -> Result<f32> {
        Ok(0.0)
    }
}

/// Strided labels, so every cluster in `[0, n_clusters)` is populated.
struct RoundRobinInit;

impl InitialClusterer for RoundRobinInit {
    fn initial_labels(&self, embedded: &[Vec<f32>], n_clusters: usize) -> Result<Vec<usize>> {
        Ok((0..embedded.len()).map(|i| i % n_clusters).collect())
    }
}

proptest! {
    #[test]
    fn prop_kmeans_all_assigned(
        data in prop::collection::vec(prop::collection::vec(-10.0f32..10.0, 2), 1..20),
        k in 1usize..5
    ) {
        // Skip if k > n
        if k <= data.len() {
            let mut model = Kmeans::new(k).with_seed(42);
            let labels = model.fit_predict(&data).unwrap();

            prop_assert_eq!(labels.len(), data.len());
            for &l in &labels {
                prop_assert!(l < k);
            }
        }
    }

    #[test]
    fn prop_dip_statistic_within_bounds(
        sample in prop::collection::vec(-100.0f32..100.0, 4..200)
    ) {
        let n = sample.len() as f64;
        let min = sample.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = sample.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let dip = TableDipTest.dip(&sample);
        if max > min {
            prop_assert!(dip >= 1.0 / (2.0 * n) - 1e-12);
        } else {
            // Constant samples carry no modality information.
            prop_assert_eq!(dip, 0.0);
        }
        prop_assert!(dip <= 0.25 + 1e-12);
        let p = TableDipTest.p_value(dip, sample.len()).unwrap();
        prop_assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn prop_dipdeck_estimate_bounded(
        data in prop::collection::vec(prop::collection::vec(-10.0f32..10.0, 2), 30..60),
        start in 2usize..6,
        threshold in 0.0f64..=1.0
    ) {
        let mut estimator = DipDeck::new(DipDeckParams {
            n_clusters_start: start,
            dip_merge_threshold: threshold,
            pretrain_epochs: 0,
            clustering_epochs: 1,
            batch_size: 16,
            seed: Some(7),
            ..Default::default()
        })
        .with_autoencoder(Box::new(Identity { dim: 2 }))
        .with_initializer(Box::new(RoundRobinInit));
        let fit = estimator.fit(&data).unwrap();

        // The estimate only ever moves down from the start.
        prop_assert!(fit.n_clusters >= 1);
        prop_assert!(fit.n_clusters <= start);
        prop_assert_eq!(fit.labels.len(), data.len());
        // Labels stay inside [0, n_clusters). Individual clusters may end
        // up empty when two centers snap to the same sample.
        for &l in &fit.labels {
            prop_assert!(l < fit.n_clusters);
        }
        // Centers are sample rows.
        for c in &fit.centers {
            prop_assert!(data.contains(c));
        }
    }
}
