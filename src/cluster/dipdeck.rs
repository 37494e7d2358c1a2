//! DipDECK: deep embedded clustering with dip-test cluster-count estimation.
//!
//! DipDECK (Leiber et al., "Dip-based Deep Embedded Clustering with
//! k-Estimation", KDD 2021) trains an autoencoder jointly with a clustering
//! objective while estimating the number of clusters on the fly. It starts
//! deliberately overclustered and consults Hartigan's dip test on the
//! projection of every cluster pair: a high p-value means the union of the
//! two clusters looks unimodal, so they are really one cluster and get
//! merged. Training restarts its epoch countdown after every structural
//! change, so the final embedding is always trained to convergence against
//! the final cluster structure.
//!
//! The estimator is generic over three collaborators, each behind a trait:
//! the [`Autoencoder`] being trained, the [`UnimodalityTest`] consulted for
//! merges, and the [`InitialClusterer`] producing the overclustered start.
//! Defaults ([`DenseAutoencoder`], [`TableDipTest`], [`KmeansInit`]) are
//! provided for all three.

use rand::prelude::*;
use tracing::{debug, info, warn};

use super::kmeans::Kmeans;
use super::state::{
    assign_nearest, build_dip_matrix, cluster_means, cluster_sizes, dip_argmax, dissolve_cluster,
    merge_clusters, nearest_points_to_targets, ClusterState,
};
use super::traits::Clustering;
use super::util::squared_euclidean;
use crate::dip::{TableDipTest, UnimodalityTest};
use crate::error::{Error, Result};
use crate::net::{Autoencoder, DenseAutoencoder};

/// A cluster this much smaller than the mean cluster size is dissolved
/// instead of merged when the cluster count must be forced down.
const SMALL_CLUSTER_FRACTION: f32 = 0.2;

/// Hidden layer widths of the default autoencoder.
const DEFAULT_HIDDEN: &[usize] = &[500, 500, 2000];

/// Produces the initial (overclustered) hard labels in embedding space.
pub trait InitialClusterer {
    /// Cluster the embedded data into exactly `n_clusters` groups, returning
    /// one label in `[0, n_clusters)` per row.
    fn initial_labels(&self, embedded: &[Vec<f32>], n_clusters: usize) -> Result<Vec<usize>>;
}

/// Default initializer: k-means++ on the embedded data.
#[derive(Debug, Clone, Default)]
pub struct KmeansInit {
    seed: Option<u64>,
}

impl KmeansInit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the seed for reproducible initialization.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl InitialClusterer for KmeansInit {
    fn initial_labels(&self, embedded: &[Vec<f32>], n_clusters: usize) -> Result<Vec<usize>> {
        let mut kmeans = Kmeans::new(n_clusters);
        if let Some(seed) = self.seed {
            kmeans = kmeans.with_seed(seed);
        }
        Ok(kmeans.fit(embedded)?.labels)
    }
}

/// Hyperparameters for [`DipDeck`].
#[derive(Debug, Clone)]
pub struct DipDeckParams {
    /// Number of clusters to start from (the overclustered upper guess).
    pub n_clusters_start: usize,
    /// Merge a cluster pair when its dip p-value reaches this threshold.
    pub dip_merge_threshold: f64,
    /// Weight of the clustering term relative to the reconstruction loss.
    pub cluster_loss_weight: f32,
    /// Hard upper bound on the final cluster count; enforced by merging or
    /// dissolving even when no pair passes the threshold.
    pub n_clusters_max: usize,
    /// Hard lower bound on the final cluster count.
    pub n_clusters_min: usize,
    /// Mini-batch size for both pretraining and clustering epochs.
    pub batch_size: usize,
    /// Learning rate for autoencoder pretraining.
    pub pretrain_learning_rate: f32,
    /// Learning rate during joint clustering epochs.
    pub clustering_learning_rate: f32,
    /// Reconstruction-only epochs before clustering starts.
    pub pretrain_epochs: usize,
    /// Clustering epochs that must pass without a structural change before
    /// training stops.
    pub clustering_epochs: usize,
    /// Embedding dimension of the default autoencoder.
    pub embedding_size: usize,
    /// Size ratio beyond which a cluster pair counts as imbalanced and the
    /// larger side is additionally dip-tested on a subsample.
    pub max_cluster_size_diff_factor: f32,
    /// Seed for batching, pretraining and default collaborators. `None`
    /// draws entropy from the operating system.
    pub seed: Option<u64>,
}

impl Default for DipDeckParams {
    fn default() -> Self {
        Self {
            n_clusters_start: 35,
            dip_merge_threshold: 0.9,
            cluster_loss_weight: 1.0,
            n_clusters_max: usize::MAX,
            n_clusters_min: 1,
            batch_size: 256,
            pretrain_learning_rate: 1e-3,
            clustering_learning_rate: 1e-4,
            pretrain_epochs: 100,
            clustering_epochs: 50,
            embedding_size: 5,
            max_cluster_size_diff_factor: 2.0,
            seed: None,
        }
    }
}

/// Result of a [`DipDeck`] fit.
pub struct DipDeckFit {
    /// Final hard labels, one per input row, in `[0, n_clusters)`.
    pub labels: Vec<usize>,
    /// Estimated number of clusters.
    pub n_clusters: usize,
    /// Final cluster centers as original-space sample rows.
    pub centers: Vec<Vec<f32>>,
    /// The trained autoencoder.
    pub autoencoder: Box<dyn Autoencoder>,
}

impl DipDeckFit {
    /// Label new rows by their nearest cluster center in embedding space.
    pub fn predict(&self, data: &[Vec<f32>]) -> Result<Vec<usize>> {
        let embedded = self.autoencoder.encode(data)?;
        let embedded_centers = self.autoencoder.encode(&self.centers)?;
        Ok(assign_nearest(&embedded, &embedded_centers))
    }
}

/// The DipDECK estimator.
///
/// Collaborators not supplied through the builder are constructed at fit
/// time from [`DipDeckParams`].
///
/// ```
/// use dipdeck::{DipDeck, DipDeckParams, DenseAutoencoder};
///
/// let mut data = Vec::new();
/// for i in 0..20 {
///     data.push(vec![i as f32 * 0.01, 0.0]);
///     data.push(vec![10.0 + i as f32 * 0.01, 0.0]);
/// }
/// let autoencoder = DenseAutoencoder::new(2, &[8], 2, 7).unwrap();
/// let mut estimator = DipDeck::new(DipDeckParams {
///     n_clusters_start: 4,
///     pretrain_epochs: 5,
///     clustering_epochs: 3,
///     seed: Some(42),
///     ..Default::default()
/// })
/// .with_autoencoder(Box::new(autoencoder));
/// let fit = estimator.fit(&data).unwrap();
/// assert_eq!(fit.labels.len(), data.len());
/// assert!(fit.n_clusters >= 1 && fit.n_clusters <= 4);
/// ```
pub struct DipDeck {
    params: DipDeckParams,
    autoencoder: Option<Box<dyn Autoencoder>>,
    dip_test: Box<dyn UnimodalityTest>,
    initializer: Option<Box<dyn InitialClusterer>>,
}

impl DipDeck {
    pub fn new(params: DipDeckParams) -> Self {
        Self {
            params,
            autoencoder: None,
            dip_test: Box::new(TableDipTest),
            initializer: None,
        }
    }

    /// Supply a pre-built (possibly pre-trained) autoencoder. It is consumed
    /// by the next [`fit`](Self::fit) and returned inside the fit result.
    pub fn with_autoencoder(mut self, autoencoder: Box<dyn Autoencoder>) -> Self {
        self.autoencoder = Some(autoencoder);
        self
    }

    /// Replace the unimodality test consulted for merge decisions.
    pub fn with_dip_test(mut self, test: Box<dyn UnimodalityTest>) -> Self {
        self.dip_test = test;
        self
    }

    /// Replace the initial clustering strategy.
    pub fn with_initializer(mut self, initializer: Box<dyn InitialClusterer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    fn validate(&self, data: &[Vec<f32>]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::EmptyInput);
        }
        let dim = data[0].len();
        if dim == 0 {
            return Err(Error::EmptyInput);
        }
        for row in data {
            if row.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    found: row.len(),
                });
            }
        }
        let p = &self.params;
        if p.n_clusters_start == 0 {
            return Err(Error::InvalidParameter {
                name: "n_clusters_start",
                message: "must be positive",
            });
        }
        if p.n_clusters_start > data.len() {
            return Err(Error::InvalidClusterCount {
                requested: p.n_clusters_start,
                n_items: data.len(),
            });
        }
        if p.n_clusters_min == 0 {
            return Err(Error::InvalidParameter {
                name: "n_clusters_min",
                message: "must be positive",
            });
        }
        if p.n_clusters_min > p.n_clusters_max {
            return Err(Error::InvalidParameter {
                name: "n_clusters_min",
                message: "must not exceed n_clusters_max",
            });
        }
        if p.n_clusters_start < p.n_clusters_min {
            return Err(Error::InvalidParameter {
                name: "n_clusters_start",
                message: "must be at least n_clusters_min",
            });
        }
        if p.batch_size == 0 {
            return Err(Error::InvalidParameter {
                name: "batch_size",
                message: "must be positive",
            });
        }
        if !(0.0..=1.0).contains(&p.dip_merge_threshold) {
            return Err(Error::InvalidParameter {
                name: "dip_merge_threshold",
                message: "must lie in [0, 1]",
            });
        }
        if p.max_cluster_size_diff_factor < 1.0 {
            return Err(Error::InvalidParameter {
                name: "max_cluster_size_diff_factor",
                message: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Estimate the cluster structure of `data`.
    ///
    /// Runs autoencoder pretraining (unless `pretrain_epochs` is zero),
    /// overclusters the embedded data, then alternates joint training
    /// epochs with dip-based merge decisions until `clustering_epochs`
    /// epochs pass without a structural change.
    pub fn fit(&mut self, data: &[Vec<f32>]) -> Result<DipDeckFit> {
        self.validate(data)?;
        let params = self.params.clone();
        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut autoencoder = match self.autoencoder.take() {
            Some(ae) => ae,
            None => Box::new(DenseAutoencoder::new(
                data[0].len(),
                DEFAULT_HIDDEN,
                params.embedding_size,
                rng.random(),
            )?),
        };

        // Reconstruction-only pretraining.
        let mut order: Vec<usize> = (0..data.len()).collect();
        for epoch in 0..params.pretrain_epochs {
            order.shuffle(&mut rng);
            let mut loss = 0.0f32;
            let mut batches = 0usize;
            for chunk in order.chunks(params.batch_size) {
                let batch: Vec<Vec<f32>> = chunk.iter().map(|&i| data[i].clone()).collect();
                loss += autoencoder.step(&batch, None, params.pretrain_learning_rate)?;
                batches += 1;
            }
            debug!(epoch, loss = loss / batches as f32, "pretrain epoch");
        }

        // Overclustered start in embedding space.
        let embedded = autoencoder.encode(data)?;
        if embedded[0].len() != autoencoder.embedding_size() {
            return Err(Error::DimensionMismatch {
                expected: autoencoder.embedding_size(),
                found: embedded[0].len(),
            });
        }
        let labels = match &self.initializer {
            Some(init) => init.initial_labels(&embedded, params.n_clusters_start)?,
            None => KmeansInit {
                seed: Some(rng.random()),
            }
            .initial_labels(&embedded, params.n_clusters_start)?,
        };
        let means = cluster_means(&embedded, &labels, params.n_clusters_start, &embedded);
        let (centers, embedded_centers) = nearest_points_to_targets(data, &embedded, &means);
        let dip_matrix = build_dip_matrix(
            &embedded,
            &embedded_centers,
            &labels,
            params.n_clusters_start,
            params.max_cluster_size_diff_factor,
            self.dip_test.as_ref(),
        )?;
        let mut state = ClusterState {
            labels,
            centers,
            embedded_centers,
            dip_matrix,
            n_clusters: params.n_clusters_start,
        };
        info!(n_clusters = state.n_clusters, "initial clustering done");

        // Joint training. The epoch counter restarts at every structural
        // change, so termination means `clustering_epochs` quiet epochs.
        let mut i = 0usize;
        while i < params.clustering_epochs {
            let weights = relationship_weights(&state.dip_matrix);
            order.shuffle(&mut rng);
            let mut recon_loss = 0.0f32;
            let mut cluster_loss = 0.0f32;
            let mut batches = 0usize;

            for chunk in order.chunks(params.batch_size) {
                let batch: Vec<Vec<f32>> = chunk.iter().map(|&idx| data[idx].clone()).collect();
                let embedded_batch = autoencoder.encode(&batch)?;
                let embedded_centers = autoencoder.encode(&state.centers)?;

                // Squared distances of every batch point to every center.
                let sq_dists: Vec<Vec<f32>> = embedded_batch
                    .iter()
                    .map(|z| {
                        embedded_centers
                            .iter()
                            .map(|c| squared_euclidean(z, c))
                            .collect()
                    })
                    .collect();

                // On the first epoch after a structural change the stored
                // labels are kept fixed so the network is pulled toward the
                // freshly decided structure; afterwards points follow their
                // nearest center.
                let batch_labels: Vec<usize> = if i == 0 {
                    chunk.iter().map(|&idx| state.labels[idx]).collect()
                } else {
                    sq_dists
                        .iter()
                        .map(|d| super::util::argmin(d.iter().copied()))
                        .collect()
                };

                let scale = center_distance_scale(&embedded_centers);
                let factor =
                    params.cluster_loss_weight * scale / batch.len() as f32;
                let grads: Vec<Vec<f32>> = embedded_batch
                    .iter()
                    .zip(&batch_labels)
                    .map(|(z, &l)| {
                        let mut g = vec![0.0f32; z.len()];
                        for (c, center) in embedded_centers.iter().enumerate() {
                            let w = weights[l][c];
                            for (gd, (zd, cd)) in g.iter_mut().zip(z.iter().zip(center)) {
                                *gd += factor * 2.0 * w * (zd - cd);
                            }
                        }
                        g
                    })
                    .collect();

                cluster_loss += factor * weighted_distance_sum(&weights, &batch_labels, &sq_dists);
                recon_loss +=
                    autoencoder.step(&batch, Some(&grads), params.clustering_learning_rate)?;
                batches += 1;
            }

            // Structure update: re-embed everything, reassign, re-center,
            // refresh the dip matrix.
            let embedded = autoencoder.encode(data)?;
            state.embedded_centers = autoencoder.encode(&state.centers)?;
            state.labels = assign_nearest(&embedded, &state.embedded_centers);
            let means = cluster_means(
                &embedded,
                &state.labels,
                state.n_clusters,
                &state.embedded_centers,
            );
            let (centers, embedded_centers) =
                nearest_points_to_targets(data, &embedded, &means);
            state.centers = centers;
            state.embedded_centers = embedded_centers;
            state.dip_matrix = build_dip_matrix(
                &embedded,
                &state.embedded_centers,
                &state.labels,
                state.n_clusters,
                params.max_cluster_size_diff_factor,
                self.dip_test.as_ref(),
            )?;
            i += 1;
            debug!(
                epoch = i,
                n_clusters = state.n_clusters,
                reconstruction_loss = recon_loss / batches as f32,
                cluster_loss = cluster_loss / batches as f32,
                loss = (recon_loss + cluster_loss) / batches as f32,
                "clustering epoch"
            );

            // Merge every pair whose unimodality evidence passes the
            // threshold, best pair first.
            let (mut a, mut b) = dip_argmax(&state.dip_matrix);
            while state.n_clusters > params.n_clusters_min
                && state.dip_matrix[a][b] >= params.dip_merge_threshold
            {
                i = 0;
                info!(
                    a,
                    b,
                    p_value = state.dip_matrix[a][b],
                    n_clusters = state.n_clusters - 1,
                    "merging cluster pair"
                );
                merge_clusters(
                    &mut state,
                    data,
                    &embedded,
                    (a, b),
                    params.max_cluster_size_diff_factor,
                    self.dip_test.as_ref(),
                )?;
                if state.n_clusters == 1 {
                    break;
                }
                (a, b) = dip_argmax(&state.dip_matrix);
            }
            if state.n_clusters == 1 {
                warn!("only one cluster remains, stopping early");
                break;
            }

            // Training would stop here, but the upper bound is still
            // violated: force the count down by one and train another era.
            if i == params.clustering_epochs && state.n_clusters > params.n_clusters_max {
                i = 0;
                let sizes = cluster_sizes(&state.labels, state.n_clusters);
                let smallest = super::util::argmin(sizes.iter().map(|&s| s as f32));
                let mean_size = state.labels.len() as f32 / state.n_clusters as f32;
                if (sizes[smallest] as f32) < SMALL_CLUSTER_FRACTION * mean_size {
                    info!(
                        cluster = smallest,
                        size = sizes[smallest],
                        "dissolving undersized cluster to reach n_clusters_max"
                    );
                    dissolve_cluster(
                        &mut state,
                        data,
                        &embedded,
                        smallest,
                        params.max_cluster_size_diff_factor,
                        self.dip_test.as_ref(),
                    )?;
                } else {
                    let pair = dip_argmax(&state.dip_matrix);
                    info!(
                        a = pair.0,
                        b = pair.1,
                        "forcing a merge to reach n_clusters_max"
                    );
                    merge_clusters(
                        &mut state,
                        data,
                        &embedded,
                        pair,
                        params.max_cluster_size_diff_factor,
                        self.dip_test.as_ref(),
                    )?;
                }
                if state.n_clusters == 1 {
                    warn!("only one cluster remains, stopping early");
                    break;
                }
            }
        }

        info!(n_clusters = state.n_clusters, "fit finished");
        Ok(DipDeckFit {
            labels: state.labels,
            n_clusters: state.n_clusters,
            centers: state.centers,
            autoencoder,
        })
    }
}

impl Clustering for DipDeck {
    fn fit_predict(&mut self, data: &[Vec<f32>]) -> Result<Vec<usize>> {
        Ok(self.fit(data)?.labels)
    }

    fn n_clusters(&self) -> usize {
        // Discovered dynamically.
        0
    }
}

/// Row-normalized relationship weights: the dip matrix plus the identity,
/// each row divided by its sum. A point is pulled toward its own center
/// with the strength of the `1` on the diagonal and toward other centers in
/// proportion to how unimodal the joint projection looks.
fn relationship_weights(dip_matrix: &[Vec<f64>]) -> Vec<Vec<f32>> {
    dip_matrix
        .iter()
        .enumerate()
        .map(|(r, row)| {
            let sum: f64 = row.iter().sum::<f64>() + 1.0;
            row.iter()
                .enumerate()
                .map(|(c, &v)| {
                    let v = if r == c { v + 1.0 } else { v };
                    (v / sum) as f32
                })
                .collect()
        })
        .collect()
}

/// Relationship-weighted squared-distance sum of one batch, before the
/// loss-weight and scale factor are applied.
fn weighted_distance_sum(weights: &[Vec<f32>], labels: &[usize], sq_dists: &[Vec<f32>]) -> f32 {
    labels
        .iter()
        .zip(sq_dists)
        .map(|(&l, d)| weights[l].iter().zip(d).map(|(w, dist)| w * dist).sum::<f32>())
        .sum()
}

/// `(1 + std) / mean` of the pairwise distances between embedded centers.
/// The std term is dropped below three distances, where it is not
/// meaningful.
fn center_distance_scale(embedded_centers: &[Vec<f32>]) -> f32 {
    let k = embedded_centers.len();
    let mut dists = Vec::with_capacity(k * (k - 1) / 2);
    for i in 0..k.saturating_sub(1) {
        for j in i + 1..k {
            dists.push(squared_euclidean(&embedded_centers[i], &embedded_centers[j]).sqrt());
        }
    }
    if dists.is_empty() {
        return 1.0;
    }
    let mean = dists.iter().sum::<f32>() / dists.len() as f32;
    let std = if dists.len() < 3 {
        0.0
    } else {
        let var = dists.iter().map(|d| (d - mean) * (d - mean)).sum::<f32>() / dists.len() as f32;
        var.sqrt()
    };
    (1.0 + std) / mean
}
