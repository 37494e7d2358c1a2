//! Clustering algorithms for grouping similar items.
//!
//! The centerpiece is [`DipDeck`], a deep embedded clustering estimator
//! that does not need the number of clusters up front: it starts from an
//! overclustered k-means solution in the embedding space of an autoencoder
//! and merges cluster pairs whose joint projection passes Hartigan's dip
//! test of unimodality, retraining the embedding after every merge.
//!
//! ## Algorithms
//!
//! ### DipDECK
//!
//! Joint optimization of
//!
//! ```text
//! L = L_reconstruction + w * L_cluster
//! ```
//!
//! where the cluster term pulls each embedded point toward its own center
//! and, weighted by dip p-values, toward the centers of clusters it might
//! belong to just as well. The cluster count falls monotonically from
//! `n_clusters_start` as merges fire; it never increases.
//!
//! **When to use**: you have dense vectors, expect compact clusters, and
//! do not know how many there are.
//!
//! ### K-means
//!
//! The classic algorithm with k-means++ seeding: assign each point to the
//! nearest centroid, update centroids to the mean of their points, repeat.
//! Used internally for DipDECK's overclustered start, and useful on its
//! own when you know k.
//!
//! ## Usage
//!
//! ```rust
//! use dipdeck::cluster::{Clustering, Kmeans};
//!
//! let data = vec![
//!     vec![0.0, 0.0],
//!     vec![0.1, 0.1],
//!     vec![10.0, 10.0],
//!     vec![10.1, 10.1],
//! ];
//!
//! let labels = Kmeans::new(2).fit_predict(&data).unwrap();
//! assert_eq!(labels[0], labels[1]);  // First two together
//! assert_ne!(labels[0], labels[2]);  // Separate from last two
//! ```

mod dipdeck;
mod kmeans;
mod state;
mod traits;
mod util;

pub use dipdeck::{DipDeck, DipDeckFit, DipDeckParams, InitialClusterer, KmeansInit};
pub use kmeans::{Kmeans, KmeansFit};
pub use traits::Clustering;
