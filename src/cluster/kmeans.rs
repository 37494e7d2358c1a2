//! K-means clustering with k-means++ seeding and Lloyd iterations.
//!
//! The classic algorithm: assign each point to the nearest centroid, update
//! centroids to the mean of their points, repeat until the centroids stop
//! moving (or `max_iter` is reached).
//!
//! Seeding follows k-means++ (Arthur & Vassilvitskii, 2007): the first
//! centroid is a uniformly random point, each further centroid is drawn with
//! probability proportional to its squared distance from the nearest
//! already-chosen centroid.
//!
//! Inside this crate k-means provides the initial over-clustering for the
//! DipDECK estimator; it is also usable on its own through [`Clustering`].

use super::traits::Clustering;
use super::util::{argmin, squared_euclidean};
use crate::error::{Error, Result};
use rand::prelude::*;

/// K-means clustering algorithm.
#[derive(Debug, Clone)]
pub struct Kmeans {
    k: usize,
    max_iter: usize,
    tol: f32,
    seed: Option<u64>,
}

/// Result of a k-means fit.
#[derive(Debug, Clone)]
pub struct KmeansFit {
    /// One cluster label per input point, in `[0, k)`.
    pub labels: Vec<usize>,
    /// Final centroids (synthetic means, not data points).
    pub centroids: Vec<Vec<f32>>,
    /// Sum of squared distances of points to their assigned centroid.
    pub inertia: f32,
    /// Number of Lloyd iterations performed.
    pub iterations: usize,
}

impl Kmeans {
    /// Create a new k-means clusterer with `k` clusters.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            max_iter: 100,
            tol: 1e-4,
            seed: None,
        }
    }

    /// Set the maximum number of Lloyd iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set the centroid-movement tolerance used to detect convergence.
    pub fn with_tol(mut self, tol: f32) -> Self {
        self.tol = tol;
        self
    }

    /// Set the RNG seed for reproducible seeding.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Fit the model and return labels, centroids and fit statistics.
    pub fn fit(&self, data: &[Vec<f32>]) -> Result<KmeansFit> {
        let n = data.len();
        if n == 0 {
            return Err(Error::EmptyInput);
        }
        if self.k == 0 {
            return Err(Error::InvalidParameter {
                name: "k",
                message: "must be at least 1",
            });
        }
        if self.k > n {
            return Err(Error::InvalidClusterCount {
                requested: self.k,
                n_items: n,
            });
        }
        let dim = data[0].len();
        for row in data {
            if row.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    found: row.len(),
                });
            }
        }

        let mut rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };
        let mut centroids = Self::plus_plus_seeds(data, self.k, &mut rng);
        let mut labels = vec![0usize; n];
        let mut iterations = 0;

        for iter in 0..self.max_iter {
            iterations = iter + 1;

            // Assignment step.
            for (l, point) in labels.iter_mut().zip(data) {
                *l = argmin(centroids.iter().map(|c| squared_euclidean(c, point)));
            }

            // Update step.
            let mut sums = vec![vec![0.0f32; dim]; self.k];
            let mut counts = vec![0usize; self.k];
            for (&l, point) in labels.iter().zip(data) {
                counts[l] += 1;
                for (s, x) in sums[l].iter_mut().zip(point) {
                    *s += x;
                }
            }

            let mut shift = 0.0f32;
            for (c, (sum, &count)) in centroids.iter_mut().zip(sums.iter().zip(&counts)) {
                if count == 0 {
                    // Re-seed an empty cluster from the point farthest from
                    // its current centroid assignment.
                    let far = Self::farthest_point(data, c);
                    shift += squared_euclidean(c, &data[far]).sqrt();
                    c.clone_from(&data[far]);
                    continue;
                }
                let new: Vec<f32> = sum.iter().map(|s| s / count as f32).collect();
                shift += squared_euclidean(c, &new).sqrt();
                *c = new;
            }

            if shift <= self.tol {
                break;
            }
        }

        // Final assignment with the converged centroids.
        let mut inertia = 0.0f32;
        for (l, point) in labels.iter_mut().zip(data) {
            *l = argmin(centroids.iter().map(|c| squared_euclidean(c, point)));
            inertia += squared_euclidean(&centroids[*l], point);
        }

        Ok(KmeansFit {
            labels,
            centroids,
            inertia,
            iterations,
        })
    }

    fn plus_plus_seeds(data: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
        let n = data.len();
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
        centroids.push(data[rng.random_range(0..n)].clone());

        let mut dist2: Vec<f32> = data
            .iter()
            .map(|p| squared_euclidean(p, &centroids[0]))
            .collect();
        while centroids.len() < k {
            let total: f32 = dist2.iter().sum();
            let pick = if total > 0.0 {
                // Sample proportional to squared distance.
                let mut target = rng.random::<f32>() * total;
                let mut chosen = n - 1;
                for (i, &d) in dist2.iter().enumerate() {
                    target -= d;
                    if target <= 0.0 {
                        chosen = i;
                        break;
                    }
                }
                chosen
            } else {
                // All remaining points coincide with a centroid.
                rng.random_range(0..n)
            };
            centroids.push(data[pick].clone());
            for (d, p) in dist2.iter_mut().zip(data) {
                let nd = squared_euclidean(p, &centroids[centroids.len() - 1]);
                if nd < *d {
                    *d = nd;
                }
            }
        }
        centroids
    }

    fn farthest_point(data: &[Vec<f32>], from: &[f32]) -> usize {
        let mut best = 0;
        let mut best_d = -1.0f32;
        for (i, point) in data.iter().enumerate() {
            let d = squared_euclidean(point, from);
            if d > best_d {
                best_d = d;
                best = i;
            }
        }
        best
    }
}

impl Clustering for Kmeans {
    fn fit_predict(&mut self, data: &[Vec<f32>]) -> Result<Vec<usize>> {
        Ok(self.fit(data)?.labels)
    }

    fn n_clusters(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<Vec<f32>> {
        let mut data = Vec::new();
        for i in 0..10 {
            data.push(vec![i as f32 * 0.01, i as f32 * 0.02]);
        }
        for i in 0..10 {
            data.push(vec![8.0 + i as f32 * 0.01, 8.0 + i as f32 * 0.02]);
        }
        data
    }

    #[test]
    fn test_kmeans_two_blobs() {
        let fit = Kmeans::new(2).with_seed(42).fit(&two_blobs()).unwrap();
        assert_eq!(fit.labels.len(), 20);
        assert_eq!(fit.centroids.len(), 2);
        let first = fit.labels[0];
        assert!(fit.labels[..10].iter().all(|&l| l == first));
        let second = fit.labels[10];
        assert!(fit.labels[10..].iter().all(|&l| l == second));
        assert_ne!(first, second);
    }

    #[test]
    fn test_kmeans_k_equals_n() {
        let data = vec![vec![0.0], vec![1.0], vec![2.0]];
        let fit = Kmeans::new(3).with_seed(1).fit(&data).unwrap();
        let mut sorted = fit.labels.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn test_kmeans_invalid() {
        let data = vec![vec![0.0], vec![1.0]];
        assert!(Kmeans::new(0).fit(&data).is_err());
        assert!(Kmeans::new(3).fit(&data).is_err());
        assert!(Kmeans::new(1).fit(&[]).is_err());
        let ragged = vec![vec![0.0, 1.0], vec![2.0]];
        assert!(Kmeans::new(1).fit(&ragged).is_err());
    }

    #[test]
    fn test_kmeans_labels_in_range() {
        let data = two_blobs();
        let labels = Kmeans::new(4).with_seed(7).fit_predict(&data).unwrap();
        assert!(labels.iter().all(|&l| l < 4));
    }
}
