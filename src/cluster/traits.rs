use crate::error::Result;

/// Common interface for hard clustering algorithms (one label per point).
pub trait Clustering {
    /// Fit the model and return one cluster label per input point.
    ///
    /// Takes `&mut self` because estimators may carry trainable state (for
    /// example an autoencoder being fitted alongside the clustering).
    fn fit_predict(&mut self, data: &[Vec<f32>]) -> Result<Vec<usize>>;

    /// The configured number of clusters (if applicable).
    ///
    /// For algorithms that discover the number of clusters dynamically,
    /// this returns 0.
    fn n_clusters(&self) -> usize;
}
