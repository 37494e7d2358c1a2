//! Estimates the number of clusters in synthetic Gaussian-ish blobs.
//!
//! Run with logging to watch the merges happen:
//!
//! ```text
//! RUST_LOG=dipdeck=debug cargo run --example blobs
//! ```

use dipdeck::{DenseAutoencoder, DipDeck, DipDeckParams};
use rand::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Five blobs in 10-D; sums of uniforms give them a bell shape.
    let mut rng = StdRng::seed_from_u64(0);
    let centers: Vec<Vec<f32>> = (0..5)
        .map(|_| (0..10).map(|_| rng.random::<f32>() * 40.0).collect())
        .collect();
    let mut data = Vec::new();
    for center in &centers {
        for _ in 0..150 {
            data.push(
                center
                    .iter()
                    .map(|c| {
                        c + rng.random::<f32>() + rng.random::<f32>() + rng.random::<f32>() - 1.5
                    })
                    .collect(),
            );
        }
    }
    data.shuffle(&mut rng);

    let autoencoder = DenseAutoencoder::new(10, &[32, 16], 3, 0).expect("valid architecture");
    let mut estimator = DipDeck::new(DipDeckParams {
        n_clusters_start: 12,
        pretrain_epochs: 20,
        clustering_epochs: 10,
        batch_size: 128,
        seed: Some(0),
        ..Default::default()
    })
    .with_autoencoder(Box::new(autoencoder));

    let fit = estimator.fit(&data).expect("fit succeeds");
    println!("estimated {} clusters (true: 5)", fit.n_clusters);

    let mut sizes = vec![0usize; fit.n_clusters];
    for &l in &fit.labels {
        sizes[l] += 1;
    }
    for (c, size) in sizes.iter().enumerate() {
        println!("  cluster {c}: {size} points");
    }
}
