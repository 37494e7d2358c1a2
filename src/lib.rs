//! Deep embedded clustering with automatic cluster-count estimation.
//!
//! `dipdeck` implements the DipDECK algorithm: an autoencoder is trained
//! jointly with a clustering objective while Hartigan's dip test decides,
//! pair by pair, which clusters are really one and should be merged. The
//! caller supplies an upper guess for the number of clusters; the final
//! count is estimated from the data.
//!
//! The primary public API is under [`cluster`], which provides:
//! - DipDECK (the main estimator, [`DipDeck`])
//! - k-means (k-means++ seeding, Lloyd iterations; also serves as
//!   DipDECK's default initializer)
//!
//! Supporting modules: [`dip`] (the dip statistic and its p-value) and
//! [`net`] (the autoencoder trait and a built-in dense implementation).

#![forbid(unsafe_code)]

pub mod cluster;
pub mod dip;
pub mod error;
pub mod net;

pub use cluster::{
    Clustering, DipDeck, DipDeckFit, DipDeckParams, InitialClusterer, Kmeans, KmeansFit,
    KmeansInit,
};
pub use dip::{TableDipTest, UnimodalityTest};
pub use error::{Error, Result};
pub use net::{Autoencoder, DenseAutoencoder};
