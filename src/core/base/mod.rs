//! Module containing key statistic functions that include correlations,
//! multiple testing, quantiles, PCA/SVD and small regression models.

pub mod cors_similarity;
pub mod pca_svd;
pub mod regression;
pub mod stats;
pub mod utils;
