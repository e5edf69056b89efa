//! Unsupervised feature selection for single cell RNA-seq data.
//!
//! Loads an expression matrix, cleans and normalises it, ranks the genes
//! with several label-free methods (technical noise fit, dropout models,
//! gene-gene correlation, PCA loadings), compares the selections against a
//! reference set of differentially expressed genes and renders diagnostic
//! plots.

pub mod core;
pub mod plotting;
pub mod single_cell;
pub mod utils;
pub mod workflow;

#[cfg(feature = "r")]
pub mod r_bindings;

#[cfg(feature = "r")]
use extendr_api::prelude::*;

#[cfg(feature = "r")]
pub use r_bindings::r_feature_selection;

#[cfg(feature = "r")]
extendr_module! {
    mod scfeatsel;
    use r_feature_selection;
}
