//! Single cell specific functionality: cleaning and normalisation, the
//! feature selection methods, the Kruskal-Wallis DE reference and the
//! evaluation of a selection against it.

pub mod dge;
pub mod evaluation;
pub mod feature_selection;
pub mod processing;
