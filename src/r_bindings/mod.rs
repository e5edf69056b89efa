//! R interface to the feature selection methods, built with the `r`
//! feature.

pub mod r_feature_selection;
