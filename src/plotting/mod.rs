//! PNG rendering of the diagnostic scatter plots and expression heatmaps.

pub mod backend;
pub mod colour;
pub mod heatmap;
pub mod scatter;
