//! End to end run of all feature selection methods on one data set.

pub mod config;
pub mod pipeline;

pub use config::WorkflowConfig;
pub use pipeline::{run_on_matrix, run_workflow, WorkflowInputs, WorkflowSummary};
