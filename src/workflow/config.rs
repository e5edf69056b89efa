//! Configuration of a complete feature selection run.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::core::base::stats::parse_multiple_testing;
use crate::core::errors::{Result, ScFeatError};
use crate::single_cell::feature_selection::brennecke::BrenneckeParams;
use crate::single_cell::feature_selection::correlation::{parse_cor_direction, CorrelationParams};
use crate::single_cell::feature_selection::m3drop::M3DropParams;
use crate::single_cell::feature_selection::nbumi::NbumiParams;
use crate::single_cell::feature_selection::pca::PcaParams;
use crate::single_cell::processing::CleanParams;

/// Settings of a workflow run
///
/// Every field has a default, so a JSON file only needs the values that
/// differ.
///
/// ### Fields
///
/// * `clean` - The `CleanParams`.
/// * `brennecke` - The `BrenneckeParams`.
/// * `m3drop` - The `M3DropParams`.
/// * `nbumi` - The `NbumiParams`.
/// * `correlation` - The `CorrelationParams`.
/// * `pca` - The `PcaParams`.
/// * `top_n` - Number of genes taken from the score-only methods
///   (correlation, PCA, NBumi high variance) and shown in heatmaps.
/// * `seed` - Seed for everything random.
/// * `de_threshold` - q-value threshold for the reference DE genes.
/// * `plots` - Write PNG plots.
/// * `verbose` - Controls verbosity of the run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub clean: CleanParams,
    pub brennecke: BrenneckeParams,
    pub m3drop: M3DropParams,
    pub nbumi: NbumiParams,
    pub correlation: CorrelationParams,
    pub pca: PcaParams,
    pub top_n: usize,
    pub seed: u64,
    pub de_threshold: f64,
    pub plots: bool,
    pub verbose: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            clean: CleanParams::default(),
            brennecke: BrenneckeParams::default(),
            m3drop: M3DropParams::default(),
            nbumi: NbumiParams::default(),
            correlation: CorrelationParams::default(),
            pca: PcaParams::default(),
            top_n: 1500,
            seed: 42,
            de_threshold: 0.05,
            plots: true,
            verbose: false,
        }
    }
}

/// Check that a value is a proportion in `(0, 1]`
fn check_unit(name: &str, v: f64) -> Result<()> {
    if v > 0.0 && v <= 1.0 {
        Ok(())
    } else {
        Err(ScFeatError::InvalidParameter(format!(
            "{} must be in (0, 1], got {}",
            name, v
        )))
    }
}

impl WorkflowConfig {
    /// Load the configuration from a JSON file
    ///
    /// ### Params
    ///
    /// * `path` - Path to the JSON file.
    ///
    /// ### Returns
    ///
    /// The validated `WorkflowConfig`.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out of range values and unknown method names
    pub fn validate(&self) -> Result<()> {
        check_unit("brennecke.fdr", self.brennecke.fdr)?;
        check_unit("brennecke.fit_mean_quantile", self.brennecke.fit_mean_quantile)?;
        if self.brennecke.min_biol_disp.is_nan() || self.brennecke.min_biol_disp < 0.0 {
            return Err(ScFeatError::InvalidParameter(format!(
                "brennecke.min_biol_disp must be non-negative, got {}",
                self.brennecke.min_biol_disp
            )));
        }
        check_unit("m3drop.mt_threshold", self.m3drop.mt_threshold)?;
        check_unit("nbumi.qval_threshold", self.nbumi.qval_threshold)?;
        check_unit("de_threshold", self.de_threshold)?;
        if let Some(fdr) = self.correlation.fdr {
            check_unit("correlation.fdr", fdr)?;
        }

        for (name, method) in [
            ("m3drop.mt_method", &self.m3drop.mt_method),
            ("nbumi.mt_method", &self.nbumi.mt_method),
        ] {
            if parse_multiple_testing(method).is_none() {
                return Err(ScFeatError::InvalidParameter(format!(
                    "{}: unknown multiple testing method '{}'",
                    name, method
                )));
            }
        }
        if parse_cor_direction(&self.correlation.direction).is_none() {
            return Err(ScFeatError::InvalidParameter(format!(
                "correlation.direction: unknown direction '{}'",
                self.correlation.direction
            )));
        }
        if self.pca.pcs.is_empty() || self.pca.pcs.contains(&0) {
            return Err(ScFeatError::InvalidParameter(
                "pca.pcs must be a non-empty list of 1-based components".into(),
            ));
        }
        if self.top_n == 0 {
            return Err(ScFeatError::InvalidParameter(
                "top_n must be at least 1".into(),
            ));
        }
        if self.nbumi.ntop == Some(0) {
            return Err(ScFeatError::InvalidParameter(
                "nbumi.ntop must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

///////////
// Tests //
///////////
