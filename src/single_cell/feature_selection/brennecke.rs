use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::regression::gamma_glm_identity;
use crate::core::base::stats::{calc_fdr, chisq_upper_tail, quantile};
use crate::core::data::expression::ExpressionMatrix;
use crate::core::errors::{Result, ScFeatError};
use crate::single_cell::feature_selection::{FeatureRow, FeatureTable, SelectionMethod};

/// Genes with a CV² above this define the mean quantile of the fit
const CV2_FOR_QUANTILE: f64 = 0.3;
/// Fewer technical rows above the mean cut-off trigger the fallback
const MIN_FIT_ROWS: usize = 20;
/// Fewer spike-ins than this are ignored
const MIN_SPIKES: usize = 2;

////////////////
// Structures //
////////////////

/// Parameters for the technical noise fit
///
/// ### Fields
///
/// * `fdr` - Genes with an adjusted p-value below this are selected.
/// * `min_biol_disp` - Minimum biological coefficient of variation a gene
///   needs to exceed.
/// * `fit_mean_quantile` - Quantile of the means of high CV² technical rows
///   above which rows are used for the fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrenneckeParams {
    pub fdr: f64,
    pub min_biol_disp: f64,
    pub fit_mean_quantile: f64,
}

impl Default for BrenneckeParams {
    fn default() -> Self {
        Self {
            fdr: 0.1,
            min_biol_disp: 0.5,
            fit_mean_quantile: 0.8,
        }
    }
}

/// Results of the technical noise fit
///
/// ### Fields
///
/// * `table` - The tested genes, sorted by effect size (descending).
/// * `a0` - Asymptotic CV² of the fitted curve.
/// * `a1` - Coefficient of `1 / mean` of the fitted curve.
/// * `min_mean_for_fit` - Mean cut-off for rows used in the fit.
/// * `means` - Mean of every row of the input.
/// * `cv2` - Squared coefficient of variation of every row of the input.
/// * `is_spike` - Was the row treated as technical (spike-in).
/// * `used_for_fit` - Was the row used to fit the curve.
#[derive(Clone, Debug)]
pub struct BrenneckeResult {
    pub table: FeatureTable,
    pub a0: f64,
    pub a1: f64,
    pub min_mean_for_fit: f64,
    pub means: Vec<f64>,
    pub cv2: Vec<f64>,
    pub is_spike: Vec<bool>,
    pub used_for_fit: Vec<bool>,
}

impl BrenneckeResult {
    /// Fitted technical CV² at a given mean
    #[inline]
    pub fn expected_cv2(&self, mean: f64) -> f64 {
        self.a0 + self.a1 / mean
    }
}

///////////////
// Functions //
///////////////

/// Identify highly variable genes against a technical noise fit
///
/// Fits `CV² = a0 + a1 / mean` with a gamma GLM over the technical rows
/// (spike-ins, or all genes if there are none) and tests every other gene
/// for a CV² above the technical curve plus `min_biol_disp`.
///
/// ### Params
///
/// * `matrix` - Normalised expression, genes x cells.
/// * `spikes` - Row indices of spike-ins. Empty (or a single spike-in) to use
///   all genes as the technical reference.
/// * `params` - The `BrenneckeParams`.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `BrenneckeResult`.
pub fn brennecke_get_variable_genes(
    matrix: &ExpressionMatrix,
    spikes: &[usize],
    params: &BrenneckeParams,
    verbose: bool,
) -> Result<BrenneckeResult> {
    let start = Instant::now();
    let n_cells = matrix.n_cells();
    if n_cells < 2 {
        return Err(ScFeatError::InsufficientData(
            "Variance estimation needs at least two cells".into(),
        ));
    }

    let spikes: &[usize] = if spikes.len() < MIN_SPIKES {
        if !spikes.is_empty() {
            warn!("A single spike-in cannot describe technical noise, using all genes instead");
        }
        &[]
    } else {
        spikes
    };

    let (means, vars) = matrix.gene_means_vars();
    let cv2: Vec<f64> = means
        .iter()
        .zip(vars.iter())
        .map(|(&m, &v)| if m > 0.0 { v / (m * m) } else { f64::NAN })
        .collect();

    let mut is_spike = vec![spikes.is_empty(); matrix.n_genes()];
    for &s in spikes {
        is_spike[s] = true;
    }
    let tested: Vec<usize> = (0..matrix.n_genes())
        .filter(|&i| spikes.is_empty() || !is_spike[i])
        .collect();

    // mean cut-off for the fit
    let high_cv2_means = |rows: &[usize]| -> Vec<f64> {
        rows.iter()
            .filter(|&&i| cv2[i] > CV2_FOR_QUANTILE)
            .map(|&i| means[i])
            .collect()
    };
    let tech_rows: Vec<usize> = (0..matrix.n_genes()).filter(|&i| is_spike[i]).collect();

    let fit_rows = |cut: f64| -> Vec<usize> {
        tech_rows
            .iter()
            .copied()
            .filter(|&i| means[i] >= cut && cv2[i] > 0.0 && cv2[i].is_finite())
            .collect()
    };

    let mut min_mean_for_fit =
        quantile(&high_cv2_means(&tech_rows), params.fit_mean_quantile).unwrap_or(f64::INFINITY);
    let mut use_for_fit = fit_rows(min_mean_for_fit);

    if use_for_fit.len() < MIN_FIT_ROWS {
        warn!(
            "Only {} technical rows exceed the mean cut-off, recomputing it over all genes",
            use_for_fit.len()
        );
        let all_rows: Vec<usize> = (0..matrix.n_genes()).collect();
        min_mean_for_fit = quantile(&high_cv2_means(&all_rows), 0.8).unwrap_or(f64::INFINITY);
        use_for_fit = fit_rows(min_mean_for_fit);
    }
    if use_for_fit.len() < 2 {
        return Err(ScFeatError::InsufficientData(format!(
            "Only {} rows available to fit the technical noise curve",
            use_for_fit.len()
        )));
    }

    let x: Vec<f64> = use_for_fit.iter().map(|&i| 1.0 / means[i]).collect();
    let y: Vec<f64> = use_for_fit.iter().map(|&i| cv2[i]).collect();
    let fit = gamma_glm_identity(&x, &y, 100, 1e-8)?;
    let (a0, a1) = (fit.intercept, fit.slope);

    // test
    let min_biol_disp = params.min_biol_disp * params.min_biol_disp;
    let m = n_cells as f64;
    let cv2th = a0 + min_biol_disp + a0 * min_biol_disp;

    let tested: Vec<usize> = tested.into_iter().filter(|&i| means[i] > 0.0).collect();
    let stats: Vec<f64> = tested
        .iter()
        .map(|&i| {
            let mu = means[i];
            let denom = (mu * a1 + mu * mu * cv2th) / (1.0 + cv2th / m);
            vars[i] * (m - 1.0) / denom
        })
        .collect();
    let pvals = chisq_upper_tail(&stats, m - 1.0)?;
    let qvals = calc_fdr(&pvals);

    let mut rows: Vec<FeatureRow> = tested
        .iter()
        .enumerate()
        .map(|(k, &i)| FeatureRow {
            gene: matrix.gene_names[i].clone(),
            gene_idx: i,
            effect_size: cv2[i] / (a0 + a1 / means[i]),
            p_value: Some(pvals[k]),
            q_value: Some(qvals[k]),
            selected: qvals[k] < params.fdr,
        })
        .collect();
    rows.sort_by(|a, b| b.effect_size.total_cmp(&a.effect_size));

    let mut used_flags = vec![false; matrix.n_genes()];
    for &i in &use_for_fit {
        used_flags[i] = true;
    }

    if verbose {
        info!(
            "Technical noise fit a0 = {:.4}, a1 = {:.4} on {} rows; {} of {} genes selected in {:.2?}",
            a0,
            a1,
            use_for_fit.len(),
            rows.iter().filter(|r| r.selected).count(),
            rows.len(),
            start.elapsed()
        );
    }

    Ok(BrenneckeResult {
        table: FeatureTable::new(SelectionMethod::Brennecke, rows),
        a0,
        a1,
        min_mean_for_fit,
        means,
        cv2,
        is_spike,
        used_for_fit: used_flags,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_sc_counts;
    use faer::Mat;
    use rand::prelude::*;
    use rand_distr::{Distribution, Poisson};

    /// Poisson technical genes over a wide range of means plus ten on/off
    /// genes at the end
    fn noisy_matrix() -> ExpressionMatrix {
        let n_cells = 100;
        let n_tech = 300;
        let mut rng = StdRng::seed_from_u64(123);
        let values = Mat::from_fn(n_tech + 10, n_cells, |i, j| {
            if i >= n_tech {
                if j % 2 == 0 {
                    40.0
                } else {
                    0.0
                }
            } else {
                let mean = 0.5 * (1000.0_f64).powf(i as f64 / (n_tech - 1) as f64);
                Poisson::new(mean).unwrap().sample(&mut rng)
            }
        });
        ExpressionMatrix::from_values(values)
    }

    #[test]
    fn test_brennecke_detects_bimodal_genes() {
        let m = noisy_matrix();
        let res = brennecke_get_variable_genes(&m, &[], &BrenneckeParams::default(), false)
            .unwrap();

        assert_eq!(res.table.len(), 310);
        let selected = res.table.selected_genes();
        for i in 300..310 {
            assert!(selected.contains(&format!("gene_{}", i)), "gene_{} missing", i);
        }
        // the on/off genes have the largest effect sizes
        let top: Vec<String> = res.table.top_n(5);
        assert!(top.iter().all(|g| {
            let idx: usize = g.trim_start_matches("gene_").parse().unwrap();
            idx >= 300
        }));
        assert!(selected.len() < 30, "{} genes selected", selected.len());
        // effect sizes sorted descending
        assert!(res
            .table
            .rows
            .windows(2)
            .all(|w| w[0].effect_size >= w[1].effect_size));
    }

    #[test]
    fn test_brennecke_with_spikes() {
        let data = generate_sc_counts(300, 80, 2, 0.1, 3).unwrap();
        let spikes: Vec<usize> = (0..60).collect();
        let res = brennecke_get_variable_genes(
            &data.counts,
            &spikes,
            &BrenneckeParams::default(),
            false,
        )
        .unwrap();
        // spike rows are not tested
        assert!(res.table.rows.iter().all(|r| r.gene_idx >= 60));
        assert!(res.is_spike[0] && !res.is_spike[100]);
        assert!(res.used_for_fit.iter().filter(|&&u| u).count() >= 2);
        assert!(res.expected_cv2(10.0).is_finite());
    }

    #[test]
    fn test_brennecke_single_spike_uses_all_genes() {
        let m = noisy_matrix();
        let params = BrenneckeParams::default();
        let all = brennecke_get_variable_genes(&m, &[], &params, false).unwrap();
        let single = brennecke_get_variable_genes(&m, &[5], &params, false).unwrap();

        assert_eq!(single.table.len(), 310);
        assert!(single.is_spike.iter().all(|&s| s));
        assert!((single.a0 - all.a0).abs() < 1e-12);
        assert!((single.a1 - all.a1).abs() < 1e-12);
        assert_eq!(single.table.selected_genes(), all.table.selected_genes());
    }

    #[test]
    fn test_brennecke_needs_cells() {
        let m = ExpressionMatrix::from_values(Mat::from_fn(5, 1, |i, _| i as f64));
        assert!(brennecke_get_variable_genes(&m, &[], &BrenneckeParams::default(), false).is_err());
    }
}
