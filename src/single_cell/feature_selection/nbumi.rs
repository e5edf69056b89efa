use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::regression::{ols_line, LineFit};
use crate::core::base::stats::{normal_upper_tail, p_adjust, parse_multiple_testing};
use crate::core::data::expression::ExpressionMatrix;
use crate::core::errors::{Result, ScFeatError};
use crate::single_cell::feature_selection::{FeatureRow, FeatureTable, SelectionMethod};

/// Sizes are floored at this value
const MIN_SIZE: f64 = 1e-10;
/// With more genes than this above the mean cut-off only those are used for
/// the dispersion fit
const MAX_LOW_MEAN_GENES: usize = 2000;
/// log2 mean cut-off for the dispersion fit
const LOG2_MEAN_CUTOFF: f64 = 4.0;

////////////////
// Structures //
////////////////

/// Parameters for the depth adjusted negative binomial selection
///
/// ### Fields
///
/// * `mt_method` - Multiple testing correction, one of `"bon"`, `"holm"`,
///   `"fdr"` or `"none"`.
/// * `qval_threshold` - Genes with an adjusted p-value below this are
///   selected (if `ntop` is not given).
/// * `ntop` - If given, exactly the `ntop` best genes are selected.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NbumiParams {
    pub mt_method: String,
    pub qval_threshold: f64,
    pub ntop: Option<usize>,
}

impl Default for NbumiParams {
    fn default() -> Self {
        Self {
            mt_method: "fdr".to_string(),
            qval_threshold: 0.05,
            ntop: None,
        }
    }
}

/// Depth adjusted negative binomial fit
///
/// ### Fields
///
/// * `gene_idx` - Rows of the input with a non-zero total.
/// * `gene_names` - Names of these genes.
/// * `tjs` - Total counts per gene.
/// * `tis` - Total counts per cell.
/// * `total` - Total counts.
/// * `djs` - Observed zeros per gene.
/// * `dis` - Observed zeros per cell.
/// * `var_obs` - Variance of each gene around its depth adjusted mean.
/// * `sizes` - Negative binomial size of each gene.
#[derive(Clone, Debug)]
pub struct NbumiFit {
    pub gene_idx: Vec<usize>,
    pub gene_names: Vec<String>,
    pub tjs: Vec<f64>,
    pub tis: Vec<f64>,
    pub total: f64,
    pub djs: Vec<f64>,
    pub dis: Vec<f64>,
    pub var_obs: Vec<f64>,
    pub sizes: Vec<f64>,
}

impl NbumiFit {
    /// Number of genes in the fit
    pub fn n_genes(&self) -> usize {
        self.tjs.len()
    }

    /// Number of cells in the fit
    pub fn n_cells(&self) -> usize {
        self.tis.len()
    }

    /// Mean count of every gene
    pub fn means(&self) -> Vec<f64> {
        let nc = self.n_cells() as f64;
        self.tjs.iter().map(|t| t / nc).collect()
    }

    /// Depth adjusted mean of gene `j` in cell `i`
    #[inline]
    fn mu(&self, j: usize, i: usize) -> f64 {
        self.tjs[j] * self.tis[i] / self.total
    }
}

/// Expected and observed dropout rates per gene
///
/// ### Fields
///
/// * `expected` - Expected dropout rate under the smoothed size.
/// * `expected_err` - Standard error of the expected rate.
/// * `observed` - Observed dropout rate.
/// * `observed_err` - Binomial standard error of the observed rate.
#[derive(Clone, Debug)]
pub struct DropoutComparison {
    pub expected: Vec<f64>,
    pub expected_err: Vec<f64>,
    pub observed: Vec<f64>,
    pub observed_err: Vec<f64>,
}

/// Goodness of fit of the per gene model
///
/// ### Fields
///
/// * `gene_error` - Sum of squared differences of expected and observed
///   zeros per gene.
/// * `cell_error` - Same for the zeros per cell.
/// * `row_ps` - Expected zeros per gene.
/// * `col_ps` - Expected zeros per cell.
#[derive(Clone, Debug)]
pub struct NbumiCheck {
    pub gene_error: f64,
    pub cell_error: f64,
    pub row_ps: Vec<f64>,
    pub col_ps: Vec<f64>,
}

/////////////
// Helpers //
/////////////

/// Zero probability of a negative binomial with mean `mu` and `size`
#[inline]
fn nb_zero_prob(mu: f64, size: f64) -> f64 {
    (1.0 + mu / size).powf(-size)
}

///////////////
// Functions //
///////////////

/// Fit the depth adjusted negative binomial model
///
/// Every gene gets a size parameter from the method of moments around the
/// depth adjusted means `mu_ij = t_j * t_i / T`. Genes without any counts
/// are removed.
///
/// ### Params
///
/// * `counts` - Raw counts, genes x cells.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `NbumiFit`.
pub fn fit_nbumi(counts: &ExpressionMatrix, verbose: bool) -> Result<NbumiFit> {
    let start = Instant::now();
    if !counts.is_counts() {
        return Err(ScFeatError::NotCounts(
            "the negative binomial model requires raw integer counts".into(),
        ));
    }
    if counts.n_cells() < 2 {
        return Err(ScFeatError::InsufficientData(
            "the negative binomial model needs at least two cells".into(),
        ));
    }

    let gene_totals = counts.gene_totals();
    let gene_idx: Vec<usize> = (0..counts.n_genes())
        .filter(|&j| gene_totals[j] > 0.0)
        .collect();
    if gene_idx.len() < counts.n_genes() {
        warn!(
            "Removing {} undetected genes",
            counts.n_genes() - gene_idx.len()
        );
    }
    if gene_idx.len() < 2 {
        return Err(ScFeatError::InsufficientData(
            "fewer than two detected genes".into(),
        ));
    }

    let sub = counts.subset_genes(&gene_idx);
    let m = sub.view();
    let tjs = sub.gene_totals();
    let tis = sub.library_sizes();
    let total: f64 = tjs.iter().sum();
    let nc = sub.n_cells() as f64;

    let djs: Vec<f64> = (0..sub.n_genes())
        .into_par_iter()
        .map(|j| m.row(j).iter().filter(|&&v| v <= 0.0).count() as f64)
        .collect();
    let dis: Vec<f64> = m
        .par_col_iter()
        .map(|col| col.iter().filter(|&&v| v <= 0.0).count() as f64)
        .collect();

    let var_obs: Vec<f64> = (0..sub.n_genes())
        .into_par_iter()
        .map(|j| {
            m.row(j)
                .iter()
                .zip(tis.iter())
                .map(|(&x, &ti)| {
                    let mu = tjs[j] * ti / total;
                    (x - mu).powi(2)
                })
                .sum::<f64>()
                / (nc - 1.0)
        })
        .collect();

    let sum_ti_sq: f64 = tis.iter().map(|t| t * t).sum::<f64>() / (total * total);
    let raw_sizes: Vec<f64> = tjs
        .iter()
        .zip(var_obs.iter())
        .map(|(&tj, &v)| tj * tj * sum_ti_sq / ((nc - 1.0) * v - tj))
        .collect();

    let max_valid = raw_sizes
        .iter()
        .copied()
        .filter(|s| s.is_finite() && *s > 0.0)
        .fold(f64::NEG_INFINITY, f64::max);
    let max_size = if max_valid.is_finite() {
        10.0 * max_valid
    } else {
        1.0 / MIN_SIZE
    };
    let sizes: Vec<f64> = raw_sizes
        .iter()
        .map(|&s| {
            let s = if !s.is_finite() || s <= 0.0 { max_size } else { s };
            s.max(MIN_SIZE)
        })
        .collect();

    if verbose {
        info!(
            "Fitted depth adjusted negative binomial to {} genes x {} cells in {:.2?}",
            sub.n_genes(),
            sub.n_cells(),
            start.elapsed()
        );
    }

    Ok(NbumiFit {
        gene_idx,
        gene_names: sub.gene_names,
        tjs,
        tis,
        total,
        djs,
        dis,
        var_obs,
        sizes,
    })
}

/// Fit the relationship of size and mean expression
///
/// Ordinary least squares of `ln(size)` on `ln(mean)` over genes with a
/// size below the maximum. If more than 2000 of all genes have a log2 mean
/// above 4, the fit is restricted to those.
///
/// ### Params
///
/// * `fit` - The `NbumiFit`.
///
/// ### Returns
///
/// The `LineFit` with intercept and slope on the natural log scale.
pub fn fit_dispersion_vs_mean(fit: &NbumiFit) -> Result<LineFit> {
    let means = fit.means();
    let max_size = fit.sizes.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let is_higher: Vec<bool> = means.iter().map(|m| m.log2() > LOG2_MEAN_CUTOFF).collect();
    let restrict = is_higher.iter().filter(|&&h| h).count() > MAX_LOW_MEAN_GENES;

    let for_fit: Vec<usize> = (0..fit.n_genes())
        .filter(|&j| fit.sizes[j] < max_size && fit.sizes[j] > 0.0 && means[j] > 0.0)
        .filter(|&j| !restrict || is_higher[j])
        .collect();

    let x: Vec<f64> = for_fit.iter().map(|&j| means[j].ln()).collect();
    let y: Vec<f64> = for_fit.iter().map(|&j| fit.sizes[j].ln()).collect();

    ols_line(&x, &y)
}

/// Expected size of every gene from the smoothed size-mean relationship
fn expected_sizes(fit: &NbumiFit, disp: &LineFit) -> Vec<f64> {
    fit.means()
        .iter()
        .map(|m| disp.predict(m.ln()).exp())
        .collect()
}

/// Compare observed dropouts with those expected under the smoothed sizes
///
/// ### Params
///
/// * `fit` - The `NbumiFit`.
/// * `disp` - The size-mean relationship from `fit_dispersion_vs_mean`.
///
/// ### Returns
///
/// The `DropoutComparison`.
pub fn compare_dropouts(fit: &NbumiFit, disp: &LineFit) -> DropoutComparison {
    let nc = fit.n_cells() as f64;
    let exp_size = expected_sizes(fit, disp);

    let (expected, expected_err): (Vec<f64>, Vec<f64>) = (0..fit.n_genes())
        .into_par_iter()
        .map(|j| {
            let (mut sum_p, mut sum_var) = (0.0, 0.0);
            for i in 0..fit.n_cells() {
                let p = nb_zero_prob(fit.mu(j, i), exp_size[j]);
                sum_p += p;
                sum_var += p * (1.0 - p);
            }
            ((sum_p / nc).max(1.0 / nc), (sum_var / (nc * nc)).sqrt())
        })
        .unzip();

    let observed: Vec<f64> = fit.djs.iter().map(|d| d / nc).collect();
    let observed_err: Vec<f64> = observed
        .iter()
        .map(|p| (p * (1.0 - p) / nc).sqrt())
        .collect();

    DropoutComparison {
        expected,
        expected_err,
        observed,
        observed_err,
    }
}

/// Select genes with more dropouts than the depth adjusted model expects
///
/// ### Params
///
/// * `fit` - The `NbumiFit`.
/// * `ntop` - If given, the number of best genes to select.
/// * `mt_method` - Multiple testing correction.
/// * `qval_threshold` - Threshold on the adjusted p-values if `ntop` is not
///   given.
///
/// ### Returns
///
/// The `FeatureTable`, sorted by p-value and then by the difference of
/// observed and expected dropout rate.
pub fn combined_drop_selection(
    fit: &NbumiFit,
    ntop: Option<usize>,
    mt_method: &str,
    qval_threshold: f64,
) -> Result<FeatureTable> {
    let method = parse_multiple_testing(mt_method).ok_or_else(|| {
        ScFeatError::InvalidParameter(format!("Unknown multiple testing method '{}'", mt_method))
    })?;

    let disp = fit_dispersion_vs_mean(fit)?;
    let cmp = compare_dropouts(fit, &disp);

    let diff: Vec<f64> = cmp
        .observed
        .iter()
        .zip(cmp.expected.iter())
        .map(|(o, e)| o - e)
        .collect();
    let pvals: Vec<f64> = (0..fit.n_genes())
        .map(|j| {
            let err = (cmp.expected_err[j].powi(2) + cmp.observed_err[j].powi(2)).sqrt();
            let z = diff[j] / err;
            if z.is_nan() {
                1.0
            } else {
                normal_upper_tail(z)
            }
        })
        .collect();

    let mut order: Vec<usize> = (0..fit.n_genes()).collect();
    order.sort_by(|&a, &b| {
        pvals[a]
            .total_cmp(&pvals[b])
            .then_with(|| diff[b].total_cmp(&diff[a]))
    });

    let ordered_p: Vec<f64> = order.iter().map(|&j| pvals[j]).collect();
    let qvals = p_adjust(&ordered_p, method);

    let rows: Vec<FeatureRow> = order
        .iter()
        .enumerate()
        .map(|(rank, &j)| FeatureRow {
            gene: fit.gene_names[j].clone(),
            gene_idx: fit.gene_idx[j],
            effect_size: diff[j],
            p_value: Some(pvals[j]),
            q_value: Some(qvals[rank]),
            selected: match ntop {
                Some(n) => rank < n,
                None => qvals[rank] < qval_threshold,
            },
        })
        .collect();

    Ok(FeatureTable::new(SelectionMethod::NbumiDrop, rows))
}

/// Rank genes by over-dispersion relative to the size-mean relationship
///
/// ### Params
///
/// * `fit` - The `NbumiFit`.
/// * `ntop` - If given, the number of best genes to mark as selected.
///
/// ### Returns
///
/// The `FeatureTable` sorted by the residual `ln(size) - ln(expected size)`
/// in ascending order, i.e. the most over-dispersed genes first.
pub fn high_var_selection(fit: &NbumiFit, ntop: Option<usize>) -> Result<FeatureTable> {
    let disp = fit_dispersion_vs_mean(fit)?;
    let exp_size = expected_sizes(fit, &disp);

    let mut rows: Vec<FeatureRow> = (0..fit.n_genes())
        .map(|j| FeatureRow {
            gene: fit.gene_names[j].clone(),
            gene_idx: fit.gene_idx[j],
            effect_size: fit.sizes[j].ln() - exp_size[j].ln(),
            p_value: None,
            q_value: None,
            selected: false,
        })
        .collect();
    rows.sort_by(|a, b| a.effect_size.total_cmp(&b.effect_size));

    let mut table = FeatureTable::new(SelectionMethod::NbumiHighVar, rows);
    if let Some(n) = ntop {
        table.select_top(n);
    }
    Ok(table)
}

/// Check the per gene negative binomial fit against the observed zeros
///
/// ### Params
///
/// * `fit` - The `NbumiFit`.
///
/// ### Returns
///
/// The `NbumiCheck`.
pub fn check_fit(fit: &NbumiFit) -> NbumiCheck {
    let row_ps: Vec<f64> = (0..fit.n_genes())
        .into_par_iter()
        .map(|j| {
            (0..fit.n_cells())
                .map(|i| nb_zero_prob(fit.mu(j, i), fit.sizes[j]))
                .sum()
        })
        .collect();
    let col_ps: Vec<f64> = (0..fit.n_cells())
        .into_par_iter()
        .map(|i| {
            (0..fit.n_genes())
                .map(|j| nb_zero_prob(fit.mu(j, i), fit.sizes[j]))
                .sum()
        })
        .collect();

    let gene_error = fit
        .djs
        .iter()
        .zip(row_ps.iter())
        .map(|(d, r)| (d - r).powi(2))
        .sum();
    let cell_error = fit
        .dis
        .iter()
        .zip(col_ps.iter())
        .map(|(d, c)| (d - c).powi(2))
        .sum();

    NbumiCheck {
        gene_error,
        cell_error,
        row_ps,
        col_ps,
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_sc_counts;
    use faer::{mat, Mat};

    #[test]
    fn test_fit_nbumi_basic_quantities() {
        let m = ExpressionMatrix::from_values(mat![
            [0.0, 2.0, 4.0],
            [0.0, 0.0, 0.0],
            [1.0, 1.0, 0.0]
        ]);
        let fit = fit_nbumi(&m, false).unwrap();
        assert_eq!(fit.gene_idx, vec![0, 2]);
        assert_eq!(fit.tjs, vec![6.0, 2.0]);
        assert_eq!(fit.tis, vec![1.0, 3.0, 4.0]);
        assert_eq!(fit.total, 8.0);
        assert_eq!(fit.djs, vec![1.0, 1.0]);
        assert_eq!(fit.dis, vec![1.0, 0.0, 1.0]);
        assert!(fit.sizes.iter().all(|&s| s >= MIN_SIZE && s.is_finite()));
    }

    #[test]
    fn test_fit_nbumi_rejects_normalised() {
        let m = ExpressionMatrix::from_values(mat![[0.5, 2.0], [1.0, 1.0]]);
        assert!(matches!(fit_nbumi(&m, false), Err(ScFeatError::NotCounts(_))));
    }

    #[test]
    fn test_size_recovery_and_dispersion_fit() {
        // gamma-Poisson counts: sizes grow with the mean
        let data = generate_sc_counts(400, 300, 1, 0.0, 11).unwrap();
        let fit = fit_nbumi(&data.counts, false).unwrap();
        let disp = fit_dispersion_vs_mean(&fit).unwrap();
        // larger means come with larger sizes
        assert!(disp.slope > 0.0, "{:?}", disp);

        let check = check_fit(&fit);
        assert_eq!(check.row_ps.len(), fit.n_genes());
        // expected zeros track the observed ones
        let total_obs: f64 = fit.djs.iter().sum();
        let total_exp: f64 = check.row_ps.iter().sum();
        assert!((total_obs - total_exp).abs() / total_obs < 0.15);
    }

    #[test]
    fn test_dispersion_fit_counts_high_means_over_all_genes() {
        // 2001 high mean genes on ln(size) = ln(mean), one of them carrying
        // the maximum size, plus low mean genes off the line
        let n_cells = 10;
        let n_high = MAX_LOW_MEAN_GENES + 1;
        let mut means: Vec<f64> = (0..n_high)
            .map(|k| 20.0 + 180.0 * k as f64 / n_high as f64)
            .collect();
        let mut sizes = means.clone();
        sizes[0] = 1e6;
        means.extend((0..100).map(|k| 1.0 + 4.0 * k as f64 / 100.0));
        sizes.extend(std::iter::repeat(50.0).take(100));

        let n_genes = means.len();
        let tjs: Vec<f64> = means.iter().map(|m| m * n_cells as f64).collect();
        let total: f64 = tjs.iter().sum();
        let fit = NbumiFit {
            gene_idx: (0..n_genes).collect(),
            gene_names: (0..n_genes).map(|j| format!("gene_{}", j)).collect(),
            tjs,
            tis: vec![total / n_cells as f64; n_cells],
            total,
            djs: vec![0.0; n_genes],
            dis: vec![0.0; n_cells],
            var_obs: vec![1.0; n_genes],
            sizes,
        };

        let disp = fit_dispersion_vs_mean(&fit).unwrap();
        assert!((disp.slope - 1.0).abs() < 1e-8, "{:?}", disp);
        assert!(disp.intercept.abs() < 1e-6, "{:?}", disp);
    }

    #[test]
    fn test_combined_drop_finds_excess_zeros() {
        let data = generate_sc_counts(300, 200, 1, 0.0, 5).unwrap();
        let mut values = data.counts.values.clone();
        // gene 0: high counts in 10% of cells, zeros elsewhere
        for j in 0..values.ncols() {
            values[(0, j)] = if j % 10 == 0 { 50.0 } else { 0.0 };
        }
        let counts = ExpressionMatrix::new(
            values,
            data.counts.gene_names.clone(),
            data.counts.cell_names.clone(),
        )
        .unwrap();
        let fit = fit_nbumi(&counts, false).unwrap();

        let table = combined_drop_selection(&fit, None, "fdr", 0.05).unwrap();
        assert_eq!(table.rows[0].gene, "gene_0");
        assert!(table.rows[0].selected);
        assert!(table.rows[0].effect_size > 0.5);

        let top = combined_drop_selection(&fit, Some(5), "fdr", 0.05).unwrap();
        assert_eq!(top.selected_genes().len(), 5);

        let hv = high_var_selection(&fit, Some(10)).unwrap();
        assert_eq!(hv.len(), fit.n_genes());
        assert_eq!(hv.selected_genes().len(), 10);
        assert!(hv.rows.windows(2).all(|w| w[0].effect_size <= w[1].effect_size));
        assert!(hv.rows[0].p_value.is_none());
    }

    #[test]
    fn test_combined_drop_invalid_method() {
        let m = ExpressionMatrix::from_values(Mat::from_fn(4, 5, |i, j| ((i + j) % 3) as f64));
        let fit = fit_nbumi(&m, false).unwrap();
        assert!(combined_drop_selection(&fit, None, "xyz", 0.05).is_err());
    }
}
