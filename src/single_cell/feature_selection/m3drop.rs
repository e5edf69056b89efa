use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::stats::{normal_upper_tail, p_adjust, parse_multiple_testing};
use crate::core::data::expression::ExpressionMatrix;
use crate::core::errors::{Result, ScFeatError};
use crate::single_cell::feature_selection::{FeatureRow, FeatureTable, SelectionMethod};

/// Grid points over log K before the golden section refinement
const K_GRID_SIZE: usize = 400;

////////////////
// Structures //
////////////////

/// Parameters for the dropout based feature selection
///
/// ### Fields
///
/// * `mt_method` - Multiple testing correction, one of `"bon"`, `"holm"`,
///   `"fdr"` or `"none"`.
/// * `mt_threshold` - Genes with an adjusted p-value below this are selected.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct M3DropParams {
    pub mt_method: String,
    pub mt_threshold: f64,
}

impl Default for M3DropParams {
    fn default() -> Self {
        Self {
            mt_method: "fdr".to_string(),
            mt_threshold: 0.01,
        }
    }
}

/// Per gene dropout statistics
///
/// ### Fields
///
/// * `gene_idx` - Rows of the input matrix with non-zero mean.
/// * `s` - Mean expression.
/// * `s_err` - Standard error of the mean.
/// * `p` - Dropout rate (fraction of zeros).
/// * `p_err` - Binomial standard error of the dropout rate.
#[derive(Clone, Debug, Default)]
pub struct DropoutStats {
    pub gene_idx: Vec<usize>,
    pub s: Vec<f64>,
    pub s_err: Vec<f64>,
    pub p: Vec<f64>,
    pub p_err: Vec<f64>,
}

/// Michaelis-Menten fit of the dropout rate against mean expression
///
/// ### Fields
///
/// * `k` - The Michaelis constant.
/// * `k_err` - Standard error of `k`.
/// * `sd` - Maximum likelihood standard deviation of the residuals.
/// * `ssr` - Sum of squared residuals.
/// * `sar` - Sum of absolute residuals.
/// * `aic` - Akaike information criterion of the Gaussian likelihood.
/// * `predictions` - Fitted dropout rate for every gene.
#[derive(Clone, Debug)]
pub struct MmFit {
    pub k: f64,
    pub k_err: f64,
    pub sd: f64,
    pub ssr: f64,
    pub sar: f64,
    pub aic: f64,
    pub predictions: Vec<f64>,
}

/// Results of the dropout based feature selection
///
/// ### Fields
///
/// * `table` - All genes with non-zero mean, sorted by p-value and then by
///   effect size.
/// * `fit` - The Michaelis-Menten fit.
/// * `stats` - The per gene dropout statistics the fit was run on.
#[derive(Clone, Debug)]
pub struct M3DropResult {
    pub table: FeatureTable,
    pub fit: MmFit,
    pub stats: DropoutStats,
}

/////////////
// Helpers //
/////////////

/// Expected dropout rate at mean expression `s`
#[inline]
pub fn mm_dropout(k: f64, s: f64) -> f64 {
    1.0 - s / (k + s)
}

fn mm_ssr(log_k: f64, s: &[f64], p: &[f64]) -> f64 {
    let k = log_k.exp();
    s.iter()
        .zip(p.iter())
        .map(|(&si, &pi)| (pi - mm_dropout(k, si)).powi(2))
        .sum()
}

/// Calculate the dropout statistics of every gene
///
/// Genes that are never expressed are skipped.
///
/// ### Params
///
/// * `matrix` - Expression matrix, genes x cells.
///
/// ### Returns
///
/// The `DropoutStats`.
pub fn calc_dropout_stats(matrix: &ExpressionMatrix) -> DropoutStats {
    let n = matrix.n_cells() as f64;
    let m = matrix.view();

    let per_gene: Vec<Option<(usize, f64, f64, f64, f64)>> = (0..matrix.n_genes())
        .into_par_iter()
        .map(|i| {
            let row = m.row(i);
            let (mut sum, mut sum_sq, mut detected) = (0.0, 0.0, 0usize);
            for &v in row.iter() {
                sum += v;
                sum_sq += v * v;
                if v > 0.0 {
                    detected += 1;
                }
            }
            let s = sum / n;
            if !(s > 0.0) {
                return None;
            }
            let p = 1.0 - detected as f64 / n;
            let s_err = ((sum_sq / n - s * s).max(0.0) / n).sqrt();
            let p_err = (p * (1.0 - p) / n).sqrt();
            Some((i, s, s_err, p, p_err))
        })
        .collect();

    let mut res = DropoutStats::default();
    for (i, s, s_err, p, p_err) in per_gene.into_iter().flatten() {
        res.gene_idx.push(i);
        res.s.push(s);
        res.s_err.push(s_err);
        res.p.push(p);
        res.p_err.push(p_err);
    }
    res
}

///////////////
// Functions //
///////////////

/// Fit the Michaelis-Menten dropout model
///
/// Maximum likelihood fit of `p = 1 - s / (K + s)` with normally
/// distributed residuals. The residual variance is profiled out, so `K`
/// minimises the sum of squares. A grid over `log K` is refined by golden
/// section search.
///
/// ### Params
///
/// * `p` - Dropout rates.
/// * `s` - Mean expression values.
///
/// ### Returns
///
/// The `MmFit`.
pub fn fit_michaelis_menten(p: &[f64], s: &[f64]) -> Result<MmFit> {
    crate::assert_same_len!(p, s);
    let n = p.len();
    if n < 2 {
        return Err(ScFeatError::InsufficientData(format!(
            "Michaelis-Menten fit needs at least two genes, got {}",
            n
        )));
    }

    let (s_min, s_max) = s
        .iter()
        .fold((f64::INFINITY, 0.0_f64), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let lo = s_min.ln() - 5.0;
    let hi = s_max.ln() + 5.0;
    let step = (hi - lo) / (K_GRID_SIZE - 1) as f64;

    let grid: Vec<f64> = (0..K_GRID_SIZE)
        .into_par_iter()
        .map(|g| mm_ssr(lo + g as f64 * step, s, p))
        .collect();
    let best = grid
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);

    // golden section on the bracket around the best grid point
    let mut a = lo + best.saturating_sub(1) as f64 * step;
    let mut b = lo + (best + 1).min(K_GRID_SIZE - 1) as f64 * step;
    let phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut c = b - phi * (b - a);
    let mut d = a + phi * (b - a);
    let (mut fc, mut fd) = (mm_ssr(c, s, p), mm_ssr(d, s, p));
    for _ in 0..100 {
        if (b - a).abs() < 1e-12 {
            break;
        }
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - phi * (b - a);
            fc = mm_ssr(c, s, p);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + phi * (b - a);
            fd = mm_ssr(d, s, p);
        }
    }
    let k = ((a + b) / 2.0).exp();

    let predictions: Vec<f64> = s.iter().map(|&si| mm_dropout(k, si)).collect();
    let residuals: Vec<f64> = p
        .iter()
        .zip(predictions.iter())
        .map(|(pi, fi)| pi - fi)
        .collect();
    let ssr: f64 = residuals.iter().map(|r| r * r).sum();
    let sar: f64 = residuals.iter().map(|r| r.abs()).sum();

    let n_f = n as f64;
    let sd = (ssr / n_f).sqrt();
    let log_lik = -0.5 * n_f * ((2.0 * std::f64::consts::PI * sd * sd).ln() + 1.0);
    let aic = 2.0 * 2.0 - 2.0 * log_lik;

    // Gauss-Newton information of K
    let info_k: f64 = s.iter().map(|&si| (si / (k + si).powi(2)).powi(2)).sum();
    let k_err = if info_k > 0.0 {
        sd / info_k.sqrt()
    } else {
        f64::INFINITY
    };

    Ok(MmFit {
        k,
        k_err,
        sd,
        ssr,
        sar,
        aic,
        predictions,
    })
}

/// Test every gene for more dropouts than the Michaelis-Menten fit predicts
///
/// Each gene's equivalent Michaelis constant `K_equiv = p * s / (1 - p)` is
/// compared against the global `K` on the log scale, propagating the
/// standard errors of both.
///
/// ### Params
///
/// * `stats` - The `DropoutStats`.
/// * `fit` - The global `MmFit`.
///
/// ### Returns
///
/// Tuple of `(effect sizes, p-values)` aligned with `stats`.
pub fn test_k_equiv(stats: &DropoutStats, fit: &MmFit) -> (Vec<f64>, Vec<f64>) {
    let n = stats.p.len() as f64;
    let k_log = fit.k.ln();
    let k_err_log = if fit.k - fit.k_err > 0.0 {
        ((fit.k - fit.k_err).ln() - k_log).abs() / n.sqrt()
    } else {
        1e10
    };

    (0..stats.p.len())
        .map(|g| {
            let (p, s) = (stats.p[g], stats.s[g]);
            let k_equiv = p * s / (1.0 - p);
            let effect = k_equiv / fit.k;
            if !(k_equiv > 0.0) || !k_equiv.is_finite() {
                return (effect, 1.0);
            }
            let k_equiv_err = k_equiv
                * ((stats.s_err[g] / s).powi(2) + (stats.p_err[g] / p).powi(2)).sqrt();
            let lower = k_equiv - k_equiv_err;
            let k_equiv_err_log = if lower > 0.0 {
                (lower.ln() - k_equiv.ln()).abs()
            } else {
                1e10
            };
            let z = (k_equiv.ln() - k_log) / (k_equiv_err_log.powi(2) + k_err_log.powi(2)).sqrt();
            (effect, normal_upper_tail(z))
        })
        .unzip()
}

/// Dropout based feature selection
///
/// ### Params
///
/// * `matrix` - Normalised expression, genes x cells.
/// * `params` - The `M3DropParams`.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `M3DropResult`.
pub fn m3drop_feature_selection(
    matrix: &ExpressionMatrix,
    params: &M3DropParams,
    verbose: bool,
) -> Result<M3DropResult> {
    let start = Instant::now();
    let mt_method = parse_multiple_testing(&params.mt_method).ok_or_else(|| {
        ScFeatError::InvalidParameter(format!(
            "Unknown multiple testing method '{}'",
            params.mt_method
        ))
    })?;

    let stats = calc_dropout_stats(matrix);
    if verbose && stats.gene_idx.len() < matrix.n_genes() {
        info!(
            "Removed {} genes without expression",
            matrix.n_genes() - stats.gene_idx.len()
        );
    }

    let fit = fit_michaelis_menten(&stats.p, &stats.s)?;
    let (effect, pvals) = test_k_equiv(&stats, &fit);
    let qvals = p_adjust(&pvals, mt_method);

    let mut rows: Vec<FeatureRow> = stats
        .gene_idx
        .iter()
        .enumerate()
        .map(|(g, &i)| FeatureRow {
            gene: matrix.gene_names[i].clone(),
            gene_idx: i,
            effect_size: effect[g],
            p_value: Some(pvals[g]),
            q_value: Some(qvals[g]),
            selected: qvals[g] < params.mt_threshold,
        })
        .collect();
    rows.sort_by(|a, b| {
        let pa = a.p_value.unwrap_or(1.0);
        let pb = b.p_value.unwrap_or(1.0);
        pa.total_cmp(&pb)
            .then_with(|| b.effect_size.total_cmp(&a.effect_size))
    });

    if verbose {
        info!(
            "Michaelis-Menten fit K = {:.3} (se {:.3}); {} genes selected in {:.2?}",
            fit.k,
            fit.k_err,
            rows.iter().filter(|r| r.selected).count(),
            start.elapsed()
        );
    }

    Ok(M3DropResult {
        table: FeatureTable::new(SelectionMethod::M3Drop, rows),
        fit,
        stats,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::{mat, Mat};

    #[test]
    fn test_dropout_stats() {
        let m = ExpressionMatrix::from_values(mat![
            [0.0, 2.0, 0.0, 2.0],
            [0.0, 0.0, 0.0, 0.0],
            [1.0, 1.0, 1.0, 1.0]
        ]);
        let st = calc_dropout_stats(&m);
        assert_eq!(st.gene_idx, vec![0, 2]);
        assert_eq!(st.p, vec![0.5, 0.0]);
        assert_eq!(st.s, vec![1.0, 1.0]);
        // mean(x^2) = 2, s^2 = 1 => sqrt(1 / 4)
        assert!((st.s_err[0] - 0.5).abs() < 1e-12);
        assert_eq!(st.s_err[1], 0.0);
        assert!((st.p_err[0] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_fit_recovers_k() {
        let s: Vec<f64> = (1..200).map(|i| 0.05 * i as f64).collect();
        let p: Vec<f64> = s.iter().map(|&si| mm_dropout(2.5, si)).collect();
        let fit = fit_michaelis_menten(&p, &s).unwrap();
        assert!((fit.k - 2.5).abs() < 1e-4, "{}", fit.k);
        assert!(fit.ssr < 1e-10);
        assert!(fit.predictions.len() == s.len());
    }

    #[test]
    fn test_excess_dropout_gene_ranks_first() {
        // genes follow the MM curve with K = 1, except gene 0 which has
        // far more zeros than its mean implies
        let n_cells = 200;
        let n_genes = 80;
        let k = 1.0;
        let values = Mat::from_fn(n_genes, n_cells, |i, j| {
            if i == 0 {
                // 90% zeros, high mean when expressed
                if j % 10 == 0 {
                    100.0
                } else {
                    0.0
                }
            } else {
                let s = 0.1 * i as f64;
                let p = mm_dropout(k, s);
                let n_zero = (p * n_cells as f64).round() as usize;
                if j < n_zero {
                    0.0
                } else {
                    s * n_cells as f64 / (n_cells - n_zero).max(1) as f64
                }
            }
        });
        let m = ExpressionMatrix::from_values(values);
        let res = m3drop_feature_selection(&m, &M3DropParams::default(), false).unwrap();

        assert_eq!(res.table.rows[0].gene, "gene_0");
        assert!(res.table.rows[0].selected);
        assert!(res.table.rows[0].effect_size > 10.0);
        assert!((res.fit.k - 1.0).abs() < 0.2, "{}", res.fit.k);
    }

    #[test]
    fn test_invalid_method() {
        let m = ExpressionMatrix::from_values(mat![[1.0, 0.0], [2.0, 1.0]]);
        let params = M3DropParams {
            mt_method: "magic".into(),
            ..M3DropParams::default()
        };
        assert!(matches!(
            m3drop_feature_selection(&m, &params, false),
            Err(ScFeatError::InvalidParameter(_))
        ));
    }
}
