use rayon::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF, StudentsT};
use statrs::function::erf::erfc;
use statrs::function::gamma::ln_gamma;

use crate::core::errors::{Result, ScFeatError};

/////////////////////
// Enums | Helpers //
/////////////////////

/// Multiple testing correction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MultipleTesting {
    /// Bonferroni correction
    Bonferroni,
    /// Holm step-down correction
    Holm,
    /// Benjamini-Hochberg false discovery rate
    Fdr,
    /// No correction
    None,
}

/// Helper function to get the multiple testing method
///
/// ### Params
///
/// * `s` - String, type of correction to apply.
///
/// ### Returns
///
/// Option of the `MultipleTesting`
pub fn parse_multiple_testing(s: &str) -> Option<MultipleTesting> {
    match s.to_lowercase().as_str() {
        "bon" | "bonferroni" => Some(MultipleTesting::Bonferroni),
        "holm" => Some(MultipleTesting::Holm),
        "fdr" | "bh" => Some(MultipleTesting::Fdr),
        "none" => Some(MultipleTesting::None),
        _ => None,
    }
}

///////////////
// P-values  //
///////////////

/// Upper tail probability of the standard normal distribution
///
/// Uses the complementary error function, so very large Z scores do not
/// collapse to `1 - 1 = 0` prematurely.
#[inline]
pub fn normal_upper_tail(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Upper tail probabilities of a chi-squared distribution
///
/// ### Params
///
/// * `stats` - The test statistics.
/// * `df` - Degrees of freedom.
///
/// ### Returns
///
/// The p-values, or an error if the degrees of freedom are not valid.
pub fn chisq_upper_tail(stats: &[f64], df: f64) -> Result<Vec<f64>> {
    let dist = ChiSquared::new(df).map_err(|e| {
        ScFeatError::InvalidParameter(format!("Chi-squared with df = {}: {}", df, e))
    })?;

    Ok(stats
        .iter()
        .map(|&x| if x.is_finite() { dist.sf(x.max(0.0)) } else { f64::NAN })
        .collect())
}

/// Two sided p-value of a Pearson/Spearman correlation coefficient
///
/// ### Params
///
/// * `r` - The correlation coefficient
/// * `n` - Number of observations the coefficient was computed on.
///
/// ### Returns
///
/// The two sided p-value based on the t-distribution with `n - 2` degrees of
/// freedom.
pub fn cor_pval(r: f64, n: usize) -> Result<f64> {
    if n < 3 {
        return Err(ScFeatError::InsufficientData(format!(
            "Need at least 3 observations for a correlation test, got {}",
            n
        )));
    }
    let df = (n - 2) as f64;
    let r = r.clamp(-1.0, 1.0);
    if (1.0 - r.abs()) < 1e-15 {
        return Ok(0.0);
    }
    let t = r * (df / (1.0 - r * r)).sqrt();
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| ScFeatError::InvalidParameter(format!("Student's t: {}", e)))?;

    Ok(2.0 * dist.sf(t.abs()))
}

/// Calculate the p-value of a hypergeometric test.
///
/// ### Params
///
/// * `q` - Number of white balls drawn
/// * `m` - Number of white balls in the urn
/// * `n` - Number of black balls in the urn
/// * `k` - Number of balls drawn from the urn
///
/// ### Return
///
/// P(X > q) of the hypergeometric distribution
pub fn hypergeom_pval(q: usize, m: usize, n: usize, k: usize) -> f64 {
    let population = m + n;
    let (n_f, m_f, k_f) = (n as f64, m as f64, k as f64);
    let population_f = population as f64;

    let upper = k.min(m);

    // log(PMF(i)) for every i > q
    let log_probs: Vec<f64> = ((q + 1)..=upper)
        .filter(|&i| k - i <= n)
        .map(|i| {
            let i_f = i as f64;
            ln_gamma(m_f + 1.0) - ln_gamma(i_f + 1.0) - ln_gamma(m_f - i_f + 1.0)
                + ln_gamma(n_f + 1.0)
                - ln_gamma(k_f - i_f + 1.0)
                - ln_gamma(n_f - (k_f - i_f) + 1.0)
                - (ln_gamma(population_f + 1.0)
                    - ln_gamma(k_f + 1.0)
                    - ln_gamma(population_f - k_f + 1.0))
        })
        .collect();

    if log_probs.is_empty() {
        return 0.0;
    }

    // log-sum-exp
    let max_log_prob = log_probs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = log_probs.iter().map(|lp| (lp - max_log_prob).exp()).sum();

    (sum * max_log_prob.exp()).min(1.0)
}

//////////////////////////
// Multiple testing     //
//////////////////////////

/// Calculate the FDR (Benjamini-Hochberg)
///
/// NaN p-values are passed through unchanged and do not count towards the
/// number of tests.
///
/// ### Params
///
/// * `pvals` - P-values for which to calculate the FDR
///
/// ### Returns
///
/// The calculated FDRs
pub fn calc_fdr(pvals: &[f64]) -> Vec<f64> {
    let mut adj_pvals = vec![f64::NAN; pvals.len()];

    let mut indexed_pval: Vec<(usize, f64)> = pvals
        .par_iter()
        .enumerate()
        .filter(|(_, p)| !p.is_nan())
        .map(|(i, &x)| (i, x))
        .collect();

    let n = indexed_pval.len();
    if n == 0 {
        return adj_pvals;
    }
    let n_f64 = n as f64;

    indexed_pval
        .sort_unstable_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let adj_pvals_tmp: Vec<f64> = indexed_pval
        .par_iter()
        .enumerate()
        .map(|(i, (_, p))| (n_f64 / (i + 1) as f64) * p)
        .collect();

    let mut current_min = adj_pvals_tmp[n - 1].min(1.0);
    let mut monotonic_adj = vec![current_min; n];

    for i in (0..n - 1).rev() {
        current_min = current_min.min(adj_pvals_tmp[i]).min(1.0);
        monotonic_adj[i] = current_min;
    }

    for (i, &(original_idx, _)) in indexed_pval.iter().enumerate() {
        adj_pvals[original_idx] = monotonic_adj[i];
    }

    adj_pvals
}

/// Bonferroni correction
pub fn calc_bonferroni(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.iter().filter(|p| !p.is_nan()).count() as f64;
    pvals.iter().map(|p| (p * n).min(1.0)).collect()
}

/// Holm step-down correction
pub fn calc_holm(pvals: &[f64]) -> Vec<f64> {
    let mut adj_pvals = vec![f64::NAN; pvals.len()];
    let mut indexed_pval: Vec<(usize, f64)> = pvals
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.is_nan())
        .map(|(i, &p)| (i, p))
        .collect();
    indexed_pval.sort_unstable_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let n = indexed_pval.len();
    let mut running_max = 0_f64;
    for (rank, &(orig, p)) in indexed_pval.iter().enumerate() {
        let adj = ((n - rank) as f64 * p).min(1.0);
        running_max = running_max.max(adj);
        adj_pvals[orig] = running_max;
    }

    adj_pvals
}

/// Apply the chosen multiple testing correction
pub fn p_adjust(pvals: &[f64], method: MultipleTesting) -> Vec<f64> {
    match method {
        MultipleTesting::Bonferroni => calc_bonferroni(pvals),
        MultipleTesting::Holm => calc_holm(pvals),
        MultipleTesting::Fdr => calc_fdr(pvals),
        MultipleTesting::None => pvals.to_vec(),
    }
}

/////////////////
// Descriptive //
/////////////////

/// Get the median
///
/// ### Params
///
/// * `x` - The slice for which to calculate the median for.
///
/// ### Results
///
/// The median (if the vector is not empty)
pub fn median(x: &[f64]) -> Option<f64> {
    quantile(x, 0.5)
}

/// Sample quantile with linear interpolation between order statistics
///
/// Matches the default (type 7) definition used by most statistics
/// environments. Non-finite values are ignored.
///
/// ### Params
///
/// * `x` - Values to compute the quantile over.
/// * `prob` - Probability in `[0, 1]`.
///
/// ### Returns
///
/// The quantile, or `None` if there are no finite values.
pub fn quantile(x: &[f64], prob: f64) -> Option<f64> {
    let mut data: Vec<f64> = x.iter().copied().filter(|v| v.is_finite()).collect();
    if data.is_empty() {
        return None;
    }
    data.sort_unstable_by(|a, b| a.total_cmp(b));

    let prob = prob.clamp(0.0, 1.0);
    let h = (data.len() - 1) as f64 * prob;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;

    Some(data[lo] + (h - lo as f64) * (data[hi] - data[lo]))
}

/// Mean and sample standard deviation of a slice
///
/// ### Returns
///
/// Tuple of `(mean, sd)`. The standard deviation is `0` for fewer than two
/// values.
pub fn mean_sd(x: &[f64]) -> (f64, f64) {
    let n = x.len();
    if n == 0 {
        return (f64::NAN, 0.0);
    }
    let mean = x.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, var.sqrt())
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fdr_matches_reference() {
        // p.adjust(c(0.01, 0.04, 0.03, 0.005), "BH")
        let p = vec![0.01, 0.04, 0.03, 0.005];
        let adj = calc_fdr(&p);
        let expected = [0.02, 0.04, 0.04, 0.02];
        for (a, e) in adj.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-12, "{} vs {}", a, e);
        }
    }

    #[test]
    fn test_fdr_skips_nan() {
        let p = vec![0.01, f64::NAN, 0.02];
        let adj = calc_fdr(&p);
        assert!(adj[1].is_nan());
        assert!((adj[0] - 0.02).abs() < 1e-12);
        assert!((adj[2] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_holm_and_bonferroni() {
        let p = vec![0.01, 0.04, 0.03, 0.005];
        let bon = calc_bonferroni(&p);
        assert!((bon[0] - 0.04).abs() < 1e-12);
        assert!((bon[1] - 0.16).abs() < 1e-12);

        // p.adjust(c(0.01, 0.04, 0.03, 0.005), "holm") = 0.03 0.06 0.06 0.02
        let holm = calc_holm(&p);
        let expected = [0.03, 0.06, 0.06, 0.02];
        for (a, e) in holm.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-12, "{} vs {}", a, e);
        }
    }

    #[test]
    fn test_quantile_type7() {
        let x = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&x, 0.5), Some(2.5));
        assert!((quantile(&x, 0.8).unwrap() - 3.4).abs() < 1e-12);
        assert_eq!(quantile(&x, 0.0), Some(1.0));
        assert_eq!(quantile(&[], 0.5), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn test_normal_upper_tail() {
        assert!((normal_upper_tail(0.0) - 0.5).abs() < 1e-12);
        assert!((normal_upper_tail(1.959964) - 0.025).abs() < 1e-6);
        assert!(normal_upper_tail(40.0) >= 0.0);
        assert!((normal_upper_tail(-40.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_chisq_upper_tail() {
        // pchisq(3.841459, 1, lower.tail = FALSE) = 0.05
        let p = chisq_upper_tail(&[3.841459], 1.0).unwrap();
        assert!((p[0] - 0.05).abs() < 1e-6);
        assert!(chisq_upper_tail(&[1.0], 0.0).is_err());
    }

    #[test]
    fn test_cor_pval() {
        // cor.test with r = 0.5, n = 20 -> p = 0.02479
        let p = cor_pval(0.5, 20).unwrap();
        assert!((p - 0.0248).abs() < 5e-4);
        assert!(cor_pval(0.5, 2).is_err());
    }

    #[test]
    fn test_hypergeom() {
        // phyper(2, 5, 15, 5, lower.tail = FALSE) = 0.0726
        let p = hypergeom_pval(2, 5, 15, 5);
        assert!((p - 0.07262).abs() < 1e-4, "{}", p);
        // nothing above the maximal overlap
        assert_eq!(hypergeom_pval(5, 5, 15, 5), 0.0);
    }

    #[test]
    fn test_mean_sd() {
        let (m, s) = mean_sd(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((m - 5.0).abs() < 1e-12);
        assert!((s - 2.138090).abs() < 1e-6);
    }
}
