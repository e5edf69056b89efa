use log::info;
use rayon::prelude::*;
use std::time::Instant;

use crate::core::base::stats::{calc_fdr, chisq_upper_tail};
use crate::core::base::utils::{rank_vector, tie_sizes};
use crate::core::data::expression::{CellLabels, ExpressionMatrix};
use crate::core::errors::{Result, ScFeatError};
use crate::single_cell::feature_selection::{FeatureRow, FeatureTable, SelectionMethod};

/////////////
// Helpers //
/////////////

/// Kruskal-Wallis H statistic with tie correction
///
/// ### Params
///
/// * `values` - The observations.
/// * `groups` - Group index of every observation.
/// * `n_groups` - Number of groups.
///
/// ### Returns
///
/// The corrected H statistic, or `None` if all observations are tied.
pub fn kruskal_wallis_h(values: &[f64], groups: &[usize], n_groups: usize) -> Option<f64> {
    crate::assert_same_len!(values, groups);
    let n = values.len() as f64;

    let ties: f64 = tie_sizes(values)
        .iter()
        .map(|&t| {
            let t = t as f64;
            t * t * t - t
        })
        .sum();
    let correction = 1.0 - ties / (n * n * n - n);
    if correction <= 0.0 {
        return None;
    }

    let ranks = rank_vector(values);
    let mut rank_sums = vec![0.0; n_groups];
    let mut sizes = vec![0.0; n_groups];
    for (r, &g) in ranks.iter().zip(groups.iter()) {
        rank_sums[g] += r;
        sizes[g] += 1.0;
    }

    let sum_term: f64 = rank_sums
        .iter()
        .zip(sizes.iter())
        .filter(|(_, s)| **s > 0.0)
        .map(|(r, s)| r * r / s)
        .sum();
    let h = 12.0 / (n * (n + 1.0)) * sum_term - 3.0 * (n + 1.0);

    Some(h / correction)
}

///////////////
// Functions //
///////////////

/// Kruskal-Wallis test of every gene across the cell types
///
/// Builds the reference table of differentially expressed genes the feature
/// selection methods are evaluated against.
///
/// ### Params
///
/// * `matrix` - Expression, genes x cells.
/// * `labels` - Cell type of every cell.
/// * `q_threshold` - Genes with a BH adjusted p-value below this are
///   selected.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `FeatureTable` with the H statistic as effect size, sorted by
/// p-value.
pub fn kruskal_wallis_de(
    matrix: &ExpressionMatrix,
    labels: &CellLabels,
    q_threshold: f64,
    verbose: bool,
) -> Result<FeatureTable> {
    let start = Instant::now();
    labels.check_aligned(matrix)?;
    let (groups, membership) = labels.groups();
    if groups.len() < 2 {
        return Err(ScFeatError::InsufficientData(
            "Differential expression needs at least two cell types".into(),
        ));
    }
    let df = (groups.len() - 1) as f64;
    let m = matrix.view();

    let h_stats: Vec<Option<f64>> = (0..matrix.n_genes())
        .into_par_iter()
        .map(|i| {
            let row: Vec<f64> = m.row(i).iter().copied().collect();
            kruskal_wallis_h(&row, &membership, groups.len())
        })
        .collect();

    let h_values: Vec<f64> = h_stats.iter().map(|h| h.unwrap_or(0.0)).collect();
    let chisq = chisq_upper_tail(&h_values, df)?;
    let pvals: Vec<f64> = h_stats
        .iter()
        .zip(chisq.iter())
        .map(|(h, &p)| if h.is_some() { p } else { 1.0 })
        .collect();
    let qvals = calc_fdr(&pvals);

    let mut rows: Vec<FeatureRow> = (0..matrix.n_genes())
        .map(|i| FeatureRow {
            gene: matrix.gene_names[i].clone(),
            gene_idx: i,
            effect_size: h_values[i],
            p_value: Some(pvals[i]),
            q_value: Some(qvals[i]),
            selected: qvals[i] < q_threshold,
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
            "Kruskal-Wallis test over {} cell types: {} of {} genes at q < {} in {:.2?}",
            groups.len(),
            rows.iter().filter(|r| r.selected).count(),
            rows.len(),
            q_threshold,
            start.elapsed()
        );
    }

    Ok(FeatureTable::new(SelectionMethod::KruskalWallis, rows))
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    #[test]
    fn test_kruskal_wallis_h_reference() {
        // three groups, no ties: H = 12 / (9 * 10) * (6^2 / 3 + 15^2 / 3 + 24^2 / 3) - 30
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let groups = [0, 0, 0, 1, 1, 1, 2, 2, 2];
        let h = kruskal_wallis_h(&values, &groups, 3).unwrap();
        assert!((h - 7.2).abs() < 1e-12, "{}", h);
    }

    #[test]
    fn test_kruskal_wallis_h_ties() {
        // ranks: 1.5, 1.5, 3, 4 ; groups {0, 0} {1, 1}
        let values = [1.0, 1.0, 2.0, 3.0];
        let groups = [0, 0, 1, 1];
        let h = kruskal_wallis_h(&values, &groups, 2).unwrap();
        // uncorrected H = 12 / 20 * (9 / 2 + 49 / 2) - 15 = 2.4, C = 1 - 6 / 60
        assert!((h - 2.4 / 0.9).abs() < 1e-12, "{}", h);
        assert!(kruskal_wallis_h(&[2.0, 2.0, 2.0], &[0, 1, 1], 2).is_none());
    }

    #[test]
    fn test_kruskal_wallis_de() {
        let values = Mat::from_fn(3, 30, |i, j| match i {
            0 => {
                if j < 15 {
                    1.0 + (j % 4) as f64
                } else {
                    20.0 + (j % 4) as f64
                }
            }
            1 => 3.0,
            _ => (j % 5) as f64,
        });
        let m = ExpressionMatrix::from_values(values);
        let labels = CellLabels::new(
            (0..30)
                .map(|j| if j < 15 { "a".to_string() } else { "b".to_string() })
                .collect(),
        );
        let table = kruskal_wallis_de(&m, &labels, 0.05, false).unwrap();
        assert_eq!(table.rows[0].gene, "gene_0");
        assert!(table.rows[0].selected);
        assert_eq!(table.selected_genes(), vec!["gene_0".to_string()]);
        let constant = table.rows.iter().find(|r| r.gene == "gene_1").unwrap();
        assert_eq!(constant.p_value, Some(1.0));

        let one_group = CellLabels::new(vec!["a".to_string(); 30]);
        assert!(kruskal_wallis_de(&m, &one_group, 0.05, false).is_err());
    }
}
