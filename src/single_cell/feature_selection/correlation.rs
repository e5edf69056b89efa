use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::cors_similarity::row_cor;
use crate::core::base::stats::{calc_fdr, cor_pval};
use crate::core::data::expression::ExpressionMatrix;
use crate::core::errors::{Result, ScFeatError};
use crate::single_cell::feature_selection::{FeatureRow, FeatureTable, SelectionMethod};

///////////
// Enums //
///////////

/// Which correlations count towards the score of a gene
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorDirection {
    /// Strongest correlation in either direction
    Both,
    /// Strongest positive correlation
    Positive,
    /// Strongest negative correlation
    Negative,
}

/// Helper function to get the correlation direction
///
/// ### Params
///
/// * `s` - One of `"both"`, `"pos"` or `"neg"`.
///
/// ### Returns
///
/// Option of the `CorDirection`
pub fn parse_cor_direction(s: &str) -> Option<CorDirection> {
    match s.to_lowercase().as_str() {
        "both" => Some(CorDirection::Both),
        "pos" | "positive" => Some(CorDirection::Positive),
        "neg" | "negative" => Some(CorDirection::Negative),
        _ => None,
    }
}

////////////////
// Structures //
////////////////

/// Parameters for the correlation based selection
///
/// ### Fields
///
/// * `direction` - `"both"`, `"pos"` or `"neg"`.
/// * `fdr` - If given, genes whose strongest correlation has an adjusted
///   p-value below this are selected.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationParams {
    pub direction: String,
    pub fdr: Option<f64>,
}

impl Default for CorrelationParams {
    fn default() -> Self {
        Self {
            direction: "both".to_string(),
            fdr: None,
        }
    }
}

///////////////
// Functions //
///////////////

/// Score genes by their strongest Spearman correlation with another gene
///
/// Genes without variance score 0. With `fdr` set, the p-value of each
/// gene's best correlation is Bonferroni corrected for the number of
/// partners it was chosen from and then BH adjusted across genes.
///
/// ### Params
///
/// * `matrix` - Expression, genes x cells.
/// * `params` - The `CorrelationParams`.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `FeatureTable` sorted by score (descending).
pub fn correlation_feature_selection(
    matrix: &ExpressionMatrix,
    params: &CorrelationParams,
    verbose: bool,
) -> Result<FeatureTable> {
    let start = Instant::now();
    let direction = parse_cor_direction(&params.direction).ok_or_else(|| {
        ScFeatError::InvalidParameter(format!(
            "Unknown correlation direction '{}'",
            params.direction
        ))
    })?;
    let n_genes = matrix.n_genes();
    let n_cells = matrix.n_cells();
    if n_genes < 2 || n_cells < 3 {
        return Err(ScFeatError::InsufficientData(format!(
            "Correlation scores need at least 2 genes and 3 cells, got {} x {}",
            n_genes, n_cells
        )));
    }

    let cor = row_cor(&matrix.view(), true);

    let scores: Vec<f64> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let others = (0..n_genes).filter(|&j| j != i).map(|j| cor[(i, j)]);
            let s = match direction {
                CorDirection::Both => others.map(f64::abs).fold(0.0, f64::max),
                CorDirection::Positive => others.fold(f64::NEG_INFINITY, f64::max),
                CorDirection::Negative => -others.fold(f64::INFINITY, f64::min),
            };
            if s.is_finite() {
                s
            } else {
                0.0
            }
        })
        .collect();

    let (pvals, qvals): (Option<Vec<f64>>, Option<Vec<f64>>) = match params.fdr {
        Some(_) => {
            let partners = (n_genes - 1) as f64;
            let pvals = scores
                .iter()
                .map(|&s| cor_pval(s.abs(), n_cells).map(|p| (p * partners).min(1.0)))
                .collect::<Result<Vec<f64>>>()?;
            let qvals = calc_fdr(&pvals);
            (Some(pvals), Some(qvals))
        }
        None => (None, None),
    };

    let mut rows: Vec<FeatureRow> = (0..n_genes)
        .map(|i| {
            let q = qvals.as_ref().map(|q| q[i]);
            FeatureRow {
                gene: matrix.gene_names[i].clone(),
                gene_idx: i,
                effect_size: scores[i],
                p_value: pvals.as_ref().map(|p| p[i]),
                q_value: q,
                selected: match (q, params.fdr) {
                    (Some(q), Some(thr)) => q < thr,
                    _ => false,
                },
            }
        })
        .collect();
    rows.sort_by(|a, b| b.effect_size.total_cmp(&a.effect_size));

    if verbose {
        info!(
            "Correlation scores for {} genes in {:.2?}",
            n_genes,
            start.elapsed()
        );
    }

    Ok(FeatureTable::new(SelectionMethod::Correlation, rows))
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    /// genes 0 and 1 co-vary, gene 2 is their mirror image, gene 3 is
    /// constant and gene 4 is unrelated noise
    fn matrix() -> ExpressionMatrix {
        let values = Mat::from_fn(5, 30, |i, j| {
            let x = j as f64;
            match i {
                0 => x,
                1 => x * x,
                2 => 100.0 - x,
                3 => 5.0,
                _ => ((j * 7919) % 13) as f64,
            }
        });
        ExpressionMatrix::from_values(values)
    }

    #[test]
    fn test_correlation_scores() {
        let table =
            correlation_feature_selection(&matrix(), &CorrelationParams::default(), false)
                .unwrap();
        assert_eq!(table.len(), 5);
        let top3 = table.top_n(3);
        for g in ["gene_0", "gene_1", "gene_2"] {
            assert!(top3.contains(&g.to_string()));
        }
        assert!((table.rows[0].effect_size - 1.0).abs() < 1e-10);
        let constant = table.rows.iter().find(|r| r.gene == "gene_3").unwrap();
        assert_eq!(constant.effect_size, 0.0);
        assert!(table.selected_genes().is_empty());
    }

    #[test]
    fn test_correlation_directions() {
        let neg = CorrelationParams {
            direction: "neg".into(),
            fdr: None,
        };
        let table = correlation_feature_selection(&matrix(), &neg, false).unwrap();
        let g2 = table.rows.iter().find(|r| r.gene == "gene_2").unwrap();
        assert!((g2.effect_size - 1.0).abs() < 1e-10);

        let bad = CorrelationParams {
            direction: "sideways".into(),
            fdr: None,
        };
        assert!(correlation_feature_selection(&matrix(), &bad, false).is_err());
    }

    #[test]
    fn test_correlation_fdr() {
        let params = CorrelationParams {
            direction: "both".into(),
            fdr: Some(0.05),
        };
        let table = correlation_feature_selection(&matrix(), &params, false).unwrap();
        let selected = table.selected_genes();
        assert!(selected.contains(&"gene_0".to_string()));
        assert!(!selected.contains(&"gene_3".to_string()));
        assert!(table.rows.iter().all(|r| r.q_value.is_some()));
        for r in &table.rows {
            let p = r.p_value.unwrap();
            assert!((0.0..=1.0).contains(&p));
            assert!(r.q_value.unwrap() >= p - 1e-12);
        }
    }

    #[test]
    fn test_correlation_without_fdr_has_no_pvalues() {
        let params = CorrelationParams {
            direction: "both".into(),
            fdr: None,
        };
        let table = correlation_feature_selection(&matrix(), &params, false).unwrap();
        assert!(table.rows.iter().all(|r| r.p_value.is_none() && r.q_value.is_none()));
    }
}
