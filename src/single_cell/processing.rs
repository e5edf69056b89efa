use faer::Mat;
use log::{info, warn};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::stats::{calc_fdr, mean_sd, median, normal_upper_tail};
use crate::core::data::expression::{CellLabels, ExpressionMatrix};
use crate::core::errors::{Result, ScFeatError};

/// Cells whose zero fraction has an adjusted upper tail p-value below this
/// are flagged as low quality.
const CELL_QC_FDR: f64 = 0.05;

////////////////
// Structures //
////////////////

/// Parameters for the cleaning of the expression matrix
///
/// ### Fields
///
/// * `pseudo_genes` - Gene names to remove before any QC.
/// * `min_detected_genes` - If given, cells detecting fewer genes are
///   removed. If `None`, outlier cells are identified from their zero
///   fraction.
/// * `min_cells_detected` - Genes need to be detected in more than this
///   many cells to be kept.
/// * `spike_prefix` - Prefix identifying spike-ins (case insensitive).
///   Spike-ins skip the gene filter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanParams {
    pub pseudo_genes: Vec<String>,
    pub min_detected_genes: Option<usize>,
    pub min_cells_detected: usize,
    pub spike_prefix: String,
}

impl Default for CleanParams {
    fn default() -> Self {
        Self {
            pseudo_genes: Vec::new(),
            min_detected_genes: None,
            min_cells_detected: 3,
            spike_prefix: "ERCC".to_string(),
        }
    }
}

/// Structure to store QC information on cells
///
/// ### Fields
///
/// * `to_keep` - Boolean vector indicating if the cells passes thresholds
/// * `no_genes` - Number of genes detected per cell
/// * `zero_frac_fdr` - Adjusted p-values of the zero fraction outlier test,
///   if that test was used
#[derive(Clone, Debug)]
pub struct CellQuality {
    pub to_keep: Vec<bool>,
    pub no_genes: Vec<usize>,
    pub zero_frac_fdr: Option<Vec<f64>>,
}

/// Result of `clean_data`
///
/// ### Fields
///
/// * `matrix` - The filtered (and, for counts, CPM normalised) matrix.
/// * `labels` - The labels of the kept cells.
/// * `quality` - QC record over the input cells.
/// * `kept_genes` - Row indices of the kept genes in the input matrix.
/// * `was_counts` - Did the input hold raw counts.
/// * `counts` - Raw counts of the kept genes and cells. Only present if the
///   input held counts.
#[derive(Clone, Debug)]
pub struct CleanedData {
    pub matrix: ExpressionMatrix,
    pub labels: Option<CellLabels>,
    pub quality: CellQuality,
    pub kept_genes: Vec<usize>,
    pub was_counts: bool,
    pub counts: Option<ExpressionMatrix>,
}

/////////////
// Helpers //
/////////////

/// Indices of the spike-in rows
///
/// ### Params
///
/// * `matrix` - The expression matrix.
/// * `prefix` - Name prefix of the spike-ins, compared case insensitive.
///
/// ### Returns
///
/// The row indices of the spike-ins.
pub fn spike_in_indices(matrix: &ExpressionMatrix, prefix: &str) -> Vec<usize> {
    if prefix.is_empty() {
        return Vec::new();
    }
    let prefix = prefix.to_lowercase();
    matrix
        .gene_names
        .iter()
        .enumerate()
        .filter(|(_, g)| g.to_lowercase().starts_with(&prefix))
        .map(|(i, _)| i)
        .collect()
}

/// Flag low quality cells from their fraction of zeros
///
/// The zero fraction is z-scored against all cells. If fewer than half of
/// the cells fall within one sd of the mean the distribution is treated as
/// bimodal and mean and sd are re-estimated from the cells above the
/// median. Cells with a BH adjusted upper tail p-value below 0.05 fail.
///
/// ### Params
///
/// * `no_genes` - Detected genes per cell.
/// * `n_genes` - Total number of genes.
///
/// ### Returns
///
/// Tuple of `(to_keep, adjusted p-values)`.
fn zero_fraction_qc(no_genes: &[usize], n_genes: usize) -> (Vec<bool>, Vec<f64>) {
    let n_genes = n_genes as f64;
    let cell_zero: Vec<f64> = no_genes
        .iter()
        .map(|&d| (n_genes - d as f64) / n_genes)
        .collect();

    let (mut mu, mut sigma) = mean_sd(&cell_zero);
    let within = cell_zero
        .iter()
        .filter(|&&z| z > mu - sigma && z < mu + sigma)
        .count();
    if (within as f64) < 0.5 * cell_zero.len() as f64 {
        if let Some(med) = median(&cell_zero) {
            let upper: Vec<f64> = cell_zero.iter().copied().filter(|&z| z > med).collect();
            if upper.len() >= 2 {
                (mu, sigma) = mean_sd(&upper);
            }
        }
    }

    if !(sigma > 0.0) {
        return (vec![true; cell_zero.len()], vec![1.0; cell_zero.len()]);
    }

    let pvals: Vec<f64> = cell_zero
        .iter()
        .map(|z| normal_upper_tail((z - mu) / sigma))
        .collect();
    let fdr = calc_fdr(&pvals);
    let to_keep = fdr.iter().map(|&q| !(q < CELL_QC_FDR)).collect();

    (to_keep, fdr)
}

///////////////
// Functions //
///////////////

/// Clean and normalise an expression matrix
///
/// 1. Removes the pseudo genes.
/// 2. Removes low quality cells.
/// 3. Keeps genes detected in more than `min_cells_detected` cells and all
///    spike-ins.
/// 4. Raw counts are converted to counts per million. Library sizes exclude
///    the spike-ins when more than one spike-in is present.
///
/// ### Params
///
/// * `matrix` - Genes x cells, raw counts or normalised values.
/// * `labels` - Optional cell labels aligned with the columns.
/// * `params` - The `CleanParams`.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `CleanedData`.
pub fn clean_data(
    matrix: &ExpressionMatrix,
    labels: Option<&CellLabels>,
    params: &CleanParams,
    verbose: bool,
) -> Result<CleanedData> {
    let start = Instant::now();

    if let Some(labels) = labels {
        labels.check_aligned(matrix)?;
    }
    if matrix.n_genes() == 0 || matrix.n_cells() == 0 {
        return Err(ScFeatError::InsufficientData(
            "Expression matrix is empty".into(),
        ));
    }

    // pseudo genes
    let pseudo: FxHashSet<&str> = params.pseudo_genes.iter().map(|s| s.as_str()).collect();
    let non_pseudo: Vec<usize> = (0..matrix.n_genes())
        .filter(|&i| !pseudo.contains(matrix.gene_names[i].as_str()))
        .collect();
    let matrix_np = if non_pseudo.len() < matrix.n_genes() {
        if verbose {
            info!(
                "Removed {} pseudo genes",
                matrix.n_genes() - non_pseudo.len()
            );
        }
        matrix.subset_genes(&non_pseudo)
    } else {
        matrix.clone()
    };

    // cell QC
    let no_genes = matrix_np.detected_per_cell();
    let (to_keep, zero_frac_fdr) = match params.min_detected_genes {
        Some(min_genes) => (no_genes.iter().map(|&d| d >= min_genes).collect(), None),
        None => {
            let (keep, fdr) = zero_fraction_qc(&no_genes, matrix_np.n_genes());
            (keep, Some(fdr))
        }
    };
    let kept_cells: Vec<usize> = (0..to_keep.len()).filter(|&j| to_keep[j]).collect();
    if kept_cells.is_empty() {
        return Err(ScFeatError::InsufficientData(
            "No cells passed quality control".into(),
        ));
    }
    if verbose {
        info!(
            "Cell QC removed {} of {} cells",
            to_keep.len() - kept_cells.len(),
            to_keep.len()
        );
    }
    let matrix_qc = matrix_np.subset_cells(&kept_cells);

    // gene filter
    let spikes: FxHashSet<usize> = spike_in_indices(&matrix_qc, &params.spike_prefix)
        .into_iter()
        .collect();
    let detected = matrix_qc.detected_per_gene();
    let kept_local: Vec<usize> = (0..matrix_qc.n_genes())
        .filter(|&i| detected[i] > params.min_cells_detected || spikes.contains(&i))
        .collect();
    if kept_local.is_empty() {
        return Err(ScFeatError::InsufficientData(format!(
            "No gene is detected in more than {} cells",
            params.min_cells_detected
        )));
    }
    let mut cleaned = matrix_qc.subset_genes(&kept_local);

    // normalisation
    let was_counts = matrix.is_counts();
    let counts = was_counts.then(|| cleaned.clone());
    if was_counts {
        let spike_rows = spike_in_indices(&cleaned, &params.spike_prefix);
        let lib_sizes: Vec<f64> = if spike_rows.len() > 1 {
            let spike_set: FxHashSet<usize> = spike_rows.into_iter().collect();
            (0..cleaned.n_cells())
                .map(|j| {
                    (0..cleaned.n_genes())
                        .filter(|i| !spike_set.contains(i))
                        .map(|i| cleaned.values[(i, j)])
                        .sum()
                })
                .collect()
        } else {
            cleaned.library_sizes()
        };
        if lib_sizes.iter().any(|&s| s <= 0.0) {
            warn!("Cells with a library size of zero are left unnormalised");
        }
        let cpm = Mat::from_fn(cleaned.n_genes(), cleaned.n_cells(), |i, j| {
            let s = lib_sizes[j];
            if s > 0.0 {
                cleaned.values[(i, j)] / s * 1e6
            } else {
                0.0
            }
        });
        cleaned.values = cpm;
    }

    let kept_genes: Vec<usize> = kept_local.iter().map(|&i| non_pseudo[i]).collect();

    if verbose {
        info!(
            "Cleaned data: {} genes x {} cells in {:.2?}",
            cleaned.n_genes(),
            cleaned.n_cells(),
            start.elapsed()
        );
    }

    Ok(CleanedData {
        matrix: cleaned,
        labels: labels.map(|l| l.subset(&kept_cells)),
        quality: CellQuality {
            to_keep,
            no_genes,
            zero_frac_fdr,
        },
        kept_genes,
        was_counts,
        counts,
    })
}

/// Elementwise log transform `log_base(x + pseudocount)`
///
/// ### Params
///
/// * `matrix` - The expression matrix.
/// * `pseudocount` - Added before the log. Must be positive.
/// * `base` - Base of the logarithm, e.g. `2.0`.
///
/// ### Returns
///
/// The transformed matrix.
pub fn log_transform(
    matrix: &ExpressionMatrix,
    pseudocount: f64,
    base: f64,
) -> Result<ExpressionMatrix> {
    if !(pseudocount > 0.0) || !(base > 1.0) {
        return Err(ScFeatError::InvalidParameter(format!(
            "log transform needs pseudocount > 0 and base > 1, got {} and {}",
            pseudocount, base
        )));
    }
    let ln_base = base.ln();
    let values = Mat::from_fn(matrix.n_genes(), matrix.n_cells(), |i, j| {
        (matrix.values[(i, j)] + pseudocount).ln() / ln_base
    });
    ExpressionMatrix::new(
        values,
        matrix.gene_names.clone(),
        matrix.cell_names.clone(),
    )
}

/// Round normalised values up to integer counts
///
/// ### Params
///
/// * `matrix` - Non-negative expression values.
///
/// ### Returns
///
/// The matrix with every value replaced by its ceiling, or `NotCounts` for
/// negative or non-finite input.
pub fn to_integer_counts(matrix: &ExpressionMatrix) -> Result<ExpressionMatrix> {
    let bad = matrix
        .values
        .col_iter()
        .any(|col| col.iter().any(|&v| !v.is_finite() || v < 0.0));
    if bad {
        return Err(ScFeatError::NotCounts(
            "cannot convert negative or non-finite values to counts".into(),
        ));
    }
    let values = Mat::from_fn(matrix.n_genes(), matrix.n_cells(), |i, j| {
        matrix.values[(i, j)].ceil()
    });
    ExpressionMatrix::new(
        values,
        matrix.gene_names.clone(),
        matrix.cell_names.clone(),
    )
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn toy_counts() -> ExpressionMatrix {
        // 6 genes x 5 cells
        let values = mat![
            [1.0, 2.0, 0.0, 3.0, 1.0],
            [0.0, 0.0, 0.0, 1.0, 0.0],
            [5.0, 4.0, 6.0, 2.0, 3.0],
            [2.0, 2.0, 1.0, 1.0, 2.0],
            [1.0, 1.0, 1.0, 1.0, 0.0],
            [3.0, 1.0, 2.0, 2.0, 4.0],
        ];
        ExpressionMatrix::new(
            values,
            vec![
                "Sox2".into(),
                "ERCC-0001".into(),
                "Nanog".into(),
                "Pou5f1".into(),
                "Pseudo1".into(),
                "Klf4".into(),
            ],
            (0..5).map(|j| format!("c{}", j)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_clean_with_min_detected() {
        let m = toy_counts();
        let labels = CellLabels::new(vec!["a".into(), "a".into(), "b".into(), "b".into(), "b".into()]);
        let params = CleanParams {
            pseudo_genes: vec!["Pseudo1".into()],
            min_detected_genes: Some(4),
            ..CleanParams::default()
        };
        let res = clean_data(&m, Some(&labels), &params, false).unwrap();

        // cell c2 detects only Nanog, Pou5f1 and Klf4 after pseudo gene removal
        assert_eq!(res.quality.to_keep, vec![true, true, false, true, true]);
        assert_eq!(res.matrix.n_cells(), 4);
        assert_eq!(res.labels.unwrap().labels, vec!["a", "a", "b", "b"]);

        // ERCC is detected in one cell but kept as a spike-in
        assert!(res.matrix.gene_names.contains(&"ERCC-0001".to_string()));
        assert!(!res.matrix.gene_names.contains(&"Pseudo1".to_string()));
        assert_eq!(res.kept_genes, vec![0, 1, 2, 3, 5]);

        // single spike-in => library sizes over all kept genes
        for s in res.matrix.library_sizes() {
            assert!((s - 1e6).abs() < 1e-6);
        }
        assert!(res.was_counts);

        // raw counts of the kept genes and cells are carried along
        let counts = res.counts.unwrap();
        assert_eq!(counts.gene_names, res.matrix.gene_names);
        assert_eq!(counts.cell_names, vec!["c0", "c1", "c3", "c4"]);
        let kept_cells = [0, 1, 3, 4];
        for (i, &gi) in res.kept_genes.iter().enumerate() {
            for (j, &cj) in kept_cells.iter().enumerate() {
                assert_eq!(counts.values[(i, j)], m.values[(gi, cj)]);
            }
        }
    }

    #[test]
    fn test_clean_normalised_has_no_counts() {
        let m = ExpressionMatrix::from_values(Mat::from_fn(6, 8, |i, j| (i + j) as f64 + 0.5));
        let params = CleanParams {
            min_detected_genes: Some(1),
            ..CleanParams::default()
        };
        let res = clean_data(&m, None, &params, false).unwrap();
        assert!(!res.was_counts);
        assert!(res.counts.is_none());
    }

    #[test]
    fn test_zero_fraction_qc_flags_outlier() {
        let mut no_genes = vec![100; 40];
        no_genes.extend((0..40).map(|i| 95 + (i % 10)));
        no_genes.push(5);
        let (keep, fdr) = zero_fraction_qc(&no_genes, 200);
        assert!(!keep[80]);
        assert!(fdr[80] < 0.05);
        assert!(keep[..80].iter().all(|&k| k));
    }

    #[test]
    fn test_zero_fraction_qc_constant() {
        let (keep, _) = zero_fraction_qc(&[10, 10, 10], 20);
        assert!(keep.iter().all(|&k| k));
    }

    #[test]
    fn test_log_and_integer() {
        let m = ExpressionMatrix::from_values(mat![[0.0, 1.0], [3.0, 0.2]]);
        let l = log_transform(&m, 1.0, 2.0).unwrap();
        assert!((l.values[(1, 0)] - 2.0).abs() < 1e-12);
        assert_eq!(l.values[(0, 0)], 0.0);
        assert!(log_transform(&m, 0.0, 2.0).is_err());

        let c = to_integer_counts(&m).unwrap();
        assert_eq!(c.values[(1, 1)], 1.0);
        assert!(c.is_counts());

        let neg = ExpressionMatrix::from_values(mat![[-1.0]]);
        assert!(matches!(to_integer_counts(&neg), Err(ScFeatError::NotCounts(_))));
    }

    #[test]
    fn test_spike_in_indices() {
        let m = toy_counts();
        assert_eq!(spike_in_indices(&m, "ercc"), vec![1]);
        assert!(spike_in_indices(&m, "").is_empty());
    }
}
