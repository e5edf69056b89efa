use faer::Mat;
use rand::prelude::*;
use rand_distr::{Distribution, Gamma, Normal, Poisson};
use rayon::prelude::*;

use crate::core::data::expression::{CellLabels, ExpressionMatrix};
use crate::core::errors::{Result, ScFeatError};

////////////////
// Structures //
////////////////

/// Structure for synthetic single cell data
///
/// ### Fields
///
/// * `counts` - The synthetic counts (genes x cells).
/// * `labels` - The cell type of each cell.
/// * `de_genes` - Names of the genes with a cell type specific fold change.
#[derive(Clone, Debug)]
pub struct SyntheticScData {
    pub counts: ExpressionMatrix,
    pub labels: CellLabels,
    pub de_genes: Vec<String>,
}

/////////////////////////
// Synthetic sc counts //
/////////////////////////

/// Generate synthetic single cell counts with cell type specific genes
///
/// Every gene gets a base mean drawn from a Gamma distribution and a
/// negative binomial dispersion that shrinks with the mean. Cells get a
/// log-normal library size factor and are assigned round robin to
/// `n_groups` cell types. A fraction of the genes is up-regulated in one
/// cell type. Counts are drawn as a Gamma-Poisson mixture.
///
/// ### Params
///
/// * `n_genes` - Number of genes.
/// * `n_cells` - Number of cells.
/// * `n_groups` - Number of cell types.
/// * `de_fraction` - Fraction of genes that are differentially expressed.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// The `SyntheticScData`.
pub fn generate_sc_counts(
    n_genes: usize,
    n_cells: usize,
    n_groups: usize,
    de_fraction: f64,
    seed: u64,
) -> Result<SyntheticScData> {
    if n_genes == 0 || n_cells == 0 {
        return Err(ScFeatError::InvalidParameter(
            "Synthetic data needs at least one gene and one cell".into(),
        ));
    }
    if n_groups == 0 || n_groups > n_cells {
        return Err(ScFeatError::InvalidParameter(format!(
            "n_groups must be between 1 and the number of cells, got {}",
            n_groups
        )));
    }
    if !(0.0..=1.0).contains(&de_fraction) {
        return Err(ScFeatError::InvalidParameter(format!(
            "de_fraction must be in [0, 1], got {}",
            de_fraction
        )));
    }

    let dist_err = |e: &dyn std::fmt::Display| ScFeatError::InvalidParameter(e.to_string());

    let mut rng = StdRng::seed_from_u64(seed);

    // gene level parameters
    let gamma = Gamma::new(0.6, 4.0).map_err(|e| dist_err(&e))?;
    let base_mean: Vec<f64> = (0..n_genes)
        .map(|_| gamma.sample(&mut rng) + 0.01)
        .collect();
    let nb_size: Vec<f64> = base_mean.iter().map(|&m| 0.5 + m * 0.3).collect();

    // cell level parameters
    let lib_noise = Normal::new(0.0, 0.3).map_err(|e| dist_err(&e))?;
    let size_factor: Vec<f64> = (0..n_cells)
        .map(|_| {
            let log_factor: f64 = lib_noise.sample(&mut rng);
            log_factor.exp()
        })
        .collect();
    let cell_group: Vec<usize> = (0..n_cells).map(|j| j % n_groups).collect();

    // pick the DE genes and their up-regulated group
    let n_de = ((n_genes as f64) * de_fraction).round() as usize;
    let mut gene_order: Vec<usize> = (0..n_genes).collect();
    gene_order.shuffle(&mut rng);
    let mut de_group: Vec<Option<usize>> = vec![None; n_genes];
    let fc_dist = Normal::new(1.5, 0.4).map_err(|e| dist_err(&e))?;
    let mut fold_change = vec![1.0; n_genes];
    for (k, &gene) in gene_order.iter().take(n_de).enumerate() {
        de_group[gene] = Some(k % n_groups);
        let log_fc: f64 = fc_dist.sample(&mut rng);
        fold_change[gene] = log_fc.max(0.5).exp();
    }

    let gene_data: Vec<Vec<f64>> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let mut local_rng = StdRng::seed_from_u64(seed.wrapping_add((i as u64 + 1) * 7919));
            let r = nb_size[i];
            (0..n_cells)
                .map(|j| {
                    let mut mu = base_mean[i] * size_factor[j];
                    if de_group[i] == Some(cell_group[j]) {
                        mu *= fold_change[i];
                    }
                    let lambda = Gamma::new(r, mu / r)
                        .map(|g| g.sample(&mut local_rng))
                        .unwrap_or(0.0);
                    if lambda > 0.0 {
                        Poisson::new(lambda)
                            .map(|p| p.sample(&mut local_rng))
                            .unwrap_or(0.0)
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();

    let values = Mat::from_fn(n_genes, n_cells, |i, j| gene_data[i][j]);

    let gene_names: Vec<String> = (0..n_genes).map(|i| format!("gene_{}", i)).collect();
    let cell_names: Vec<String> = (0..n_cells).map(|j| format!("cell_{}", j)).collect();
    let labels = CellLabels::new(cell_group.iter().map(|g| format!("type_{}", g)).collect());

    let de_genes: Vec<String> = (0..n_genes)
        .filter(|&i| de_group[i].is_some())
        .map(|i| gene_names[i].clone())
        .collect();

    Ok(SyntheticScData {
        counts: ExpressionMatrix::new(values, gene_names, cell_names)?,
        labels,
        de_genes,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_shape_and_counts() {
        let data = generate_sc_counts(200, 60, 3, 0.1, 42).unwrap();
        assert_eq!(data.counts.n_genes(), 200);
        assert_eq!(data.counts.n_cells(), 60);
        assert_eq!(data.labels.len(), 60);
        assert_eq!(data.de_genes.len(), 20);
        assert!(data.counts.is_counts());
        let (groups, _) = data.labels.groups();
        assert_eq!(groups.len(), 3);
        // some dropouts are expected
        let zeros = data
            .counts
            .detected_per_gene()
            .iter()
            .filter(|&&d| d < 60)
            .count();
        assert!(zeros > 0);
    }

    #[test]
    fn test_synthetic_reproducible() {
        let a = generate_sc_counts(50, 20, 2, 0.2, 7).unwrap();
        let b = generate_sc_counts(50, 20, 2, 0.2, 7).unwrap();
        assert_eq!(a.counts.values, b.counts.values);
        assert_eq!(a.de_genes, b.de_genes);
    }

    #[test]
    fn test_synthetic_invalid() {
        assert!(generate_sc_counts(10, 10, 0, 0.1, 1).is_err());
        assert!(generate_sc_counts(10, 10, 2, 1.5, 1).is_err());
        assert!(generate_sc_counts(0, 10, 2, 0.1, 1).is_err());
    }
}
