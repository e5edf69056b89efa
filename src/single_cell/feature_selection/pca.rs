use faer::Mat;
use log::info;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::pca_svd::pca;
use crate::core::data::expression::ExpressionMatrix;
use crate::core::errors::{Result, ScFeatError};
use crate::single_cell::feature_selection::{FeatureRow, FeatureTable, SelectionMethod};
use crate::single_cell::processing::log_transform;

////////////////
// Structures //
////////////////

/// Parameters for the PCA based selection
///
/// ### Fields
///
/// * `pcs` - 1-based indices of the components that contribute to the score.
/// * `random_svd` - Use the randomised SVD.
/// * `seed` - Seed for the randomised SVD.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaParams {
    pub pcs: Vec<usize>,
    pub random_svd: bool,
    pub seed: u64,
}

impl Default for PcaParams {
    fn default() -> Self {
        Self {
            pcs: vec![1, 2],
            random_svd: false,
            seed: 42,
        }
    }
}

/// Results of the PCA based selection
///
/// ### Fields
///
/// * `table` - Genes sorted by their score (descending).
/// * `projections` - Gene projections (genes x components) up to the
///   highest requested component.
/// * `var_explained` - Proportion of variance of these components.
#[derive(Clone, Debug)]
pub struct PcaFsResult {
    pub table: FeatureTable,
    pub projections: Mat<f64>,
    pub var_explained: Vec<f64>,
}

///////////////
// Functions //
///////////////

/// Score genes by their projections on leading principal components
///
/// The data are `log2(x + 1)` transformed and the genes are treated as the
/// observations, so every cell is centred. A gene's score is the sum of the
/// absolute projections on the chosen components.
///
/// ### Params
///
/// * `matrix` - Expression, genes x cells.
/// * `params` - The `PcaParams`.
/// * `verbose` - Controls verbosity of the function.
///
/// ### Returns
///
/// The `PcaFsResult`.
pub fn pca_feature_selection(
    matrix: &ExpressionMatrix,
    params: &PcaParams,
    verbose: bool,
) -> Result<PcaFsResult> {
    let start = Instant::now();
    if params.pcs.is_empty() || params.pcs.contains(&0) {
        return Err(ScFeatError::InvalidParameter(
            "pcs must be a non-empty list of 1-based component indices".into(),
        ));
    }
    let max_pc = params.pcs.iter().copied().max().unwrap_or(1);
    let rank_bound = matrix.n_genes().min(matrix.n_cells());
    if max_pc > rank_bound {
        return Err(ScFeatError::InvalidParameter(format!(
            "Requested PC{} but the matrix supports at most {} components",
            max_pc, rank_bound
        )));
    }

    let logged = log_transform(matrix, 1.0, 2.0)?;
    let res = pca(logged.view(), max_pc, false, params.random_svd, params.seed)?;

    let mut rows: Vec<FeatureRow> = (0..matrix.n_genes())
        .map(|i| FeatureRow {
            gene: matrix.gene_names[i].clone(),
            gene_idx: i,
            effect_size: params
                .pcs
                .iter()
                .map(|&pc| res.scores[(i, pc - 1)].abs())
                .sum(),
            p_value: None,
            q_value: None,
            selected: false,
        })
        .collect();
    rows.sort_by(|a, b| b.effect_size.total_cmp(&a.effect_size));

    if verbose {
        info!(
            "PCA on {} genes, variance explained by the first {} components: {:?} in {:.2?}",
            matrix.n_genes(),
            max_pc,
            res.var_explained,
            start.elapsed()
        );
    }

    Ok(PcaFsResult {
        table: FeatureTable::new(SelectionMethod::Pca, rows),
        projections: res.scores,
        var_explained: res.var_explained,
    })
}

///////////
// Tests //
///////////
