use extendr_api::prelude::*;

use crate::core::data::expression::CellLabels;
use crate::single_cell::dge::kruskal_wallis_de;
use crate::single_cell::feature_selection::brennecke::{brennecke_get_variable_genes, BrenneckeParams};
use crate::single_cell::feature_selection::correlation::{correlation_feature_selection, CorrelationParams};
use crate::single_cell::feature_selection::m3drop::{m3drop_feature_selection, M3DropParams};
use crate::single_cell::feature_selection::nbumi::{
    combined_drop_selection, fit_nbumi, high_var_selection,
};
use crate::single_cell::feature_selection::pca::{pca_feature_selection, PcaParams};
use crate::single_cell::processing::spike_in_indices;
use crate::utils::r_rust_interface::{
    faer_to_r_matrix, feature_table_to_list, r_matrix_to_expression, to_r_error,
};

///////////////////////////
// Highly variable genes //
///////////////////////////

/// Brennecke highly variable genes
///
/// @description
/// Fits the technical noise of the spike-ins (or all genes) and tests each
/// gene for a squared coefficient of variation above it.
///
/// @param x Numerical matrix. Normalised expression, genes x cells.
/// @param spike_prefix String. Prefix of the spike-in rows. Empty string to
/// use all genes as technical reference.
/// @param fdr Numeric. FDR threshold for the selection.
/// @param min_biol_disp Numeric. Minimum biological coefficient of variation.
/// @param fit_mean_quantile Numeric. Quantile of the means above which
/// technical genes are used in the fit.
/// @param verbose Boolean. Controls verbosity of the function.
///
/// @return A list with the gene table and the fit coefficients `a0` and
/// `a1`.
///
/// @export
#[extendr]
fn rs_brennecke(
    x: RMatrix<f64>,
    spike_prefix: &str,
    fdr: f64,
    min_biol_disp: f64,
    fit_mean_quantile: f64,
    verbose: bool,
) -> extendr_api::Result<List> {
    let matrix = r_matrix_to_expression(&x)?;
    let spikes = spike_in_indices(&matrix, spike_prefix);
    let params = BrenneckeParams {
        fdr,
        min_biol_disp,
        fit_mean_quantile,
    };
    let res = brennecke_get_variable_genes(&matrix, &spikes, &params, verbose).map_err(to_r_error)?;

    Ok(list!(
        table = feature_table_to_list(&res.table),
        a0 = res.a0,
        a1 = res.a1
    ))
}

/////////////////////
// Dropout methods //
/////////////////////

/// M3Drop dropout based feature selection
///
/// @param x Numerical matrix. Normalised expression, genes x cells.
/// @param mt_method String. One of `"bon"`, `"holm"`, `"fdr"` or `"none"`.
/// @param mt_threshold Numeric. Threshold on the adjusted p-values.
/// @param verbose Boolean. Controls verbosity of the function.
///
/// @return A list with the gene table and the Michaelis constant `k`.
///
/// @export
#[extendr]
fn rs_m3drop(
    x: RMatrix<f64>,
    mt_method: String,
    mt_threshold: f64,
    verbose: bool,
) -> extendr_api::Result<List> {
    let matrix = r_matrix_to_expression(&x)?;
    let params = M3DropParams {
        mt_method,
        mt_threshold,
    };
    let res = m3drop_feature_selection(&matrix, &params, verbose).map_err(to_r_error)?;

    Ok(list!(
        table = feature_table_to_list(&res.table),
        k = res.fit.k,
        k_err = res.fit.k_err
    ))
}

/// Depth adjusted negative binomial feature selection
///
/// @param x Numerical matrix. Integer counts, genes x cells.
/// @param mode String. `"drop"` for the dropout test or `"highvar"` for the
/// over-dispersion ranking.
/// @param ntop Integer. Number of genes to select. Negative values select
/// by `qval_threshold` (dropout test only).
/// @param mt_method String. Multiple testing correction of the dropout test.
/// @param qval_threshold Numeric. Threshold on the adjusted p-values.
/// @param verbose Boolean. Controls verbosity of the function.
///
/// @return The gene table as list.
///
/// @export
#[extendr]
fn rs_nbumi(
    x: RMatrix<f64>,
    mode: &str,
    ntop: i32,
    mt_method: &str,
    qval_threshold: f64,
    verbose: bool,
) -> extendr_api::Result<List> {
    let matrix = r_matrix_to_expression(&x)?;
    let fit = fit_nbumi(&matrix, verbose).map_err(to_r_error)?;
    let ntop = if ntop < 0 { None } else { Some(ntop as usize) };

    let table = match mode {
        "drop" => combined_drop_selection(&fit, ntop, mt_method, qval_threshold),
        "highvar" => high_var_selection(&fit, ntop),
        _ => {
            return Err(extendr_api::Error::Other(format!(
                "Unknown mode '{}', use 'drop' or 'highvar'",
                mode
            )))
        }
    }
    .map_err(to_r_error)?;

    Ok(feature_table_to_list(&table))
}

///////////////////////
// Score based genes //
///////////////////////

/// Gene-gene correlation score
///
/// @param x Numerical matrix. Expression, genes x cells.
/// @param direction String. `"both"`, `"pos"` or `"neg"`.
/// @param fdr Numeric. If positive, genes are selected at this FDR.
/// @param verbose Boolean. Controls verbosity of the function.
///
/// @return The gene table as list.
///
/// @export
#[extendr]
fn rs_cor_fs(x: RMatrix<f64>, direction: String, fdr: f64, verbose: bool) -> extendr_api::Result<List> {
    let matrix = r_matrix_to_expression(&x)?;
    let params = CorrelationParams {
        direction,
        fdr: if fdr > 0.0 { Some(fdr) } else { None },
    };
    let table = correlation_feature_selection(&matrix, &params, verbose).map_err(to_r_error)?;

    Ok(feature_table_to_list(&table))
}

/// PCA loading score
///
/// @param x Numerical matrix. Expression, genes x cells.
/// @param pcs Integer vector. 1-based components that contribute to the
/// score.
/// @param random_svd Boolean. Use the randomised SVD.
/// @param seed Integer. Seed for the randomised SVD.
/// @param verbose Boolean. Controls verbosity of the function.
///
/// @return A list with the gene table, the gene projections and the
/// variance explained.
///
/// @export
#[extendr]
fn rs_pca_fs(
    x: RMatrix<f64>,
    pcs: Vec<i32>,
    random_svd: bool,
    seed: usize,
    verbose: bool,
) -> extendr_api::Result<List> {
    let matrix = r_matrix_to_expression(&x)?;
    let params = PcaParams {
        pcs: pcs.iter().map(|&p| p.max(0) as usize).collect(),
        random_svd,
        seed: seed as u64,
    };
    let res = pca_feature_selection(&matrix, &params, verbose).map_err(to_r_error)?;

    Ok(list!(
        table = feature_table_to_list(&res.table),
        projections = faer_to_r_matrix(res.projections.as_ref()),
        var_explained = res.var_explained
    ))
}

//////////////////
// DE reference //
//////////////////

/// Kruskal-Wallis test across cell types
///
/// @param x Numerical matrix. Expression, genes x cells.
/// @param labels String vector. Cell type of every column.
/// @param q_threshold Numeric. Threshold on the BH adjusted p-values.
/// @param verbose Boolean. Controls verbosity of the function.
///
/// @return The gene table as list.
///
/// @export
#[extendr]
fn rs_kruskal_wallis(
    x: RMatrix<f64>,
    labels: Vec<String>,
    q_threshold: f64,
    verbose: bool,
) -> extendr_api::Result<List> {
    let matrix = r_matrix_to_expression(&x)?;
    let labels = CellLabels::new(labels);
    let table = kruskal_wallis_de(&matrix, &labels, q_threshold, verbose).map_err(to_r_error)?;

    Ok(feature_table_to_list(&table))
}

extendr_module! {
    mod r_feature_selection;
    fn rs_brennecke;
    fn rs_m3drop;
    fn rs_nbumi;
    fn rs_cor_fs;
    fn rs_pca_fs;
    fn rs_kruskal_wallis;
}
