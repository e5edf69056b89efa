use extendr_api::prelude::*;
use faer::{Mat, MatRef};

use crate::core::data::expression::ExpressionMatrix;
use crate::core::errors::ScFeatError;
use crate::single_cell::feature_selection::FeatureTable;

////////////
// Errors //
////////////

/// Turn a crate error into an R error
pub fn to_r_error(err: ScFeatError) -> extendr_api::Error {
    extendr_api::Error::Other(err.to_string())
}

//////////////
// Matrices //
//////////////

/// Transform an R matrix to a faer one
pub fn r_matrix_to_faer(x: &RMatrix<f64>) -> MatRef<'_, f64> {
    let ncol = x.ncols();
    let nrow = x.nrows();
    let data = x.data();

    MatRef::from_column_major_slice(data, nrow, ncol)
}

/// Transform a faer into an R matrix
pub fn faer_to_r_matrix(x: MatRef<f64>) -> RArray<f64, [usize; 2]> {
    let nrow = x.nrows();
    let ncol = x.ncols();

    RArray::new_matrix(nrow, ncol, |row, column| x[(row, column)])
}

/// Build an `ExpressionMatrix` from an R matrix (genes x cells)
///
/// Row and column names are taken from the dimnames if present, otherwise
/// generic names are generated.
///
/// ### Params
///
/// * `x` - The R matrix.
///
/// ### Returns
///
/// The `ExpressionMatrix`.
pub fn r_matrix_to_expression(x: &RMatrix<f64>) -> extendr_api::Result<ExpressionMatrix> {
    let values: Mat<f64> = r_matrix_to_faer(x).to_owned();
    let dimnames = x
        .get_attrib("dimnames")
        .and_then(|d| d.as_list())
        .map(|l| {
            l.values()
                .map(|v| v.as_string_vector())
                .collect::<Vec<Option<Vec<String>>>>()
        });

    match dimnames {
        Some(dn) if dn.len() == 2 => {
            let genes = dn[0]
                .clone()
                .unwrap_or_else(|| (0..x.nrows()).map(|i| format!("gene_{}", i)).collect());
            let cells = dn[1]
                .clone()
                .unwrap_or_else(|| (0..x.ncols()).map(|j| format!("cell_{}", j)).collect());
            ExpressionMatrix::new(values, genes, cells).map_err(to_r_error)
        }
        _ => Ok(ExpressionMatrix::from_values(values)),
    }
}

////////////
// Tables //
////////////

/// Transform a feature table into an R list
///
/// Missing p- and q-values become `NA`.
pub fn feature_table_to_list(table: &FeatureTable) -> List {
    let genes: Vec<String> = table.rows.iter().map(|r| r.gene.clone()).collect();
    let effect_size: Vec<f64> = table.rows.iter().map(|r| r.effect_size).collect();
    let p_value: Vec<Option<f64>> = table.rows.iter().map(|r| r.p_value).collect();
    let q_value: Vec<Option<f64>> = table.rows.iter().map(|r| r.q_value).collect();
    let selected: Vec<bool> = table.rows.iter().map(|r| r.selected).collect();

    list!(
        method = table.method.name(),
        gene = genes,
        effect_size = effect_size,
        p_value = Doubles::from_values(p_value.into_iter().map(|p| p.map(Rfloat::from).unwrap_or(Rfloat::na()))),
        q_value = Doubles::from_values(q_value.into_iter().map(|q| q.map(Rfloat::from).unwrap_or(Rfloat::na()))),
        selected = selected
    )
}
