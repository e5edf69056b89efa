use faer::{Mat, MatRef};

use crate::core::base::utils::*;

///////////////////////
// Column matrix ops //
///////////////////////

/// Calculate the column-wise correlation matrix
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the correlations. Assumes that
///   features are columns.
/// * `spearman` - Shall Spearman correlation be calculated instead of
///   Pearson.
///
/// ### Returns
///
/// The resulting correlation matrix. Columns without variance get zero
/// correlation with every other column.
pub fn column_cor(mat: &MatRef<f64>, spearman: bool) -> Mat<f64> {
    let mat = if spearman {
        rank_matrix_col(mat)
    } else {
        mat.to_owned()
    };

    let scaled = scale_matrix_col(&mat.as_ref(), true);

    let nrow = scaled.nrows() as f64;

    scaled.transpose() * &scaled / (nrow - 1_f64)
}

/// Calculate the correlation matrix between the rows of a matrix
///
/// Convenience wrapper for genes x cells matrices where the genes are the
/// features to correlate.
pub fn row_cor(mat: &MatRef<f64>, spearman: bool) -> Mat<f64> {
    column_cor(&mat.transpose(), spearman)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn test_pearson_and_spearman() {
        // col 0 and col 1 perfectly monotone but not linear
        let m = mat![[1.0, 1.0, 4.0], [2.0, 4.0, 3.0], [3.0, 9.0, 2.0], [4.0, 16.0, 1.0]];
        let pearson = column_cor(&m.as_ref(), false);
        let spearman = column_cor(&m.as_ref(), true);

        assert!((spearman[(0, 1)] - 1.0).abs() < 1e-12);
        assert!(pearson[(0, 1)] < 1.0 && pearson[(0, 1)] > 0.95);
        assert!((spearman[(0, 2)] + 1.0).abs() < 1e-12);
        assert!((pearson[(0, 0)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_row_cor_constant_row() {
        let m = mat![[1.0, 2.0, 3.0], [5.0, 5.0, 5.0]];
        let cor = row_cor(&m.as_ref(), true);
        assert_eq!(cor.nrows(), 2);
        assert_eq!(cor[(0, 1)], 0.0);
    }
}
