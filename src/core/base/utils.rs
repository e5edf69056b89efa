use faer::{Mat, MatRef};
use rayon::prelude::*;

////////////////////
// Util functions //
////////////////////

/// Generate the rank of a vector with tie correction.
///
/// ### Params
///
/// * `vec` - The slice of numericals to rank.
///
/// ### Returns
///
/// The ranked vector (also f64)
pub fn rank_vector<T>(vec: &[T]) -> Vec<f64>
where
    T: Copy + PartialOrd + PartialEq,
{
    let n = vec.len();
    if n == 0 {
        return Vec::new();
    }

    let mut indexed_values: Vec<(T, usize)> = vec
        .iter()
        .copied()
        .enumerate()
        .map(|(i, v)| (v, i))
        .collect();

    indexed_values
        .sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let current_value = indexed_values[i].0;
        let start = i;
        while i < n && indexed_values[i].0 == current_value {
            i += 1;
        }
        let avg_rank = (start + i + 1) as f64 / 2.0;
        for j in start..i {
            ranks[indexed_values[j].1] = avg_rank;
        }
    }
    ranks
}

/// Size of every group of tied values in a slice
///
/// ### Params
///
/// * `vec` - The slice to check for ties.
///
/// ### Returns
///
/// Vector with the size of every run of identical values (singletons
/// included).
pub fn tie_sizes(vec: &[f64]) -> Vec<usize> {
    let mut sorted = vec.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));

    let mut res = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = i;
        while i < sorted.len() && sorted[i] == sorted[start] {
            i += 1;
        }
        res.push(i - start);
    }
    res
}

/// Per row mean and sample variance
///
/// ### Params
///
/// * `mat` - The matrix. Rows are treated as the variables (genes).
///
/// ### Returns
///
/// Tuple of `(means, variances)` with the variance using `n - 1`.
pub fn row_means_vars(mat: MatRef<f64>) -> (Vec<f64>, Vec<f64>) {
    let n = mat.ncols() as f64;

    (0..mat.nrows())
        .into_par_iter()
        .map(|i| {
            let row = mat.row(i);
            let mean = row.iter().sum::<f64>() / n;
            let var = if n > 1.0 {
                row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
            } else {
                0.0
            };
            (mean, var)
        })
        .unzip()
}

/// Per row sums
pub fn row_sums(mat: MatRef<f64>) -> Vec<f64> {
    (0..mat.nrows())
        .into_par_iter()
        .map(|i| mat.row(i).iter().sum::<f64>())
        .collect()
}

/// Per column sums
pub fn col_sums(mat: MatRef<f64>) -> Vec<f64> {
    mat.par_col_iter().map(|col| col.iter().sum::<f64>()).collect()
}

/// Scale a matrix
///
/// ### Params
///
/// * `mat` - The matrix on which to apply column-wise scaling
/// * `scale_sd` - Shall the standard deviation be equalised across columns
///
/// ### Returns
///
/// The scaled matrix.
pub fn scale_matrix_col(mat: &MatRef<f64>, scale_sd: bool) -> Mat<f64> {
    let n_rows = mat.nrows();
    let mut result = mat.to_owned();

    result.par_col_iter_mut().for_each(|mut col| {
        let mean = col.as_ref().iter().sum::<f64>() / n_rows as f64;
        for i in 0..n_rows {
            col[i] -= mean;
        }

        if scale_sd {
            let ss = col.as_ref().iter().map(|v| v * v).sum::<f64>();
            let mut sd = (ss / (n_rows as f64 - 1.0)).sqrt();
            if !sd.is_finite() || sd < 1e-10 {
                sd = 1.0;
            }
            for i in 0..n_rows {
                col[i] /= sd;
            }
        }
    });

    result
}

/// Column wise rank transformation
///
/// ### Params
///
/// * `mat` - The matrix on which to apply column-wise ranking
///
/// ### Returns
///
/// The matrix with every column replaced by its (tie-averaged) ranks.
pub fn rank_matrix_col(mat: &MatRef<f64>) -> Mat<f64> {
    let mut ranked_mat = Mat::zeros(mat.nrows(), mat.ncols());

    ranked_mat
        .par_col_iter_mut()
        .enumerate()
        .for_each(|(col_idx, mut col)| {
            let original_col: Vec<f64> = mat.col(col_idx).iter().copied().collect();
            let ranks = rank_vector(&original_col);

            for (row_idx, &rank) in ranks.iter().enumerate() {
                col[row_idx] = rank;
            }
        });

    ranked_mat
}

/// Select rows of a matrix
///
/// ### Params
///
/// * `mat` - The original matrix.
/// * `rows` - Indices of the rows to keep (in that order).
///
/// ### Returns
///
/// New matrix with only the selected rows.
pub fn select_rows(mat: MatRef<f64>, rows: &[usize]) -> Mat<f64> {
    Mat::from_fn(rows.len(), mat.ncols(), |i, j| mat[(rows[i], j)])
}

/// Select columns of a matrix
///
/// ### Params
///
/// * `mat` - The original matrix.
/// * `cols` - Indices of the columns to keep (in that order).
///
/// ### Returns
///
/// New matrix with only the selected columns.
pub fn select_cols(mat: MatRef<f64>, cols: &[usize]) -> Mat<f64> {
    Mat::from_fn(mat.nrows(), cols.len(), |i, j| mat[(i, cols[j])])
}

///////////
// Tests //
///////////
