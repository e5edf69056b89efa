use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::core::base::utils::scale_matrix_col;
use crate::core::errors::{Result, ScFeatError};

////////////////
// Structures //
////////////////

/// Structure for random SVD results
///
/// ### Fields
///
/// * `u` - Matrix u of the SVD decomposition
/// * `v` - Matrix v of the SVD decomposition
/// * `s` - Singular values of the SVD decomposition
#[derive(Clone, Debug)]
pub struct RandomSvdResults {
    pub u: Mat<f64>,
    pub v: Mat<f64>,
    pub s: Vec<f64>,
}

/// Structure for PCA results
///
/// ### Fields
///
/// * `scores` - The observations projected onto the components
///   (observations x components).
/// * `loadings` - The rotation matrix (variables x components).
/// * `sdev` - Standard deviation of each component.
/// * `var_explained` - Proportion of the total variance per component.
#[derive(Clone, Debug)]
pub struct PcaResult {
    pub scores: Mat<f64>,
    pub loadings: Mat<f64>,
    pub sdev: Vec<f64>,
    pub var_explained: Vec<f64>,
}

///////////////
// Functions //
///////////////

/// Randomised SVD
///
/// ### Params
///
/// * `x` - The matrix on which to apply the randomised SVD.
/// * `rank` - The target rank of the approximation (number of singular values,
///   vectors to compute).
/// * `seed` - Random seed for reproducible results.
/// * `oversampling` - Additional samples beyond the target rank to improve
///   accuracy. Defaults to 10 if not specified.
/// * `n_power_iter` - Number of power iterations to perform for better
///   approximation quality. Defaults to 2 if not specified.
///
/// ### Returns
///
/// The randomised SVD results in form of `RandomSvdResults`.
///
/// ### Algorithm Details
///
/// 1. Generate a random Gaussian matrix Ω of size n × (rank + oversampling)
/// 2. Compute Y = X * Ω to capture the range of X
/// 3. Orthogonalize Y using QR decomposition to get Q
/// 4. Apply power iterations: for each iteration, compute Z = X^T * Q, then Q = QR(X * Z)
/// 5. Form B = Q^T * X and compute its SVD
/// 6. Reconstruct the final SVD: U = Q * U_B, V = V_B, S = S_B
pub fn randomised_svd(
    x: MatRef<f64>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> Result<RandomSvdResults> {
    let ncol = x.ncols();
    let nrow = x.nrows();

    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);

    let mut rng = StdRng::seed_from_u64(seed);
    let omega = Mat::from_fn(ncol, sample_size, |_, _| rng.sample::<f64, _>(StandardNormal));

    let y = x * omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * &q;
        q = (x * z).qr().compute_thin_Q();
    }
    crate::assert_nrows!(q, x);

    let b = q.transpose() * x;
    let svd = b
        .thin_svd()
        .map_err(|e| ScFeatError::Decomposition(format!("{:?}", e)))?;

    Ok(RandomSvdResults {
        u: &q * svd.U(),
        v: svd.V().to_owned(),
        s: svd.S().column_vector().iter().copied().collect(),
    })
}

/// Principal component analysis
///
/// Rows are the observations, columns the variables. Every column is
/// centred (and optionally scaled) before the decomposition, as `prcomp()`
/// would do.
///
/// ### Params
///
/// * `x` - The data matrix (observations x variables).
/// * `no_pcs` - Number of components to return. Capped at the matrix rank
///   bound `min(nrow, ncol)`.
/// * `scale` - Shall the columns be scaled to unit variance.
/// * `random_svd` - Use the randomised SVD instead of the exact thin SVD.
/// * `seed` - Seed for the randomised SVD.
///
/// ### Returns
///
/// The `PcaResult`.
pub fn pca(
    x: MatRef<f64>,
    no_pcs: usize,
    scale: bool,
    random_svd: bool,
    seed: u64,
) -> Result<PcaResult> {
    let (nrow, ncol) = x.shape();
    if nrow < 2 || ncol < 1 {
        return Err(ScFeatError::InsufficientData(format!(
            "PCA needs at least 2 observations and 1 variable, got {} x {}",
            nrow, ncol
        )));
    }
    let no_pcs = no_pcs.min(nrow.min(ncol)).max(1);

    let centred = scale_matrix_col(&x, scale);

    let (v, s) = if random_svd {
        let res = randomised_svd(centred.as_ref(), no_pcs, seed, None, None)?;
        (res.v, res.s)
    } else {
        let svd = centred
            .thin_svd()
            .map_err(|e| ScFeatError::Decomposition(format!("{:?}", e)))?;
        let s: Vec<f64> = svd.S().column_vector().iter().copied().collect();
        (svd.V().to_owned(), s)
    };

    let no_pcs = no_pcs.min(v.ncols());
    let loadings = v.submatrix(0, 0, ncol, no_pcs).to_owned();
    let scores = &centred * &loadings;

    let total_var: f64 = centred
        .col_iter()
        .map(|c| c.iter().map(|v| v * v).sum::<f64>())
        .sum::<f64>();
    let sdev: Vec<f64> = s
        .iter()
        .take(no_pcs)
        .map(|si| si / ((nrow - 1) as f64).sqrt())
        .collect();
    let var_explained: Vec<f64> = s
        .iter()
        .take(no_pcs)
        .map(|si| if total_var > 0.0 { si * si / total_var } else { 0.0 })
        .collect();

    Ok(PcaResult {
        scores,
        loadings,
        sdev,
        var_explained,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn rank_two_matrix() -> Mat<f64> {
        // 30 observations, 5 variables, dominated by two directions
        Mat::from_fn(30, 5, |i, j| {
            let a = (i as f64 * 0.7).sin() * 5.0;
            let b = (i as f64 * 0.3).cos() * 2.0;
            match j {
                0 => a,
                1 => a * 0.5 + b,
                2 => b,
                3 => -a + 0.01 * i as f64,
                _ => 0.1 * b,
            }
        })
    }

    #[test]
    fn test_pca_variance_explained() {
        let x = rank_two_matrix();
        let res = pca(x.as_ref(), 3, false, false, 42).unwrap();

        assert_eq!(res.scores.nrows(), 30);
        assert_eq!(res.loadings.nrows(), 5);
        assert_eq!(res.loadings.ncols(), 3);
        let first_two: f64 = res.var_explained.iter().take(2).sum();
        assert!(first_two > 0.99, "{}", first_two);
        assert!(res.sdev[0] >= res.sdev[1]);
    }

    #[test]
    fn test_random_svd_matches_exact() {
        let x = rank_two_matrix();
        let exact = pca(x.as_ref(), 2, false, false, 42).unwrap();
        let approx = pca(x.as_ref(), 2, false, true, 42).unwrap();
        for k in 0..2 {
            let rel = (exact.sdev[k] - approx.sdev[k]).abs() / exact.sdev[k];
            assert!(rel < 1e-6, "component {}: {}", k, rel);
        }
    }

    #[test]
    fn test_pca_too_small() {
        let x = Mat::<f64>::zeros(1, 3);
        assert!(pca(x.as_ref(), 2, false, false, 1).is_err());
    }
}
