//! Small regression models used by the noise and dispersion fits.

use crate::assert_same_len;
use crate::core::errors::{Result, ScFeatError};

////////////////
// Structures //
////////////////

/// Result of a straight line fit `y = intercept + slope * x`
///
/// ### Fields
///
/// * `intercept` - The intercept of the line.
/// * `slope` - The slope of the line.
/// * `iterations` - Number of iterations needed (1 for closed-form fits).
/// * `deviance` - Residual deviance (sum of squares for least squares fits).
#[derive(Clone, Debug, PartialEq)]
pub struct LineFit {
    pub intercept: f64,
    pub slope: f64,
    pub iterations: usize,
    pub deviance: f64,
}

impl LineFit {
    /// Predict the response for a new x value
    #[inline]
    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/////////////
// Helpers //
/////////////

/// Weighted least squares solution for a two parameter line
///
/// ### Params
///
/// * `x` - The predictor.
/// * `y` - The response.
/// * `w` - Non-negative weights.
///
/// ### Returns
///
/// `(intercept, slope)` or `None` if the normal equations are singular.
fn weighted_line(x: &[f64], y: &[f64], w: &[f64]) -> Option<(f64, f64)> {
    let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for i in 0..x.len() {
        sw += w[i];
        swx += w[i] * x[i];
        swy += w[i] * y[i];
        swxx += w[i] * x[i] * x[i];
        swxy += w[i] * x[i] * y[i];
    }

    let det = sw * swxx - swx * swx;
    if det.abs() < 1e-300 || !det.is_finite() {
        return None;
    }
    let slope = (sw * swxy - swx * swy) / det;
    let intercept = (swy - slope * swx) / sw;

    Some((intercept, slope))
}

/// Unit deviance of the gamma family
fn gamma_deviance(y: &[f64], mu: &[f64]) -> f64 {
    2.0 * y
        .iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| -(yi / mi).ln() + (yi - mi) / mi)
        .sum::<f64>()
}

/////////////////
// Line models //
/////////////////

/// Ordinary least squares line fit
///
/// ### Params
///
/// * `x` - The predictor.
/// * `y` - The response.
///
/// ### Returns
///
/// The `LineFit` or an error if fewer than two distinct x values exist.
pub fn ols_line(x: &[f64], y: &[f64]) -> Result<LineFit> {
    assert_same_len!(x, y);

    let w = vec![1.0; x.len()];
    let (intercept, slope) = weighted_line(x, y, &w).ok_or_else(|| {
        ScFeatError::InsufficientData(format!(
            "Least squares fit needs two distinct predictor values ({} points given)",
            x.len()
        ))
    })?;

    let deviance = x
        .iter()
        .zip(y.iter())
        .map(|(&xi, &yi)| (yi - intercept - slope * xi).powi(2))
        .sum();

    Ok(LineFit {
        intercept,
        slope,
        iterations: 1,
        deviance,
    })
}

/// Gamma GLM with identity link for a line
///
/// Fits `E[y] = intercept + slope * x` with `Var(y) ∝ E[y]^2` through
/// iteratively reweighted least squares. Steps that would make a fitted
/// mean non-positive are halved.
///
/// ### Params
///
/// * `x` - The predictor.
/// * `y` - The strictly positive response.
/// * `max_iter` - Maximum number of IRLS iterations.
/// * `tol` - Relative deviance change at which to stop.
///
/// ### Returns
///
/// The `LineFit`.
pub fn gamma_glm_identity(x: &[f64], y: &[f64], max_iter: usize, tol: f64) -> Result<LineFit> {
    assert_same_len!(x, y);

    if y.iter().any(|&v| !(v > 0.0) || !v.is_finite()) {
        return Err(ScFeatError::InvalidParameter(
            "Gamma GLM requires strictly positive finite responses".into(),
        ));
    }

    // mustart = y
    let w: Vec<f64> = y.iter().map(|v| 1.0 / (v * v)).collect();
    let (mut intercept, mut slope) = weighted_line(x, y, &w).ok_or_else(|| {
        ScFeatError::InsufficientData(format!(
            "Gamma GLM needs two distinct predictor values ({} points given)",
            x.len()
        ))
    })?;

    let predict = |a: f64, b: f64| -> Vec<f64> { x.iter().map(|xi| a + b * xi).collect() };

    let mut mu = predict(intercept, slope);
    if mu.iter().any(|&m| m <= 0.0) {
        // fall back to an intercept-only start, which is always positive
        intercept = y.iter().sum::<f64>() / y.len() as f64;
        slope = 0.0;
        mu = predict(intercept, slope);
    }
    let mut deviance = gamma_deviance(y, &mu);
    let mut iterations = 0;

    for iter in 1..=max_iter {
        iterations = iter;
        let w: Vec<f64> = mu.iter().map(|m| 1.0 / (m * m)).collect();
        let (mut new_a, mut new_b) = weighted_line(x, y, &w).ok_or_else(|| {
            ScFeatError::Decomposition("Singular weighted normal equations in gamma GLM".into())
        })?;

        let mut new_mu = predict(new_a, new_b);
        let mut halvings = 0;
        while new_mu.iter().any(|&m| m <= 0.0) {
            halvings += 1;
            if halvings > 30 {
                return Err(ScFeatError::Decomposition(
                    "Gamma GLM could not find a step with positive fitted values".into(),
                ));
            }
            new_a = (new_a + intercept) / 2.0;
            new_b = (new_b + slope) / 2.0;
            new_mu = predict(new_a, new_b);
        }

        let new_dev = gamma_deviance(y, &new_mu);
        let converged = (deviance - new_dev).abs() / (new_dev.abs() + 0.1) < tol;

        intercept = new_a;
        slope = new_b;
        mu = new_mu;
        deviance = new_dev;

        if converged {
            break;
        }
    }

    Ok(LineFit {
        intercept,
        slope,
        iterations,
        deviance,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ols_exact_line() {
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let y: Vec<f64> = x.iter().map(|v| 2.0 + 0.5 * v).collect();
        let fit = ols_line(&x, &y).unwrap();
        assert!((fit.intercept - 2.0).abs() < 1e-12);
        assert!((fit.slope - 0.5).abs() < 1e-12);
        assert!(fit.deviance < 1e-20);
        assert!((fit.predict(4.0) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_ols_degenerate() {
        assert!(ols_line(&[1.0, 1.0], &[2.0, 3.0]).is_err());
    }

    #[test]
    fn test_gamma_glm_recovers_curve() {
        // cv2 = a0 + a1 / mean with multiplicative noise
        let means: Vec<f64> = (1..60).map(|i| i as f64 * 2.0).collect();
        let x: Vec<f64> = means.iter().map(|m| 1.0 / m).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, xi)| {
                let noise = if i % 2 == 0 { 1.05 } else { 0.95 };
                (0.1 + 3.0 * xi) * noise
            })
            .collect();

        let fit = gamma_glm_identity(&x, &y, 100, 1e-10).unwrap();
        assert!((fit.intercept - 0.1).abs() < 0.01, "{:?}", fit);
        assert!((fit.slope - 3.0).abs() < 0.2, "{:?}", fit);
    }

    #[test]
    fn test_gamma_glm_rejects_zero_response() {
        assert!(gamma_glm_identity(&[1.0, 2.0], &[0.0, 1.0], 10, 1e-8).is_err());
    }
}
