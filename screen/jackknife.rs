//! Jackknife approximation of the item-parameter Hessian.
//!
//! The leave-one-out differences `d_i = theta_(-i) - theta` give the empirical
//! scatter `S = sum_i (d_i - mean d)(d_i - mean d)^T = cov(D) * (n - 1)`, which
//! approximates N times the asymptotic parameter covariance. Its inverse stands
//! in for the Hessian when scoring influence. The matrix is built once per run.

use crate::config::JackknifeConfig;
use crate::loocv::LoocvResultSet;
use crate::stats::centered_cross_product;
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, Inverse, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JackknifeError {
    #[error("Need at least 2 complete difference rows to estimate a covariance; found {0}.")]
    TooFewRows(usize),
    #[error(
        "Only {usable} of {total} reference respondents produced a usable parameter difference ({fraction:.3}); at least {required:.3} is required."
    )]
    InsufficientCompletion {
        usable: usize,
        total: usize,
        fraction: f64,
        required: f64,
    },
    #[error("Every parameter difference is identical; the jackknife covariance is zero.")]
    ZeroScatter,
    #[error("Linear algebra backend error: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

/// `p x p` Hessian approximation plus its conditioning diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JackknifeHessian {
    pub matrix: Array2<f64>,
    /// Largest over smallest eigenvalue of the scatter matrix before any ridge.
    pub condition_number: f64,
    /// Ridge added to the diagonal before inversion, if regularization was needed.
    pub ridge: Option<f64>,
    /// Number of difference rows the estimate is built from.
    pub rows: usize,
}

impl JackknifeHessian {
    pub fn dimension(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn regularized(&self) -> bool {
        self.ridge.is_some()
    }
}

/// Checks the completion threshold and estimates the Hessian from a LOOCV batch.
pub fn estimate_from_loocv(
    results: &LoocvResultSet,
    config: &JackknifeConfig,
) -> Result<JackknifeHessian, JackknifeError> {
    let fraction = results.completion_fraction();
    if fraction < config.min_completion_fraction {
        return Err(JackknifeError::InsufficientCompletion {
            usable: results.usable_difference_count(),
            total: results.results.len(),
            fraction,
            required: config.min_completion_fraction,
        });
    }
    estimate_hessian(results.difference_matrix().view(), config)
}

/// Inverts the jackknife scatter of `differences` (one row per respondent).
///
/// Rows containing a non-finite value are dropped first.
pub fn estimate_hessian(
    differences: ArrayView2<f64>,
    config: &JackknifeConfig,
) -> Result<JackknifeHessian, JackknifeError> {
    let complete: Vec<usize> = differences
        .outer_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
        .map(|(i, _)| i)
        .collect();
    if complete.len() < differences.nrows() {
        log::warn!(
            "Dropping {} parameter-difference rows with missing values",
            differences.nrows() - complete.len()
        );
    }
    if complete.len() < 2 {
        return Err(JackknifeError::TooFewRows(complete.len()));
    }
    let rows = differences.select(Axis(0), &complete);

    let mut scatter = centered_cross_product(rows.view());
    let p = scatter.nrows();
    let mean_diagonal = scatter.diag().sum() / p as f64;
    if !(mean_diagonal > 0.0) {
        return Err(JackknifeError::ZeroScatter);
    }

    let condition_number = condition_number(&scatter)?;
    let ridge = if condition_number > config.condition_limit {
        let ridge = config.ridge_scale * mean_diagonal;
        log::warn!(
            "Jackknife covariance is ill-conditioned (condition number {condition_number:.3e} > {:.1e}); adding ridge {ridge:.3e}",
            config.condition_limit
        );
        for i in 0..p {
            scatter[[i, i]] += ridge;
        }
        Some(ridge)
    } else {
        None
    };

    let inverse = scatter.inv()?;
    let matrix = (&inverse + &inverse.t()) * 0.5;
    log::info!(
        "Jackknife Hessian estimated from {} rows (p = {p}, condition number {condition_number:.3e}{})",
        complete.len(),
        if ridge.is_some() { ", regularized" } else { "" }
    );

    Ok(JackknifeHessian {
        matrix,
        condition_number,
        ridge,
        rows: complete.len(),
    })
}

/// Ratio of extreme eigenvalues of a symmetric matrix; infinite when not positive definite.
fn condition_number(matrix: &Array2<f64>) -> Result<f64, JackknifeError> {
    let (eigenvalues, _) = matrix.eigh(UPLO::Lower)?;
    let min = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    let max = eigenvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min <= 0.0 {
        Ok(f64::INFINITY)
    } else {
        Ok(max / min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn differences() -> Array2<f64> {
        array![
            [0.10, -0.02, 0.03],
            [-0.04, 0.05, 0.01],
            [0.02, 0.01, -0.06],
            [-0.07, -0.03, 0.02],
            [0.01, 0.04, 0.05],
            [-0.02, -0.05, -0.04],
        ]
    }

    #[test]
    fn hessian_inverts_the_jackknife_scatter() {
        let d = differences();
        let h = estimate_hessian(d.view(), &JackknifeConfig::default()).unwrap();
        assert!(!h.regularized());
        assert_eq!(h.rows, 6);
        let product = h.matrix.dot(&centered_cross_product(d.view()));
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[[i, j]], expected, epsilon = 1e-8);
            }
        }
        assert_abs_diff_eq!(h.matrix[[0, 1]], h.matrix[[1, 0]], epsilon = 0.0);
    }

    #[test]
    fn collinear_differences_are_ridged() {
        let d = array![
            [0.1, 0.2, 0.05],
            [-0.2, -0.4, 0.01],
            [0.3, 0.6, -0.02],
            [0.0, 0.0, 0.03],
        ];
        let h = estimate_hessian(d.view(), &JackknifeConfig::default()).unwrap();
        assert!(h.regularized());
        assert!(h.condition_number > 1e10);
        assert!(h.matrix.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rows_with_missing_values_are_dropped() {
        let mut d = differences();
        d[[2, 1]] = f64::NAN;
        let h = estimate_hessian(d.view(), &JackknifeConfig::default()).unwrap();
        assert_eq!(h.rows, 5);
    }

    #[test]
    fn identical_rows_have_no_scatter() {
        let d = array![[0.1, 0.2], [0.1, 0.2], [0.1, 0.2]];
        assert!(matches!(
            estimate_hessian(d.view(), &JackknifeConfig::default()),
            Err(JackknifeError::ZeroScatter)
        ));
        assert!(matches!(
            estimate_hessian(d.slice(ndarray::s![..1, ..]), &JackknifeConfig::default()),
            Err(JackknifeError::TooFewRows(1))
        ));
    }
}
