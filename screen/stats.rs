//! Small descriptive-statistics helpers shared by the calibration stages.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Standard deviation with the n - 1 divisor.
pub fn sample_sd(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() as f64 - 1.0)).sqrt())
}

/// Column means of a matrix with at least one row.
pub fn column_means(matrix: ArrayView2<f64>) -> Array1<f64> {
    matrix
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(matrix.ncols()))
}

/// Sum of outer products of the centred rows: `cov(rows) * (n - 1)`.
pub fn centered_cross_product(matrix: ArrayView2<f64>) -> Array2<f64> {
    let centered = &matrix - &column_means(matrix).insert_axis(Axis(0));
    centered.t().dot(&centered)
}

/// Sample covariance with the n - 1 divisor. Requires at least two rows.
pub fn sample_covariance(matrix: ArrayView2<f64>) -> Option<Array2<f64>> {
    if matrix.nrows() < 2 {
        return None;
    }
    Some(centered_cross_product(matrix) / (matrix.nrows() as f64 - 1.0))
}

/// Quantile by linear interpolation between order statistics (Hyndman-Fan type 7).
///
/// `sorted` must be ascending and non-empty; `prob` is clamped to `[0, 1]`.
pub fn quantile_sorted(sorted: &[f64], prob: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n as f64 - 1.0) * prob.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Closed numeric range of a set of values, used in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl ValueRange {
    pub fn of<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut range: Option<Self> = None;
        for v in values.into_iter().filter(|v| v.is_finite()) {
            range = Some(match range {
                None => Self {
                    min: v,
                    max: v,
                    count: 1,
                },
                Some(r) => Self {
                    min: r.min.min(v),
                    max: r.max.max(v),
                    count: r.count + 1,
                },
            });
        }
        range
    }
}

impl std::fmt::Display for ValueRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:.4}, {:.4}] (n={})", self.min, self.max, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn type7_quantiles_match_reference_values() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 10.0];
        assert_eq!(quantile_sorted(&sorted, 0.0), 1.0);
        assert_eq!(quantile_sorted(&sorted, 1.0), 10.0);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.2), 1.8, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.8), 5.2, epsilon = 1e-12);
    }

    #[test]
    fn covariance_uses_n_minus_one() {
        let m = array![[1.0, 2.0], [3.0, 6.0], [5.0, 10.0]];
        let cov = sample_covariance(m.view()).unwrap();
        assert_abs_diff_eq!(cov[[0, 0]], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 1]], 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[1, 1]], 16.0, epsilon = 1e-12);
        assert_abs_diff_eq!(centered_cross_product(m.view())[[1, 1]], 32.0, epsilon = 1e-12);
    }

    #[test]
    fn sd_needs_two_values() {
        assert_eq!(sample_sd(&[1.0]), None);
        assert_abs_diff_eq!(sample_sd(&[1.0, 3.0]).unwrap(), 2.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn range_skips_non_finite() {
        let r = ValueRange::of([3.0, f64::NAN, -1.0, 2.0]).unwrap();
        assert_eq!((r.min, r.max, r.count), (-1.0, 3.0, 3));
        assert!(ValueRange::of(std::iter::empty()).is_none());
    }
}
