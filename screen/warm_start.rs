//! Warm-start construction for leave-one-out and augmented refits.
//!
//! Item parameters are copied unchanged from the source fit. Abilities are taken
//! from the source fit for every respondent the target view keeps, renormalized to
//! the identification constraint, and checked against it before the optimizer
//! ever sees them.

use crate::config::{WarmStartConfig, WarmStartStrategy};
use crate::data::RespondentId;
use crate::index::{IndexError, RespondentIndex};
use crate::model::{InitialValues, ModelFit};
use crate::stats::{column_means, sample_covariance};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Cholesky, Inverse, UPLO};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WarmStartError {
    #[error("Respondent {0} is in the target view but has no ability in the source fit.")]
    MissingAbility(RespondentId),
    #[error("Respondent {0} was meant to be excluded but is still in the target view.")]
    ExcludedStillPresent(RespondentId),
    #[error("Extra ability has {found} dimensions; the source fit has {expected}.")]
    AbilityWidth { expected: usize, found: usize },
    #[error(
        "Warm start violates the identification constraint: max |mean| {max_mean_error:.3e}, max covariance error {max_covariance_error:.3e} (tolerance {tolerance:.1e})."
    )]
    ConstraintViolated {
        max_mean_error: f64,
        max_covariance_error: f64,
        tolerance: f64,
    },
    #[error("Source fit index is inconsistent: {0}")]
    Index(#[from] IndexError),
}

/// Validated initial values plus the normalization that actually produced them.
#[derive(Debug, Clone)]
pub struct WarmStart {
    pub values: InitialValues,
    pub strategy: WarmStartStrategy,
}

/// Initial values for the fit that excludes `excluded`, rows ordered by `target`.
pub fn leave_one_out_start(
    full: &ModelFit,
    excluded: RespondentId,
    target: &RespondentIndex,
    config: &WarmStartConfig,
) -> Result<WarmStart, WarmStartError> {
    if target.position(excluded).is_some() {
        return Err(WarmStartError::ExcludedStillPresent(excluded));
    }
    let abilities = gather(full, target, None)?;
    finish(full, abilities, config)
}

/// Initial values for the reference set plus one extra respondent.
pub fn augmented_start(
    reference: &ModelFit,
    extra: RespondentId,
    extra_ability: ArrayView1<f64>,
    target: &RespondentIndex,
    config: &WarmStartConfig,
) -> Result<WarmStart, WarmStartError> {
    let width = reference.abilities.ncols();
    if extra_ability.len() != width {
        return Err(WarmStartError::AbilityWidth {
            expected: width,
            found: extra_ability.len(),
        });
    }
    let abilities = gather(reference, target, Some((extra, extra_ability)))?;
    finish(reference, abilities, config)
}

/// Latent correlation matrix implied by a fit.
pub fn latent_correlation_matrix(fit: &ModelFit) -> Array2<f64> {
    let dims = fit.abilities.ncols();
    let mut r = Array2::eye(dims);
    if dims == 2 {
        let rho = fit.items.latent_correlation();
        r[[0, 1]] = rho;
        r[[1, 0]] = rho;
    }
    r
}

fn gather(
    source: &ModelFit,
    target: &RespondentIndex,
    extra: Option<(RespondentId, ArrayView1<f64>)>,
) -> Result<Array2<f64>, WarmStartError> {
    let source_index = source.index()?;
    let dims = source.abilities.ncols();
    let mut out = Array2::zeros((target.len(), dims));
    for (slot, id) in target.ids().iter().enumerate() {
        let row = match (source_index.position(*id), &extra) {
            (Some(position), _) => source.abilities.row(position),
            (None, Some((extra_id, ability))) if extra_id == id => ability.view(),
            (None, _) => return Err(WarmStartError::MissingAbility(*id)),
        };
        out.row_mut(slot).assign(&row);
    }
    Ok(out)
}

fn finish(
    source: &ModelFit,
    abilities: Array2<f64>,
    config: &WarmStartConfig,
) -> Result<WarmStart, WarmStartError> {
    let target_cov = latent_correlation_matrix(source);
    let centered = center(abilities.view());

    let (abilities, strategy) = match config.strategy {
        WarmStartStrategy::MeanCentered => (centered, WarmStartStrategy::MeanCentered),
        WarmStartStrategy::CorrelationConsistent => {
            match recolor(centered.view(), target_cov.view()) {
                Some(recolored) => (recolored, WarmStartStrategy::CorrelationConsistent),
                None => {
                    log::debug!(
                        "Sample ability covariance is singular; falling back to mean-centered warm start."
                    );
                    (centered, WarmStartStrategy::MeanCentered)
                }
            }
        }
    };

    check_constraint(abilities.view(), target_cov.view(), strategy, config.tolerance)?;

    Ok(WarmStart {
        values: InitialValues {
            items: source.items.clone(),
            abilities,
        },
        strategy,
    })
}

fn center(abilities: ArrayView2<f64>) -> Array2<f64> {
    if abilities.nrows() == 0 {
        return abilities.to_owned();
    }
    &abilities - &column_means(abilities).insert_axis(Axis(0))
}

/// Maps centred abilities to a set whose sample covariance is exactly `target`.
fn recolor(centered: ArrayView2<f64>, target: ArrayView2<f64>) -> Option<Array2<f64>> {
    let sample = sample_covariance(centered)?;
    let l_sample = sample.cholesky(UPLO::Lower).ok()?;
    let l_target = target.to_owned().cholesky(UPLO::Lower).ok()?;
    let transform = l_target.dot(&l_sample.inv().ok()?);
    let out = centered.dot(&transform.t());
    out.iter().all(|v| v.is_finite()).then_some(out)
}

fn check_constraint(
    abilities: ArrayView2<f64>,
    target_cov: ArrayView2<f64>,
    strategy: WarmStartStrategy,
    tolerance: f64,
) -> Result<(), WarmStartError> {
    if abilities.nrows() == 0 {
        return Ok(());
    }
    let max_mean_error = column_means(abilities)
        .iter()
        .fold(0.0_f64, |acc, m| acc.max(m.abs()));
    let max_covariance_error = match strategy {
        WarmStartStrategy::MeanCentered => 0.0,
        WarmStartStrategy::CorrelationConsistent => match sample_covariance(abilities) {
            Some(cov) => (&cov - &target_cov)
                .iter()
                .fold(0.0_f64, |acc, e| acc.max(e.abs())),
            None => f64::INFINITY,
        },
    };
    if max_mean_error > tolerance || max_covariance_error > tolerance {
        return Err(WarmStartError::ConstraintViolated {
            max_mean_error,
            max_covariance_error,
            tolerance,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConvergenceCode, ItemParameters, ParameterLayout};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn fit_with(abilities: Array2<f64>, rho: f64) -> ModelFit {
        let n = abilities.nrows();
        let mut items = ItemParameters::neutral(ParameterLayout {
            n_items: 4,
            n_dimensions: 2,
        });
        items.correlation = Some(rho);
        ModelFit {
            items,
            respondent_ids: (0..n as u64).map(RespondentId).collect(),
            abilities,
            log_posterior: -10.0,
            convergence: ConvergenceCode::Converged,
            iterations: 1,
            gradient_norm: 0.0,
        }
    }

    fn sample_abilities() -> Array2<f64> {
        array![
            [0.9, 0.4],
            [-0.3, -0.8],
            [1.4, 1.1],
            [-1.2, -0.2],
            [0.1, 0.7],
            [-0.6, -1.0],
        ]
    }

    #[test]
    fn correlation_consistent_start_matches_latent_covariance() {
        let full = fit_with(sample_abilities(), 0.35);
        let target =
            RespondentIndex::from_ids([0, 1, 3, 4, 5].into_iter().map(RespondentId)).unwrap();
        let start =
            leave_one_out_start(&full, RespondentId(2), &target, &WarmStartConfig::default())
                .unwrap();

        assert_eq!(start.strategy, WarmStartStrategy::CorrelationConsistent);
        assert_eq!(start.values.items, full.items);
        let abilities = &start.values.abilities;
        assert_eq!(abilities.dim(), (5, 2));
        let cov = sample_covariance(abilities.view()).unwrap();
        assert_abs_diff_eq!(cov[[0, 0]], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(cov[[1, 1]], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(cov[[0, 1]], 0.35, epsilon = 1e-10);
        for m in column_means(abilities.view()).iter() {
            assert_abs_diff_eq!(*m, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn mean_centered_start_preserves_spread() {
        let full = fit_with(sample_abilities(), 0.35);
        let target =
            RespondentIndex::from_ids([5, 4, 3, 2, 1].into_iter().map(RespondentId)).unwrap();
        let config = WarmStartConfig {
            strategy: WarmStartStrategy::MeanCentered,
            ..WarmStartConfig::default()
        };
        let start = leave_one_out_start(&full, RespondentId(0), &target, &config).unwrap();
        let abilities = &start.values.abilities;
        // Rows follow the target order, so respondent 5 comes first.
        let kept_mean = (-0.6 + 0.1 - 1.2 + 1.4 - 0.3) / 5.0;
        assert_abs_diff_eq!(abilities[[0, 0]], -0.6 - kept_mean, epsilon = 1e-12);
        assert_abs_diff_eq!(abilities[[1, 0]] - abilities[[0, 0]], 0.7, epsilon = 1e-12);
    }

    #[test]
    fn excluded_respondent_must_be_absent() {
        let full = fit_with(sample_abilities(), 0.0);
        let target = RespondentIndex::from_ids((0..6).map(RespondentId)).unwrap();
        let err = leave_one_out_start(&full, RespondentId(3), &target, &WarmStartConfig::default())
            .unwrap_err();
        assert!(matches!(err, WarmStartError::ExcludedStillPresent(RespondentId(3))));
    }

    #[test]
    fn singular_sample_covariance_falls_back_to_centering() {
        let full = fit_with(array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]], 0.2);
        let target = RespondentIndex::from_ids([0, 1].into_iter().map(RespondentId)).unwrap();
        let start =
            leave_one_out_start(&full, RespondentId(2), &target, &WarmStartConfig::default())
                .unwrap();
        assert_eq!(start.strategy, WarmStartStrategy::MeanCentered);
    }

    #[test]
    fn augmented_start_appends_extra_ability() {
        let full = fit_with(sample_abilities(), 0.1);
        let target = RespondentIndex::from_ids((0..7).map(RespondentId)).unwrap();
        let config = WarmStartConfig {
            strategy: WarmStartStrategy::MeanCentered,
            ..WarmStartConfig::default()
        };
        let start =
            augmented_start(&full, RespondentId(6), array![2.0, -2.0].view(), &target, &config)
                .unwrap();
        assert_eq!(start.values.abilities.nrows(), 7);
        let missing = RespondentIndex::from_ids((0..8).map(RespondentId)).unwrap();
        assert!(matches!(
            augmented_start(&full, RespondentId(6), array![2.0, -2.0].view(), &missing, &config),
            Err(WarmStartError::MissingAbility(RespondentId(7)))
        ));
    }
}
