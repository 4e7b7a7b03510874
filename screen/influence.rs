// screen/influence.rs

//! # Influence Scoring
//!
//! A Cook's-distance analogue: for a parameter difference `d` of length `p` and
//! the jackknife Hessian `H`, the raw score is `D = d^T H d / p` and the scaled
//! score is `D * N` with `N` the reference sample size. Comparing the scaled
//! score against 4 and against `N` is the classical `D > 4/N` and `D > 1` rule
//! without the dependence on `N`.
//!
//! Reference respondents are scored from their leave-one-out differences.
//! A flagged respondent is scored by fitting the reference set plus that one
//! respondent and differencing against the reference-only fit. Both use the same
//! `H`; it is never re-estimated per respondent.

use crate::config::ScreeningConfig;
use crate::data::{Membership, Respondent, RespondentId, ResponseView};
use crate::index::IndexError;
use crate::jackknife::JackknifeHessian;
use crate::loocv::LoocvResultSet;
use crate::model::{ModelFit, ModelFitter};
use crate::progress::{ScreeningProgressObserver, ScreeningStage, run_stage};
use crate::warm_start::augmented_start;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InfluenceError {
    #[error("Parameter difference for respondent {respondent} has length {found}; the Hessian is {expected} x {expected}.")]
    DimensionMismatch {
        respondent: RespondentId,
        expected: usize,
        found: usize,
    },
    #[error("Respondent index error: {0}")]
    Index(#[from] IndexError),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Raw and sample-size-scaled Cook's distance with its two severity flags.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InfluenceScore {
    pub raw: f64,
    pub scaled: f64,
    /// `scaled > high_threshold`, the `D > 4/N` rule by default.
    pub high: bool,
    /// `scaled > N`, equivalently `D > 1`.
    pub very_high: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfluenceStatus {
    Scored,
    /// The leave-one-out refit produced no usable difference.
    NoParameterDifference,
    WarmStartRejected,
    AugmentedFitNotConverged,
    AugmentedFitFailed,
}

impl InfluenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scored => "scored",
            Self::NoParameterDifference => "no_parameter_difference",
            Self::WarmStartRejected => "warm_start_rejected",
            Self::AugmentedFitNotConverged => "augmented_fit_not_converged",
            Self::AugmentedFitFailed => "augmented_fit_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluenceRecord {
    pub respondent_id: RespondentId,
    pub membership: Membership,
    pub status: InfluenceStatus,
    pub score: Option<InfluenceScore>,
}

/// Scores one parameter difference against the shared Hessian.
pub fn cooks_distance(
    respondent: RespondentId,
    difference: ArrayView1<f64>,
    hessian: &JackknifeHessian,
    reference_size: usize,
    high_threshold: f64,
) -> Result<InfluenceScore, InfluenceError> {
    let p = hessian.dimension();
    if difference.len() != p {
        return Err(InfluenceError::DimensionMismatch {
            respondent,
            expected: p,
            found: difference.len(),
        });
    }
    // H is positive definite; clamp rounding noise on near-zero differences.
    let quadratic = difference.dot(&hessian.matrix.dot(&difference)).max(0.0);
    let raw = quadratic / p as f64;
    let scaled = raw * reference_size as f64;
    Ok(InfluenceScore {
        raw,
        scaled,
        high: scaled > high_threshold,
        very_high: scaled > reference_size as f64,
    })
}

/// Scores every reference respondent from its leave-one-out difference.
pub fn score_reference(
    loocv: &LoocvResultSet,
    hessian: &JackknifeHessian,
    reference_size: usize,
    config: &ScreeningConfig,
) -> Result<Vec<InfluenceRecord>, InfluenceError> {
    loocv
        .results
        .iter()
        .map(|result| {
            let id = result.respondent_id;
            let (status, score) = match &result.parameter_diff {
                Some(diff) => {
                    let diff = Array1::from(diff.clone());
                    let score = cooks_distance(
                        id,
                        diff.view(),
                        hessian,
                        reference_size,
                        config.influence.high_threshold,
                    )?;
                    (InfluenceStatus::Scored, Some(score))
                }
                None => (InfluenceStatus::NoParameterDifference, None),
            };
            Ok(InfluenceRecord {
                respondent_id: id,
                membership: Membership::Reference,
                status,
                score,
            })
        })
        .collect()
}

/// A flagged respondent to score, with its out-of-sample ability as warm start.
#[derive(Debug, Clone)]
pub struct AugmentedCandidate<'a> {
    pub respondent: &'a Respondent,
    pub ability: Array1<f64>,
}

/// Scores flagged respondents through augmented fits, in parallel.
///
/// A failed or non-converged augmented fit is recorded on the respondent and
/// never stops the batch.
pub fn score_augmented<F: ModelFitter + ?Sized>(
    fitter: &F,
    reference: &ResponseView<'_>,
    reference_fit: &ModelFit,
    candidates: &[AugmentedCandidate<'_>],
    hessian: &JackknifeHessian,
    config: &ScreeningConfig,
    progress: &mut dyn ScreeningProgressObserver,
) -> Result<Vec<InfluenceRecord>, InfluenceError> {
    log::info!(
        "Fitting {} augmented models (reference + 1) for flagged-respondent influence",
        candidates.len()
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_count())
        .build()?;
    run_stage(
        &pool,
        ScreeningStage::AugmentedFits,
        candidates,
        progress,
        |candidate| {
            internal::score_one(fitter, reference, reference_fit, candidate, hessian, config)
        },
    )
    .into_iter()
    .collect()
}

mod internal {
    use super::*;

    pub(super) fn score_one<F: ModelFitter + ?Sized>(
        fitter: &F,
        reference: &ResponseView<'_>,
        reference_fit: &ModelFit,
        candidate: &AugmentedCandidate<'_>,
        hessian: &JackknifeHessian,
        config: &ScreeningConfig,
    ) -> Result<InfluenceRecord, InfluenceError> {
        let id = candidate.respondent.id;
        let mut record = InfluenceRecord {
            respondent_id: id,
            membership: candidate.respondent.membership,
            status: InfluenceStatus::AugmentedFitFailed,
            score: None,
        };

        let view = reference.augmented(candidate.respondent)?;
        let start = match augmented_start(
            reference_fit,
            id,
            candidate.ability.view(),
            view.index(),
            &config.warm_start,
        ) {
            Ok(start) => start,
            Err(e) => {
                log::warn!("Respondent {id}: augmented warm start rejected: {e}");
                record.status = InfluenceStatus::WarmStartRejected;
                return Ok(record);
            }
        };

        let fit = match fitter.fit(&view, Some(&start.values)) {
            Ok(fit) => fit,
            Err(e) => {
                log::warn!("Respondent {id}: augmented fit failed: {e}");
                return Ok(record);
            }
        };
        if !fit.convergence.is_converged() {
            log::warn!(
                "Respondent {id}: augmented fit did not converge ({})",
                fit.convergence.as_str()
            );
            record.status = InfluenceStatus::AugmentedFitNotConverged;
            return Ok(record);
        }

        let difference = &fit.items.to_vector() - &reference_fit.items.to_vector();
        record.score = Some(cooks_distance(
            id,
            difference.view(),
            hessian,
            reference.len(),
            config.influence.high_threshold,
        )?);
        record.status = InfluenceStatus::Scored;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Item, ItemBank, Observation, ResponseData};
    use crate::estimate::EstimationError;
    use crate::model::{
        ConvergenceCode, HoldoutFit, InitialValues, ItemParameters, ParameterLayout,
    };
    use crate::progress::NoopScreeningProgress;
    use ndarray::{Array2, array};

    /// Shifts every threshold of its warm start; stalls when `stall_for` is in the data.
    struct ShiftFitter {
        shift: f64,
        stall_for: Option<RespondentId>,
    }

    impl ModelFitter for ShiftFitter {
        fn fit(
            &self,
            data: &ResponseView<'_>,
            init: Option<&InitialValues>,
        ) -> Result<ModelFit, EstimationError> {
            let layout = ParameterLayout::for_bank(data.bank());
            let (mut items, abilities) = match init {
                Some(init) => (init.items.clone(), init.abilities.clone()),
                None => (
                    ItemParameters::neutral(layout),
                    Array2::zeros((data.len(), layout.n_dimensions)),
                ),
            };
            items.thresholds += self.shift;
            let stalled = self
                .stall_for
                .is_some_and(|id| data.index().position(id).is_some());
            Ok(ModelFit {
                items,
                respondent_ids: data.index().ids().to_vec(),
                abilities,
                log_posterior: -1.0,
                convergence: if stalled {
                    ConvergenceCode::IterationLimit
                } else {
                    ConvergenceCode::Converged
                },
                iterations: 1,
                gradient_norm: 0.0,
            })
        }

        fn fit_holdout(
            &self,
            items: &ItemParameters,
            bank: &ItemBank,
            respondent: &Respondent,
        ) -> Result<HoldoutFit, EstimationError> {
            let _ = (items, respondent);
            Ok(HoldoutFit {
                ability: Array1::zeros(bank.dimensions()),
                log_posterior: -1.0,
                convergence: ConvergenceCode::Converged,
            })
        }
    }

    /// Six reference respondents (ids 1..=6) and two flagged ones (7, 8).
    fn dataset() -> ResponseData {
        let bank = ItemBank::new(
            ["x", "y"]
                .iter()
                .map(|id| Item {
                    id: id.to_string(),
                    categories: 3,
                    dimension: 0,
                })
                .collect(),
        )
        .unwrap();
        let respondents = (1..=8)
            .map(|i| Respondent {
                id: RespondentId(i),
                age: 30.0 + i as f64,
                membership: if i <= 6 {
                    Membership::Reference
                } else {
                    Membership::Flagged
                },
                observations: vec![
                    Observation {
                        item: 0,
                        response: (i % 3) as usize,
                    },
                    Observation {
                        item: 1,
                        response: ((i + 1) % 3) as usize,
                    },
                ],
            })
            .collect();
        ResponseData::new(bank, respondents).unwrap()
    }

    fn reference_fit(view: &ResponseView<'_>) -> ModelFit {
        let layout = ParameterLayout::for_bank(view.bank());
        let mut items = ItemParameters::neutral(layout);
        items.thresholds = array![0.25, -0.5];
        ModelFit {
            items,
            respondent_ids: view.index().ids().to_vec(),
            abilities: array![[0.5], [-0.2], [1.1], [-0.9], [0.3], [-0.8]],
            log_posterior: -12.0,
            convergence: ConvergenceCode::Converged,
            iterations: 10,
            gradient_norm: 0.0,
        }
    }

    fn identity_hessian(p: usize) -> JackknifeHessian {
        JackknifeHessian {
            matrix: Array2::eye(p),
            condition_number: 1.0,
            ridge: None,
            rows: 10,
        }
    }

    #[test]
    fn scaled_score_is_raw_times_reference_size() {
        let h = identity_hessian(4);
        let d = array![0.1, -0.2, 0.0, 0.3];
        let s = cooks_distance(RespondentId(1), d.view(), &h, 50, 4.0).unwrap();
        assert!((s.raw - 0.14 / 4.0).abs() < 1e-15);
        assert!((s.scaled - 50.0 * 0.14 / 4.0).abs() < 1e-12);
        assert!(!s.high);
        assert!(!s.very_high);
    }

    #[test]
    fn flags_follow_both_thresholds() {
        let h = identity_hessian(1);
        let high = cooks_distance(RespondentId(1), array![0.5].view(), &h, 20, 4.0).unwrap();
        assert!(high.high && !high.very_high);
        let very = cooks_distance(RespondentId(1), array![1.5].view(), &h, 20, 4.0).unwrap();
        assert!(very.high && very.very_high);
    }

    #[test]
    fn wrong_length_is_a_contract_error() {
        let h = identity_hessian(3);
        assert!(matches!(
            cooks_distance(RespondentId(9), array![1.0, 2.0].view(), &h, 10, 4.0),
            Err(InfluenceError::DimensionMismatch {
                expected: 3,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn flagged_respondent_is_scored_against_reference_only_fit() {
        let data = dataset();
        let reference = data.reference_view(2).unwrap();
        let base = reference_fit(&reference);
        let p = base.layout().len();
        let hessian = JackknifeHessian {
            matrix: Array2::from_diag(&Array1::linspace(1.0, p as f64, p)),
            condition_number: p as f64,
            ridge: None,
            rows: 6,
        };
        let candidates: Vec<AugmentedCandidate<'_>> = [7, 8]
            .iter()
            .map(|&id| AugmentedCandidate {
                respondent: data.respondent(RespondentId(id)).unwrap(),
                ability: array![0.4],
            })
            .collect();
        let fitter = ShiftFitter {
            shift: 0.2,
            stall_for: Some(RespondentId(8)),
        };

        let records = score_augmented(
            &fitter,
            &reference,
            &base,
            &candidates,
            &hessian,
            &ScreeningConfig::default(),
            &mut NoopScreeningProgress,
        )
        .unwrap();
        assert_eq!(records.len(), 2);

        let scored = &records[0];
        assert_eq!(scored.respondent_id, RespondentId(7));
        assert_eq!(scored.membership, Membership::Flagged);
        assert_eq!(scored.status, InfluenceStatus::Scored);

        // d = augmented - reference: 0.2 on both thresholds, zero elsewhere.
        let mut shifted = base.items.clone();
        shifted.thresholds += 0.2;
        let d = &shifted.to_vector() - &base.items.to_vector();
        assert!((d.sum() - 0.4).abs() < 1e-12);
        let quadratic = d.dot(&hessian.matrix.dot(&d));
        let score = scored.score.unwrap();
        assert!((score.raw - quadratic / p as f64).abs() < 1e-12);
        // N is the reference size, not the augmented size.
        assert!((score.scaled - 6.0 * quadratic / p as f64).abs() < 1e-12);

        let stalled = &records[1];
        assert_eq!(stalled.respondent_id, RespondentId(8));
        assert_eq!(stalled.status, InfluenceStatus::AugmentedFitNotConverged);
        assert!(stalled.score.is_none());
    }
}
