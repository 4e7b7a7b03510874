//! Scoring of respondents outside the reference fit against the frozen
//! reference item parameters. No item parameter is refitted here.

use crate::config::ScreeningConfig;
use crate::data::{ItemBank, Membership, Respondent, RespondentId};
use crate::model::{ConvergenceCode, ModelFit, ModelFitter, ParameterLayout};
use crate::progress::{ScreeningProgressObserver, ScreeningStage, run_stage};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutOfSampleError {
    #[error("Reference fit has layout {found:?}; the item bank requires {expected:?}.")]
    LayoutMismatch {
        expected: ParameterLayout,
        found: ParameterLayout,
    },
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStatus {
    Scored,
    /// Fewer observed items than the minimum. A policy outcome, not a failure.
    InsufficientData,
    NotConverged,
    Failed,
}

impl ScoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scored => "scored",
            Self::InsufficientData => "insufficient_data",
            Self::NotConverged => "not_converged",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfSampleScore {
    pub respondent_id: RespondentId,
    pub membership: Membership,
    pub item_count: usize,
    pub status: ScoreStatus,
    pub convergence: Option<ConvergenceCode>,
    pub log_posterior: Option<f64>,
    pub fit_quality: Option<f64>,
    pub ability: Option<Vec<f64>>,
}

impl OutOfSampleScore {
    pub fn is_scored(&self) -> bool {
        self.status == ScoreStatus::Scored
    }
}

/// Scores one respondent. Never fails; the outcome is carried in `status`.
pub fn score_respondent<F: ModelFitter + ?Sized>(
    fitter: &F,
    reference_fit: &ModelFit,
    bank: &ItemBank,
    respondent: &Respondent,
    min_items: usize,
) -> OutOfSampleScore {
    let mut score = OutOfSampleScore {
        respondent_id: respondent.id,
        membership: respondent.membership,
        item_count: respondent.item_count(),
        status: ScoreStatus::InsufficientData,
        convergence: None,
        log_posterior: None,
        fit_quality: None,
        ability: None,
    };
    if !respondent.has_minimum_data(min_items) {
        log::debug!(
            "Respondent {}: {} items observed, below the minimum of {min_items}",
            respondent.id,
            respondent.item_count()
        );
        return score;
    }

    match fitter.fit_holdout(&reference_fit.items, bank, respondent) {
        Ok(holdout) => {
            score.convergence = Some(holdout.convergence);
            if holdout.convergence.is_converged() {
                score.status = ScoreStatus::Scored;
                score.log_posterior = Some(holdout.log_posterior);
                score.fit_quality = Some(holdout.log_posterior / respondent.item_count() as f64);
                score.ability = Some(holdout.ability.to_vec());
            } else {
                log::warn!(
                    "Respondent {}: out-of-sample fit did not converge ({})",
                    respondent.id,
                    holdout.convergence.as_str()
                );
                score.status = ScoreStatus::NotConverged;
            }
        }
        Err(e) => {
            log::warn!("Respondent {}: out-of-sample fit failed: {e}", respondent.id);
            score.status = ScoreStatus::Failed;
        }
    }
    score
}

/// Scores every given respondent in parallel; output order follows input order.
pub fn score_out_of_sample<F: ModelFitter + ?Sized>(
    fitter: &F,
    reference_fit: &ModelFit,
    bank: &ItemBank,
    respondents: &[&Respondent],
    config: &ScreeningConfig,
    progress: &mut dyn ScreeningProgressObserver,
) -> Result<Vec<OutOfSampleScore>, OutOfSampleError> {
    let expected = ParameterLayout::for_bank(bank);
    if reference_fit.layout() != expected {
        return Err(OutOfSampleError::LayoutMismatch {
            expected,
            found: reference_fit.layout(),
        });
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_count())
        .build()?;
    let scores = run_stage(
        &pool,
        ScreeningStage::OutOfSample,
        respondents,
        progress,
        |r| score_respondent(fitter, reference_fit, bank, r, config.min_items),
    );

    let insufficient = scores
        .iter()
        .filter(|s| s.status == ScoreStatus::InsufficientData)
        .count();
    let scored = scores.iter().filter(|s| s.is_scored()).count();
    log::info!(
        "Out-of-sample scoring: {scored} scored, {insufficient} with insufficient data, {} not converged",
        scores.len() - scored - insufficient
    );
    Ok(scores)
}
