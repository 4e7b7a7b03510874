// ========================================================================================
//                                The screening pipeline
// ========================================================================================
//
// Stage order is fixed: reference fit, leave-one-out batch, then everything that
// reads the batch (distribution, Hessian, influence), then out-of-sample scoring,
// augmented fits, weights and thresholds. Nothing after the batch starts until
// the batch has been reduced.

use crate::config::ScreeningConfig;
use crate::data::{Membership, Respondent, ResponseData, ResponseView};
use crate::distribution::{DistributionError, ReferenceDistribution};
use crate::estimate::{AgeScaling, EstimationError, GrmFitter};
use crate::index::IndexError;
use crate::influence::{
    AugmentedCandidate, InfluenceError, InfluenceRecord, InfluenceStatus, score_augmented,
    score_reference,
};
use crate::jackknife::{JackknifeError, JackknifeHessian, estimate_from_loocv};
use crate::loocv::{LoocvError, LoocvResultSet, run_loocv};
use crate::model::{ModelFit, ModelFitter};
use crate::out_of_sample::{OutOfSampleError, OutOfSampleScore, ScoreStatus, score_out_of_sample};
use crate::progress::ScreeningProgressObserver;
use crate::report::{self, ReportError, ScreeningSummary};
use crate::stats::ValueRange;
use crate::threshold::{LabeledScore, ThresholdReport, select_thresholds};
use crate::weights::{WeightInput, WeightTable, assign_weights};

use ndarray::Array1;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScreeningError {
    #[error("No reference respondent has at least {0} observed items.")]
    NoReferenceRespondents(usize),
    #[error("The reference model did not converge ({0}); nothing downstream is meaningful.")]
    ReferenceFitNotConverged(&'static str),
    #[error("Respondent index error: {0}")]
    Index(#[from] IndexError),
    #[error("Reference model estimation failed: {0}")]
    Estimation(#[from] EstimationError),
    #[error("Leave-one-out failed: {0}")]
    Loocv(#[from] LoocvError),
    #[error("Reference distribution is unusable: {0}")]
    Distribution(#[from] DistributionError),
    #[error("Jackknife Hessian estimation failed: {0}")]
    Jackknife(#[from] JackknifeError),
    #[error("Influence scoring failed: {0}")]
    Influence(#[from] InfluenceError),
    #[error("Out-of-sample scoring failed: {0}")]
    OutOfSample(#[from] OutOfSampleError),
    #[error("Failed to write artifacts: {0}")]
    Report(#[from] ReportError),
}

/// Every product of one screening run.
#[derive(Debug, Clone)]
pub struct ScreeningOutcome {
    pub reference_fit: ModelFit,
    pub loocv: LoocvResultSet,
    pub distribution: ReferenceDistribution,
    pub hessian: JackknifeHessian,
    pub influence: Vec<InfluenceRecord>,
    pub out_of_sample: Vec<OutOfSampleScore>,
    pub weights: WeightTable,
    pub thresholds: ThresholdReport,
    pub summary: ScreeningSummary,
}

/// The production fitter, with age standardized over the reference view.
pub fn grm_fitter_for(reference: &ResponseView<'_>, config: &ScreeningConfig) -> GrmFitter {
    let age = AgeScaling::from_ages(reference.respondents().iter().map(|r| r.age));
    log::debug!("Age standardization: centre {:.3}, scale {:.3}", age.center, age.scale);
    GrmFitter::new(config.fitter, age)
}

/// Reference respondents with enough data to enter the reference fit.
pub fn reference_view<'a>(
    data: &'a ResponseData,
    config: &ScreeningConfig,
) -> Result<ResponseView<'a>, ScreeningError> {
    let view = data.reference_view(config.min_items)?;
    if view.is_empty() {
        return Err(ScreeningError::NoReferenceRespondents(config.min_items));
    }
    Ok(view)
}

/// Fits the reference-only model and insists on convergence.
pub fn fit_reference_model<F: ModelFitter + ?Sized>(
    fitter: &F,
    reference: &ResponseView<'_>,
) -> Result<ModelFit, ScreeningError> {
    log::info!(
        "Fitting reference model: {} respondents, {} items, {} dimensions",
        reference.len(),
        reference.bank().len(),
        reference.bank().dimensions()
    );
    let fit = fitter.fit(reference, None)?;
    if !fit.convergence.is_converged() {
        return Err(ScreeningError::ReferenceFitNotConverged(fit.convergence.as_str()));
    }
    log::info!(
        "Reference model converged after {} iterations (log-posterior {:.4})",
        fit.iterations,
        fit.log_posterior
    );
    Ok(fit)
}

/// Runs the complete screening pipeline on validated data.
pub fn run_screening<F: ModelFitter + ?Sized>(
    fitter: &F,
    data: &ResponseData,
    config: &ScreeningConfig,
    checkpoint: Option<&Path>,
    progress: &mut dyn ScreeningProgressObserver,
) -> Result<ScreeningOutcome, ScreeningError> {
    let reference = reference_view(data, config)?;
    let reference_fit = fit_reference_model(fitter, &reference)?;

    // --- Leave-one-out and everything that reads the completed batch ---
    let loocv = run_loocv(fitter, &reference, &reference_fit, config, checkpoint, progress)?;
    let distribution = ReferenceDistribution::from_scores(&loocv.fit_qualities())?;
    let hessian = estimate_from_loocv(&loocv, &config.jackknife)?;
    let mut influence = score_reference(&loocv, &hessian, reference.len(), config)?;

    // --- Respondents outside the reference fit ---
    let outside: Vec<&Respondent> = data
        .respondents()
        .iter()
        .filter(|r| reference.index().position(r.id).is_none())
        .collect();
    let out_of_sample = score_out_of_sample(
        fitter,
        &reference_fit,
        data.bank(),
        &outside,
        config,
        progress,
    )?;

    if config.influence.score_flagged {
        let candidates = internal::augmented_candidates(data, &out_of_sample);
        let augmented = score_augmented(
            fitter,
            &reference,
            &reference_fit,
            &candidates,
            &hessian,
            config,
            progress,
        )?;
        influence.extend(augmented);
    }

    let weight_inputs = internal::weight_inputs(&loocv, &out_of_sample);
    let weights = assign_weights(&distribution, &weight_inputs, &config.weighting);

    let labeled = internal::labeled_scores(&loocv, &out_of_sample, &distribution);
    let thresholds = select_thresholds(&labeled);

    let summary = internal::summarize(
        data,
        config,
        &reference_fit,
        &loocv,
        &distribution,
        &hessian,
        &influence,
        &out_of_sample,
        &weights,
        &labeled,
    );
    log::info!("{summary}");

    Ok(ScreeningOutcome {
        reference_fit,
        loocv,
        distribution,
        hessian,
        influence,
        out_of_sample,
        weights,
        thresholds,
        summary,
    })
}

/// Writes every artifact of a run into `out_dir`.
pub fn write_artifacts(outcome: &ScreeningOutcome, out_dir: &Path) -> Result<(), ScreeningError> {
    let layout = outcome.reference_fit.layout();
    let path = |file| report::artifact_path(out_dir, file);

    outcome
        .reference_fit
        .save(&path(report::REFERENCE_MODEL_FILE)?)
        .map_err(ReportError::from)?;
    report::write_loocv_results(&path(report::LOOCV_RESULTS_FILE)?, &outcome.loocv, layout)?;
    report::write_hessian(&path(report::HESSIAN_FILE)?, &outcome.hessian, layout)?;
    report::write_influence(&path(report::INFLUENCE_FILE)?, &outcome.influence)?;
    report::write_out_of_sample(
        &path(report::OUT_OF_SAMPLE_FILE)?,
        &outcome.out_of_sample,
        &outcome.distribution,
    )?;
    report::write_quintile_boundaries(
        &path(report::QUINTILE_FILE)?,
        &outcome.distribution.boundaries,
    )?;
    report::write_weights(&path(report::WEIGHTS_FILE)?, &outcome.weights)?;
    report::write_strata(&path(report::STRATA_FILE)?, &outcome.weights)?;
    report::write_toml(&path(report::THRESHOLD_REPORT_FILE)?, &outcome.thresholds)?;
    report::write_toml(&path(report::SUMMARY_FILE)?, &outcome.summary)?;
    log::info!("Artifacts written to {}", out_dir.display());
    Ok(())
}

mod internal {
    use super::*;

    /// Flagged respondents whose out-of-sample fit converged.
    pub(super) fn augmented_candidates<'a>(
        data: &'a ResponseData,
        scores: &[OutOfSampleScore],
    ) -> Vec<AugmentedCandidate<'a>> {
        scores
            .iter()
            .filter(|s| s.membership == Membership::Flagged && s.is_scored())
            .filter_map(|s| {
                let respondent = data.respondent(s.respondent_id)?;
                let ability = Array1::from(s.ability.clone()?);
                Some(AugmentedCandidate {
                    respondent,
                    ability,
                })
            })
            .collect()
    }

    pub(super) fn weight_inputs(
        loocv: &LoocvResultSet,
        out_of_sample: &[OutOfSampleScore],
    ) -> Vec<WeightInput> {
        let reference = loocv.results.iter().map(|r| WeightInput {
            respondent_id: r.respondent_id,
            membership: Membership::Reference,
            fit_quality: r.fit_quality,
            sufficient: true,
        });
        let outside = out_of_sample.iter().map(|s| WeightInput {
            respondent_id: s.respondent_id,
            membership: s.membership,
            fit_quality: s.fit_quality,
            sufficient: s.status != ScoreStatus::InsufficientData,
        });
        reference.chain(outside).collect()
    }

    /// Reference z-scores from leave-one-out and flagged z-scores from frozen items.
    pub(super) fn labeled_scores(
        loocv: &LoocvResultSet,
        out_of_sample: &[OutOfSampleScore],
        distribution: &ReferenceDistribution,
    ) -> Vec<LabeledScore> {
        let reference = loocv.completed().filter_map(|r| r.fit_quality).map(|f| LabeledScore {
            z: distribution.z_score(f),
            flagged: false,
        });
        let flagged = out_of_sample
            .iter()
            .filter(|s| s.membership == Membership::Flagged)
            .filter_map(|s| s.fit_quality)
            .map(|f| LabeledScore {
                z: distribution.z_score(f),
                flagged: true,
            });
        reference.chain(flagged).collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn summarize(
        data: &ResponseData,
        config: &ScreeningConfig,
        reference_fit: &ModelFit,
        loocv: &LoocvResultSet,
        distribution: &ReferenceDistribution,
        hessian: &JackknifeHessian,
        influence: &[InfluenceRecord],
        out_of_sample: &[OutOfSampleScore],
        weights: &WeightTable,
        labeled: &[LabeledScore],
    ) -> ScreeningSummary {
        let count = |membership: Membership, sufficient: bool| {
            data.respondents()
                .iter()
                .filter(|r| r.membership == membership)
                .filter(|r| r.has_minimum_data(config.min_items) == sufficient)
                .count()
        };
        let reference_insufficient = count(Membership::Reference, false);
        let flagged_insufficient = count(Membership::Flagged, false);

        let augmented: Vec<&InfluenceRecord> = influence
            .iter()
            .filter(|r| r.membership == Membership::Flagged)
            .collect();
        let scores = || influence.iter().filter_map(|r| r.score);

        ScreeningSummary {
            reference_count: reference_insufficient + count(Membership::Reference, true),
            flagged_count: flagged_insufficient + count(Membership::Flagged, true),
            reference_insufficient,
            flagged_insufficient,
            reference_fit_converged: reference_fit.convergence.is_converged(),
            loocv_units: loocv.results.len(),
            loocv_refit_convergence_rate: loocv.refit_convergence_rate(),
            loocv_holdout_convergence_rate: loocv.holdout_convergence_rate(),
            out_of_sample_scored: out_of_sample.iter().filter(|s| s.is_scored()).count(),
            out_of_sample_not_converged: out_of_sample
                .iter()
                .filter(|s| matches!(s.status, ScoreStatus::NotConverged | ScoreStatus::Failed))
                .count(),
            augmented_attempted: augmented.len(),
            augmented_scored: augmented
                .iter()
                .filter(|r| r.status == InfluenceStatus::Scored)
                .count(),
            hessian_rows: hessian.rows,
            hessian_condition_number: hessian.condition_number,
            hessian_regularized: hessian.regularized(),
            hessian_ridge: hessian.ridge,
            reference_mean: distribution.mean,
            reference_sd: distribution.sd,
            quintile_cuts: distribution.boundaries.cuts,
            fit_quality_range: ValueRange::of(
                loocv
                    .completed()
                    .filter_map(|r| r.fit_quality)
                    .chain(out_of_sample.iter().filter_map(|s| s.fit_quality)),
            ),
            z_score_range: ValueRange::of(labeled.iter().map(|s| s.z)),
            scaled_influence_range: ValueRange::of(scores().map(|s| s.scaled)),
            weight_range: ValueRange::of(weights.records.iter().filter_map(|r| r.weight.value())),
            high_influence_count: scores().filter(|s| s.high).count(),
            very_high_influence_count: scores().filter(|s| s.very_high).count(),
            undefined_weight_count: weights.undefined_count(),
        }
    }
}
