// screen/loocv.rs

//! # Leave-One-Out Cross-Validation
//!
//! Every reference respondent becomes one immutable [`LoocvTask`]. A task removes
//! the respondent, warm-starts a refit from the full-sample fit, scores the
//! held-out respondent against the refit's frozen items, and records the
//! item-parameter difference `refit - full` in the fixed layout order.
//!
//! Units run on a dedicated rayon pool and report over a channel to a single
//! aggregator on the calling thread. The aggregator owns the checkpoint and the
//! progress observer. A unit that fails to converge is recorded with a status;
//! only a parameter-vector shape mismatch stops the batch.

use crate::checkpoint::{CheckpointError, CheckpointWriter, load_checkpoint};
use crate::config::{FitterConfig, ScreeningConfig, WarmStartConfig, WarmStartStrategy};
use crate::data::{RespondentId, ResponseView};
use crate::index::IndexError;
use crate::model::{ConvergenceCode, ModelFit, ModelFitter};
use crate::progress::{ScreeningProgressObserver, ScreeningStage};
use crate::warm_start::leave_one_out_start;

use ahash::AHashSet;
use crossbeam_channel::unbounded;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoocvError {
    #[error(
        "Parameter-difference vector for respondent {respondent} has length {found}; every unit must produce {expected}. The model fitter broke its output contract."
    )]
    ParameterShapeMismatch {
        respondent: RespondentId,
        expected: usize,
        found: usize,
    },
    #[error("The full-sample fit must converge before leave-one-out refits (status: {0}).")]
    FullFitNotConverged(&'static str),
    #[error("Respondent index error: {0}")]
    Index(#[from] IndexError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Immutable description of one leave-one-out unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoocvTask {
    pub respondent_id: RespondentId,
}

/// Final state of a leave-one-out unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    /// The refit converged; the holdout fit did not.
    HoldoutNotConverged,
    /// The refit converged; the holdout fit returned an error.
    HoldoutFailed,
    RefitNotConverged,
    RefitFailed,
    /// The warm start failed its identification check.
    WarmStartRejected,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::HoldoutNotConverged => "holdout_not_converged",
            Self::HoldoutFailed => "holdout_failed",
            Self::RefitNotConverged => "refit_not_converged",
            Self::RefitFailed => "refit_failed",
            Self::WarmStartRejected => "warm_start_rejected",
        }
    }

    /// True when the refit converged, which makes the parameter difference usable.
    pub fn refit_converged(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::HoldoutNotConverged | Self::HoldoutFailed
        )
    }
}

/// The record produced by one unit. Undefined outputs are `None`, never NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoocvResult {
    pub respondent_id: RespondentId,
    pub item_count: usize,
    pub status: UnitStatus,
    pub warm_start: Option<WarmStartStrategy>,
    pub refit_convergence: Option<ConvergenceCode>,
    pub holdout_convergence: Option<ConvergenceCode>,
    pub log_posterior: Option<f64>,
    /// `log_posterior / item_count`.
    pub fit_quality: Option<f64>,
    pub ability: Option<Vec<f64>>,
    pub parameter_diff: Option<Vec<f64>>,
    pub message: Option<String>,
}

impl LoocvResult {
    fn pending(respondent_id: RespondentId, item_count: usize) -> Self {
        Self {
            respondent_id,
            item_count,
            status: UnitStatus::RefitFailed,
            warm_start: None,
            refit_convergence: None,
            holdout_convergence: None,
            log_posterior: None,
            fit_quality: None,
            ability: None,
            parameter_diff: None,
            message: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == UnitStatus::Completed
    }
}

/// All unit records of a batch, in reference-view order.
#[derive(Debug, Clone)]
pub struct LoocvResultSet {
    pub results: Vec<LoocvResult>,
    pub parameter_count: usize,
}

impl LoocvResultSet {
    /// Records with both fits converged.
    pub fn completed(&self) -> impl Iterator<Item = &LoocvResult> {
        self.results.iter().filter(|r| r.is_completed())
    }

    pub fn fit_qualities(&self) -> Vec<f64> {
        self.completed().filter_map(|r| r.fit_quality).collect()
    }

    /// Parameter differences of every unit with a converged refit, one row each.
    pub fn difference_matrix(&self) -> Array2<f64> {
        let rows: Vec<&Vec<f64>> = self
            .results
            .iter()
            .filter_map(|r| r.parameter_diff.as_ref())
            .collect();
        let mut out = Array2::zeros((rows.len(), self.parameter_count));
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                out[[i, j]] = *v;
            }
        }
        out
    }

    pub fn usable_difference_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.parameter_diff.is_some())
            .count()
    }

    pub fn completion_fraction(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.usable_difference_count() as f64 / self.results.len() as f64
        }
    }

    pub fn refit_convergence_rate(&self) -> f64 {
        rate(&self.results, |r| r.status.refit_converged())
    }

    pub fn holdout_convergence_rate(&self) -> f64 {
        rate(&self.results, |r| r.is_completed())
    }

    pub fn get(&self, id: RespondentId) -> Option<&LoocvResult> {
        self.results.iter().find(|r| r.respondent_id == id)
    }
}

/// Checkpoint header: the baseline and settings every stored difference was
/// taken against. Records are only reused under an identical provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoocvProvenance {
    pub reference_ids: Vec<RespondentId>,
    /// Full-sample item parameters in layout order.
    pub baseline: Vec<f64>,
    pub min_items: usize,
    pub fitter: FitterConfig,
    pub warm_start: WarmStartConfig,
}

impl LoocvProvenance {
    pub fn new(reference: &ResponseView<'_>, full: &ModelFit, config: &ScreeningConfig) -> Self {
        Self {
            reference_ids: reference.index().ids().to_vec(),
            baseline: full.items.to_vector().to_vec(),
            min_items: config.min_items,
            fitter: config.fitter,
            warm_start: config.warm_start,
        }
    }
}

fn rate(results: &[LoocvResult], keep: impl Fn(&LoocvResult) -> bool) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().filter(|r| keep(r)).count() as f64 / results.len() as f64
}

/// Runs one leave-one-out unit.
///
/// Non-convergence and estimation errors become the record's status. The only
/// error returned is a contract violation.
pub fn run_loocv_unit<F: ModelFitter + ?Sized>(
    fitter: &F,
    reference: &ResponseView<'_>,
    full: &ModelFit,
    task: LoocvTask,
    config: &ScreeningConfig,
) -> Result<LoocvResult, LoocvError> {
    let id = task.respondent_id;
    let position = reference
        .index()
        .position(id)
        .ok_or(IndexError::UnknownRespondent(id))?;
    let respondent = reference.respondents()[position];
    let mut result = LoocvResult::pending(id, respondent.item_count());

    let loo = reference.leave_one_out(id)?;

    let start = match leave_one_out_start(full, id, loo.index(), &config.warm_start) {
        Ok(start) => start,
        Err(e) => {
            log::warn!("Respondent {id}: warm start rejected: {e}");
            result.status = UnitStatus::WarmStartRejected;
            result.message = Some(e.to_string());
            return Ok(result);
        }
    };
    result.warm_start = Some(start.strategy);

    let refit = match fitter.fit(&loo, Some(&start.values)) {
        Ok(refit) => refit,
        Err(e) => {
            log::warn!("Respondent {id}: leave-one-out refit failed: {e}");
            result.status = UnitStatus::RefitFailed;
            result.message = Some(e.to_string());
            return Ok(result);
        }
    };
    result.refit_convergence = Some(refit.convergence);
    if !refit.convergence.is_converged() {
        log::warn!(
            "Respondent {id}: leave-one-out refit did not converge ({})",
            refit.convergence.as_str()
        );
        result.status = UnitStatus::RefitNotConverged;
        return Ok(result);
    }

    let reduced = refit.items.to_vector();
    let baseline = full.items.to_vector();
    if reduced.len() != baseline.len() {
        return Err(LoocvError::ParameterShapeMismatch {
            respondent: id,
            expected: baseline.len(),
            found: reduced.len(),
        });
    }
    result.parameter_diff = Some((&reduced - &baseline).to_vec());

    match fitter.fit_holdout(&refit.items, reference.bank(), respondent) {
        Ok(holdout) => {
            result.holdout_convergence = Some(holdout.convergence);
            if holdout.convergence.is_converged() {
                result.status = UnitStatus::Completed;
                result.log_posterior = Some(holdout.log_posterior);
                result.fit_quality =
                    Some(holdout.log_posterior / respondent.item_count() as f64);
                result.ability = Some(holdout.ability.to_vec());
            } else {
                log::warn!(
                    "Respondent {id}: holdout fit did not converge ({})",
                    holdout.convergence.as_str()
                );
                result.status = UnitStatus::HoldoutNotConverged;
            }
        }
        Err(e) => {
            log::warn!("Respondent {id}: holdout fit failed: {e}");
            result.status = UnitStatus::HoldoutFailed;
            result.message = Some(e.to_string());
        }
    }

    log::debug!("Respondent {id}: {}", result.status.as_str());
    Ok(result)
}

/// Runs leave-one-out for every respondent in `reference`.
///
/// With a checkpoint path, records already present are reused and new records
/// are appended as they arrive.
pub fn run_loocv<F: ModelFitter + ?Sized>(
    fitter: &F,
    reference: &ResponseView<'_>,
    full: &ModelFit,
    config: &ScreeningConfig,
    checkpoint: Option<&Path>,
    progress: &mut dyn ScreeningProgressObserver,
) -> Result<LoocvResultSet, LoocvError> {
    if !full.convergence.is_converged() {
        return Err(LoocvError::FullFitNotConverged(full.convergence.as_str()));
    }
    reference.index().validate()?;
    let parameter_count = full.layout().len();

    let provenance = LoocvProvenance::new(reference, full, config);
    let (mut collected, mut writer) = match checkpoint {
        Some(path) => match internal::resume(path, reference, parameter_count, &provenance)? {
            Some(records) => (
                records,
                Some(CheckpointWriter::open(path, config.checkpoint_every)?),
            ),
            None => (
                Vec::new(),
                Some(CheckpointWriter::create(
                    path,
                    &provenance,
                    config.checkpoint_every,
                )?),
            ),
        },
        None => (Vec::new(), None),
    };
    let done: AHashSet<RespondentId> = collected.iter().map(|r| r.respondent_id).collect();
    let pending: Vec<LoocvTask> = reference
        .index()
        .ids()
        .iter()
        .filter(|id| !done.contains(*id))
        .map(|&respondent_id| LoocvTask { respondent_id })
        .collect();

    log::info!(
        "Leave-one-out over {} reference respondents ({} from checkpoint, {} to run) on {} workers",
        reference.len(),
        collected.len(),
        pending.len(),
        config.worker_count()
    );

    progress.on_stage_start(ScreeningStage::Loocv, reference.len());
    progress.on_stage_advance(ScreeningStage::Loocv, collected.len());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_count())
        .build()?;
    let abort = AtomicBool::new(false);
    let (tx, rx) = unbounded::<Result<LoocvResult, LoocvError>>();

    let mut first_error: Option<LoocvError> = None;
    std::thread::scope(|scope| {
        let pool = &pool;
        let pending = &pending;
        let abort = &abort;
        scope.spawn(move || {
            pool.install(|| {
                pending.par_iter().for_each_with(tx, |tx, task| {
                    if abort.load(Ordering::Relaxed) {
                        return;
                    }
                    let outcome = run_loocv_unit(fitter, reference, full, *task, config);
                    // The receiver outlives every worker.
                    let _ = tx.send(outcome);
                });
            });
        });

        for outcome in rx.iter() {
            if first_error.is_some() {
                continue;
            }
            let step = outcome.and_then(|record| {
                internal::check_shape(&record, parameter_count)?;
                if let Some(writer) = writer.as_mut() {
                    writer.append(&record)?;
                }
                collected.push(record);
                progress.on_stage_advance(ScreeningStage::Loocv, collected.len());
                Ok(())
            });
            if let Err(e) = step {
                abort.store(true, Ordering::Relaxed);
                first_error = Some(e);
            }
        }
    });

    if let Some(writer) = writer.as_mut() {
        writer.flush()?;
    }
    progress.on_stage_finish(ScreeningStage::Loocv);
    if let Some(e) = first_error {
        return Err(e);
    }

    let order = reference.index();
    collected.sort_by_key(|r| order.position(r.respondent_id));
    let set = LoocvResultSet {
        results: collected,
        parameter_count,
    };
    log::info!(
        "Leave-one-out finished: refit convergence {:.1}%, holdout convergence {:.1}%",
        100.0 * set.refit_convergence_rate(),
        100.0 * set.holdout_convergence_rate()
    );
    Ok(set)
}

mod internal {
    use super::*;

    pub(super) fn check_shape(record: &LoocvResult, expected: usize) -> Result<(), LoocvError> {
        match &record.parameter_diff {
            Some(diff) if diff.len() != expected => Err(LoocvError::ParameterShapeMismatch {
                respondent: record.respondent_id,
                expected,
                found: diff.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Loads checkpointed records that still belong to this reference set.
    ///
    /// `None` means there is nothing to resume: the file is missing, or it was
    /// written against another baseline and must be started over.
    pub(super) fn resume(
        path: &Path,
        reference: &ResponseView<'_>,
        parameter_count: usize,
        provenance: &LoocvProvenance,
    ) -> Result<Option<Vec<LoocvResult>>, LoocvError> {
        let Some(checkpoint) = load_checkpoint::<LoocvProvenance, LoocvResult>(path)? else {
            return Ok(None);
        };
        if checkpoint.header.as_ref() != Some(provenance) {
            log::warn!(
                "Discarding checkpoint {} ({} records): it was written for a different full-sample fit or configuration",
                path.display(),
                checkpoint.records.len()
            );
            return Ok(None);
        }
        let records = checkpoint.records;
        let mut seen = AHashSet::with_capacity(records.len());
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            if reference.index().position(record.respondent_id).is_none() {
                log::warn!(
                    "Dropping checkpoint record for respondent {}: not in the current reference set",
                    record.respondent_id
                );
                continue;
            }
            check_shape(&record, parameter_count)?;
            // Later lines win; the file is append-only.
            if !seen.insert(record.respondent_id) {
                kept.retain(|r: &LoocvResult| r.respondent_id != record.respondent_id);
            }
            kept.push(record);
        }
        Ok(Some(kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Item, ItemBank, Membership, Observation, Respondent, ResponseData};
    use crate::estimate::EstimationError;
    use crate::model::{HoldoutFit, InitialValues, ItemParameters, ParameterLayout};
    use crate::progress::NoopScreeningProgress;
    use ndarray::{Array1, array};
    use tempfile::tempdir;

    /// Returns its warm start unchanged, optionally with an extra threshold.
    struct EchoFitter {
        grow_items_for: Option<RespondentId>,
        stall_for: Option<RespondentId>,
    }

    impl ModelFitter for EchoFitter {
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
            let missing = |id| data.index().position(id).is_none();
            if self.grow_items_for.is_some_and(missing) {
                let mut grown = items.thresholds.to_vec();
                grown.push(0.0);
                items.thresholds = Array1::from(grown);
            }
            let convergence = if self.stall_for.is_some_and(missing) {
                ConvergenceCode::IterationLimit
            } else {
                ConvergenceCode::Converged
            };
            Ok(ModelFit {
                items,
                respondent_ids: data.index().ids().to_vec(),
                abilities,
                log_posterior: -(data.observation_count() as f64),
                convergence,
                iterations: 0,
                gradient_norm: 0.0,
            })
        }

        fn fit_holdout(
            &self,
            items: &ItemParameters,
            bank: &ItemBank,
            respondent: &Respondent,
        ) -> Result<HoldoutFit, EstimationError> {
            Ok(HoldoutFit {
                ability: Array1::zeros(bank.dimensions()),
                log_posterior: -(respondent.item_count() as f64) - items.thresholds.sum(),
                convergence: ConvergenceCode::Converged,
            })
        }
    }

    fn dataset() -> ResponseData {
        let bank = ItemBank::new(vec![
            Item {
                id: "x".to_string(),
                categories: 3,
                dimension: 0,
            },
            Item {
                id: "y".to_string(),
                categories: 3,
                dimension: 0,
            },
        ])
        .unwrap();
        let respondents = (1..=6)
            .map(|i| Respondent {
                id: RespondentId(i),
                age: 30.0 + i as f64,
                membership: Membership::Reference,
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

    fn full_fit(view: &ResponseView<'_>) -> ModelFit {
        let mut fit = EchoFitter {
            grow_items_for: None,
            stall_for: None,
        }
        .fit(view, None)
        .unwrap();
        fit.abilities = array![[0.5], [-0.2], [1.1], [-0.9], [0.3], [-0.8]];
        fit.items.thresholds = array![0.25, -0.5];
        fit
    }

    fn small_config() -> ScreeningConfig {
        ScreeningConfig {
            min_items: 2,
            workers: Some(2),
            checkpoint_every: 2,
            ..ScreeningConfig::default()
        }
    }

    #[test]
    fn unit_scores_held_out_respondent() {
        let data = dataset();
        let view = data.reference_view(2).unwrap();
        let full = full_fit(&view);
        let fitter = EchoFitter {
            grow_items_for: None,
            stall_for: None,
        };
        let task = LoocvTask {
            respondent_id: RespondentId(3),
        };
        let result = run_loocv_unit(&fitter, &view, &full, task, &small_config()).unwrap();
        assert_eq!(result.status, UnitStatus::Completed);
        let diff = result.parameter_diff.as_ref().unwrap();
        assert_eq!(diff.len(), full.layout().len());
        assert!(diff.iter().all(|d| *d == 0.0));
        let lp = result.log_posterior.unwrap();
        assert_eq!(result.fit_quality, Some(lp / 2.0));
    }

    #[test]
    fn non_converged_refit_is_recorded_not_raised() {
        let data = dataset();
        let view = data.reference_view(2).unwrap();
        let full = full_fit(&view);
        let fitter = EchoFitter {
            grow_items_for: None,
            stall_for: Some(RespondentId(2)),
        };
        let set = run_loocv(
            &fitter,
            &view,
            &full,
            &small_config(),
            None,
            &mut NoopScreeningProgress,
        )
        .unwrap();
        assert_eq!(set.results.len(), 6);
        let stalled = set.get(RespondentId(2)).unwrap();
        assert_eq!(stalled.status, UnitStatus::RefitNotConverged);
        assert!(stalled.fit_quality.is_none() && stalled.parameter_diff.is_none());
        assert_eq!(set.usable_difference_count(), 5);
        assert_eq!(set.difference_matrix().dim(), (5, full.layout().len()));
        let ids: Vec<u64> = set.results.iter().map(|r| r.respondent_id.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let data = dataset();
        let view = data.reference_view(2).unwrap();
        let full = full_fit(&view);
        let fitter = EchoFitter {
            grow_items_for: Some(RespondentId(4)),
            stall_for: None,
        };
        let err = run_loocv(
            &fitter,
            &view,
            &full,
            &small_config(),
            None,
            &mut NoopScreeningProgress,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LoocvError::ParameterShapeMismatch {
                respondent: RespondentId(4),
                ..
            }
        ));
    }

    #[test]
    fn checkpoint_resume_skips_completed_units() {
        let data = dataset();
        let view = data.reference_view(2).unwrap();
        let full = full_fit(&view);
        let fitter = EchoFitter {
            grow_items_for: None,
            stall_for: None,
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("loocv.jsonl");

        let mut seeded = LoocvResult::pending(RespondentId(5), 2);
        seeded.status = UnitStatus::HoldoutFailed;
        seeded.parameter_diff = Some(vec![0.0; full.layout().len()]);
        let stale = LoocvResult::pending(RespondentId(99), 2);
        let config = small_config();
        {
            let provenance = LoocvProvenance::new(&view, &full, &config);
            let mut writer = CheckpointWriter::create(&path, &provenance, 1).unwrap();
            writer.append(&seeded).unwrap();
            writer.append(&stale).unwrap();
        }

        let set = run_loocv(
            &fitter,
            &view,
            &full,
            &config,
            Some(&path),
            &mut NoopScreeningProgress,
        )
        .unwrap();
        assert_eq!(set.results.len(), 6);
        assert_eq!(set.get(RespondentId(5)).unwrap().status, UnitStatus::HoldoutFailed);
        assert!(set.get(RespondentId(99)).is_none());

        let on_disk = load_checkpoint::<LoocvProvenance, LoocvResult>(&path)
            .unwrap()
            .unwrap();
        assert!(on_disk.header.is_some());
        assert_eq!(on_disk.records.len(), 2 + 5);
    }

    #[test]
    fn checkpoint_from_another_baseline_is_discarded() {
        let data = dataset();
        let view = data.reference_view(2).unwrap();
        let full = full_fit(&view);
        let fitter = EchoFitter {
            grow_items_for: None,
            stall_for: None,
        };
        let config = small_config();
        let dir = tempdir().unwrap();
        let path = dir.path().join("loocv.jsonl");

        let mut old_full = full.clone();
        old_full.items.thresholds[0] += 0.25;
        let mut seeded = LoocvResult::pending(RespondentId(5), 2);
        seeded.status = UnitStatus::HoldoutFailed;
        seeded.parameter_diff = Some(vec![9.0; full.layout().len()]);
        {
            let provenance = LoocvProvenance::new(&view, &old_full, &config);
            let mut writer = CheckpointWriter::create(&path, &provenance, 1).unwrap();
            writer.append(&seeded).unwrap();
        }

        let set = run_loocv(
            &fitter,
            &view,
            &full,
            &config,
            Some(&path),
            &mut NoopScreeningProgress,
        )
        .unwrap();
        let redone = set.get(RespondentId(5)).unwrap();
        assert_eq!(redone.status, UnitStatus::Completed);
        assert!(redone.parameter_diff.as_ref().unwrap().iter().all(|d| *d == 0.0));

        // The file now belongs to the current baseline.
        let on_disk = load_checkpoint::<LoocvProvenance, LoocvResult>(&path)
            .unwrap()
            .unwrap();
        assert_eq!(
            on_disk.header,
            Some(LoocvProvenance::new(&view, &full, &config))
        );
        assert_eq!(on_disk.records.len(), 6);

        // So does a changed warm-start setting.
        let mut switched = config.clone();
        switched.warm_start.strategy = WarmStartStrategy::MeanCentered;
        assert_ne!(
            LoocvProvenance::new(&view, &full, &switched),
            LoocvProvenance::new(&view, &full, &config)
        );
    }
}
