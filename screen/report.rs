//! Run artifacts: tab-separated tables and TOML reports in one output directory.
//!
//! Undefined numeric values are written as `NA` so they can never be read back
//! as a number.

use crate::distribution::{QUINTILE_COUNT, QuintileBoundaries, ReferenceDistribution};
use crate::influence::{InfluenceRecord, InfluenceScore};
use crate::jackknife::JackknifeHessian;
use crate::loocv::LoocvResultSet;
use crate::model::{ModelError, ParameterLayout};
use crate::out_of_sample::OutOfSampleScore;
use crate::stats::ValueRange;
use crate::weights::{Weight, WeightTable};

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REFERENCE_MODEL_FILE: &str = "reference_model.toml";
pub const LOOCV_RESULTS_FILE: &str = "loocv_results.tsv";
pub const LOOCV_CHECKPOINT_FILE: &str = "loocv_checkpoint.jsonl";
pub const HESSIAN_FILE: &str = "jackknife_hessian.tsv";
pub const INFLUENCE_FILE: &str = "influence_scores.tsv";
pub const OUT_OF_SAMPLE_FILE: &str = "out_of_sample_scores.tsv";
pub const QUINTILE_FILE: &str = "quintile_boundaries.tsv";
pub const WEIGHTS_FILE: &str = "weights.tsv";
pub const STRATA_FILE: &str = "weight_strata.tsv";
pub const THRESHOLD_REPORT_FILE: &str = "threshold_report.toml";
pub const SUMMARY_FILE: &str = "screening_report.toml";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to serialize report to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Failed to save model: {0}")]
    Model(#[from] ModelError),
}

/// Counts, convergence rates and value ranges of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningSummary {
    pub reference_count: usize,
    pub flagged_count: usize,
    pub reference_insufficient: usize,
    pub flagged_insufficient: usize,
    pub reference_fit_converged: bool,
    pub loocv_units: usize,
    pub loocv_refit_convergence_rate: f64,
    pub loocv_holdout_convergence_rate: f64,
    pub out_of_sample_scored: usize,
    pub out_of_sample_not_converged: usize,
    pub augmented_attempted: usize,
    pub augmented_scored: usize,
    pub hessian_rows: usize,
    pub hessian_condition_number: f64,
    pub hessian_regularized: bool,
    pub hessian_ridge: Option<f64>,
    pub reference_mean: f64,
    pub reference_sd: f64,
    pub quintile_cuts: [f64; QUINTILE_COUNT + 1],
    pub fit_quality_range: Option<ValueRange>,
    pub z_score_range: Option<ValueRange>,
    pub scaled_influence_range: Option<ValueRange>,
    pub weight_range: Option<ValueRange>,
    pub high_influence_count: usize,
    pub very_high_influence_count: usize,
    pub undefined_weight_count: usize,
}

fn show_range(range: &Option<ValueRange>) -> String {
    range.map_or_else(|| "none".to_string(), |r| r.to_string())
}

impl fmt::Display for ScreeningSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Screening summary")?;
        writeln!(
            f,
            "  respondents:          {} reference, {} flagged",
            self.reference_count, self.flagged_count
        )?;
        writeln!(
            f,
            "  insufficient data:    {} reference, {} flagged",
            self.reference_insufficient, self.flagged_insufficient
        )?;
        writeln!(
            f,
            "  leave-one-out:        {} units, refit {:.1}% / holdout {:.1}% converged",
            self.loocv_units,
            100.0 * self.loocv_refit_convergence_rate,
            100.0 * self.loocv_holdout_convergence_rate
        )?;
        writeln!(
            f,
            "  out-of-sample:        {} scored, {} not converged",
            self.out_of_sample_scored, self.out_of_sample_not_converged
        )?;
        writeln!(
            f,
            "  augmented fits:       {} of {} scored",
            self.augmented_scored, self.augmented_attempted
        )?;
        writeln!(
            f,
            "  jackknife Hessian:    {} rows, condition {:.3e}{}",
            self.hessian_rows,
            self.hessian_condition_number,
            if self.hessian_regularized {
                " (regularized)"
            } else {
                ""
            }
        )?;
        writeln!(
            f,
            "  reference fit quality: mean {:.4}, sd {:.4}",
            self.reference_mean, self.reference_sd
        )?;
        writeln!(f, "  fit quality range:    {}", show_range(&self.fit_quality_range))?;
        writeln!(f, "  z-score range:        {}", show_range(&self.z_score_range))?;
        writeln!(
            f,
            "  scaled influence:     {} ({} high, {} very high)",
            show_range(&self.scaled_influence_range),
            self.high_influence_count,
            self.very_high_influence_count
        )?;
        write!(
            f,
            "  weights:              {} ({} undefined)",
            show_range(&self.weight_range),
            self.undefined_weight_count
        )
    }
}

fn na(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<fs::File>, ReportError> {
    Ok(WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?)
}

/// Serializes any report value to a pretty TOML file.
pub fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), ReportError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

pub fn write_loocv_results(
    path: &Path,
    results: &LoocvResultSet,
    layout: ParameterLayout,
) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    let mut header: Vec<String> = [
        "respondent_id",
        "item_count",
        "status",
        "warm_start",
        "refit_convergence",
        "holdout_convergence",
        "log_posterior",
        "fit_quality",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend((0..layout.n_dimensions).map(|d| format!("ability_{d}")));
    header.extend(layout.labels().iter().map(|l| format!("diff_{l}")));
    wtr.write_record(&header)?;

    for r in &results.results {
        let mut row = vec![
            r.respondent_id.to_string(),
            r.item_count.to_string(),
            r.status.as_str().to_string(),
            r.warm_start.map_or("NA", |s| s.as_str()).to_string(),
            r.refit_convergence.map_or("NA", |c| c.as_str()).to_string(),
            r.holdout_convergence.map_or("NA", |c| c.as_str()).to_string(),
            na(r.log_posterior),
            na(r.fit_quality),
        ];
        row.extend((0..layout.n_dimensions).map(|d| {
            na(r.ability.as_ref().and_then(|a| a.get(d).copied()))
        }));
        row.extend((0..layout.len()).map(|k| {
            na(r.parameter_diff.as_ref().and_then(|v| v.get(k).copied()))
        }));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes the matrix with parameter labels on both axes.
pub fn write_hessian(
    path: &Path,
    hessian: &JackknifeHessian,
    layout: ParameterLayout,
) -> Result<(), ReportError> {
    let labels = layout.labels();
    let mut wtr = tsv_writer(path)?;
    let mut header = vec!["parameter".to_string()];
    header.extend(labels.iter().cloned());
    wtr.write_record(&header)?;
    for (i, row) in hessian.matrix.outer_iter().enumerate() {
        let mut record = vec![labels.get(i).cloned().unwrap_or_else(|| i.to_string())];
        record.extend(row.iter().map(|v| format!("{v:.12e}")));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_influence(path: &Path, records: &[InfluenceRecord]) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "respondent_id",
        "membership",
        "status",
        "raw_score",
        "scaled_score",
        "high_influence",
        "very_high_influence",
    ])?;
    for r in records {
        let flag = |f: fn(&InfluenceScore) -> bool| {
            r.score.as_ref().map_or("NA", |s| if f(s) { "1" } else { "0" })
        };
        wtr.write_record([
            r.respondent_id.to_string(),
            r.membership.as_str().to_string(),
            r.status.as_str().to_string(),
            na(r.score.map(|s| s.raw)),
            na(r.score.map(|s| s.scaled)),
            flag(|s| s.high).to_string(),
            flag(|s| s.very_high).to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_out_of_sample(
    path: &Path,
    scores: &[OutOfSampleScore],
    distribution: &ReferenceDistribution,
) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "respondent_id",
        "membership",
        "item_count",
        "status",
        "log_posterior",
        "fit_quality",
        "z_score",
        "quintile",
    ])?;
    for s in scores {
        wtr.write_record([
            s.respondent_id.to_string(),
            s.membership.as_str().to_string(),
            s.item_count.to_string(),
            s.status.as_str().to_string(),
            na(s.log_posterior),
            na(s.fit_quality),
            na(s.fit_quality.map(|f| distribution.z_score(f))),
            s.fit_quality
                .map_or("NA".to_string(), |f| distribution.quintile(f).number().to_string()),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_quintile_boundaries(
    path: &Path,
    boundaries: &QuintileBoundaries,
) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(["percentile", "cut"])?;
    for (k, cut) in boundaries.cuts.iter().enumerate() {
        wtr.write_record([(k * 100 / QUINTILE_COUNT).to_string(), cut.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_weights(path: &Path, table: &WeightTable) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "respondent_id",
        "membership",
        "fit_quality",
        "quintile",
        "weight",
        "undefined_reason",
    ])?;
    for r in &table.records {
        let reason = match r.weight {
            Weight::Defined(_) => "NA",
            Weight::Undefined(reason) => reason.as_str(),
        };
        wtr.write_record([
            r.respondent_id.to_string(),
            r.membership.as_str().to_string(),
            na(r.fit_quality),
            r.quintile
                .map_or("NA".to_string(), |q| q.number().to_string()),
            r.weight.to_string(),
            reason.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_strata(path: &Path, table: &WeightTable) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "quintile",
        "reference_count",
        "flagged_count",
        "raw_propensity",
        "propensity",
        "clipped",
        "raw_weight",
    ])?;
    for s in &table.strata {
        wtr.write_record([
            s.quintile.number().to_string(),
            s.reference_count.to_string(),
            s.flagged_count.to_string(),
            na(s.raw_propensity),
            na(s.propensity),
            u8::from(s.clipped).to_string(),
            na(s.raw_weight),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Creates the output directory if needed and returns the path of one artifact in it.
pub fn artifact_path(out_dir: &Path, file: &str) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(out_dir)?;
    Ok(out_dir.join(file))
}
