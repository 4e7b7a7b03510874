//! Quintile-stratified inverse-propensity weights.
//!
//! Within quintile `q`, `propensity = n_ref / (n_ref + n_flagged)`, clipped into
//! the configured band so an all-reference or all-flagged stratum still gives a
//! finite odds. A flagged respondent's raw weight is the odds
//! `propensity / (1 - propensity)`; raw weights are then rescaled so they sum to
//! the number of weighted flagged respondents. Reference respondents weigh 1.

use crate::config::WeightingConfig;
use crate::data::{Membership, RespondentId};
use crate::distribution::{QUINTILE_COUNT, Quintile, ReferenceDistribution};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a respondent has no weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedReason {
    /// Below the minimum observed-item count.
    InsufficientData,
    /// Enough data, but no converged fit-quality score.
    NotScored,
}

impl UndefinedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientData => "insufficient_data",
            Self::NotScored => "not_scored",
        }
    }
}

/// A weight or an explicit marker that none exists. Never silently zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Defined(f64),
    Undefined(UndefinedReason),
}

impl Weight {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Defined(w) => Some(w),
            Self::Undefined(_) => None,
        }
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defined(w) => write!(f, "{w}"),
            Self::Undefined(_) => f.write_str("NA"),
        }
    }
}

/// What the weighting step needs to know about one respondent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightInput {
    pub respondent_id: RespondentId,
    pub membership: Membership,
    pub fit_quality: Option<f64>,
    /// Meets the minimum observed-item count.
    pub sufficient: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub respondent_id: RespondentId,
    pub membership: Membership,
    pub fit_quality: Option<f64>,
    pub quintile: Option<Quintile>,
    pub weight: Weight,
}

/// Per-quintile counts and the propensity actually used.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StratumSummary {
    pub quintile: Quintile,
    pub reference_count: usize,
    pub flagged_count: usize,
    /// `None` when the stratum is empty.
    pub raw_propensity: Option<f64>,
    pub propensity: Option<f64>,
    pub clipped: bool,
    /// Odds before normalization.
    pub raw_weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    pub records: Vec<WeightRecord>,
    pub strata: Vec<StratumSummary>,
    /// Factor mapping raw weights to normalized ones.
    pub normalization: Option<f64>,
}

impl WeightTable {
    pub fn undefined_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.weight.value().is_none())
            .count()
    }

    pub fn flagged_weight_sum(&self) -> f64 {
        self.records
            .iter()
            .filter(|r| r.membership == Membership::Flagged)
            .filter_map(|r| r.weight.value())
            .sum()
    }
}

pub fn assign_weights(
    distribution: &ReferenceDistribution,
    inputs: &[WeightInput],
    config: &WeightingConfig,
) -> WeightTable {
    let quintile_of = |input: &WeightInput| -> Option<Quintile> {
        if !input.sufficient {
            return None;
        }
        input
            .fit_quality
            .filter(|f| f.is_finite())
            .map(|f| distribution.quintile(f))
    };

    let mut reference_counts = [0usize; QUINTILE_COUNT];
    let mut flagged_counts = [0usize; QUINTILE_COUNT];
    for input in inputs {
        if let Some(q) = quintile_of(input) {
            match input.membership {
                Membership::Reference => reference_counts[q.slot()] += 1,
                Membership::Flagged => flagged_counts[q.slot()] += 1,
            }
        }
    }

    let strata: Vec<StratumSummary> = Quintile::all()
        .map(|quintile| {
            let reference_count = reference_counts[quintile.slot()];
            let flagged_count = flagged_counts[quintile.slot()];
            let total = reference_count + flagged_count;
            let raw_propensity = (total > 0).then(|| reference_count as f64 / total as f64);
            let propensity = raw_propensity
                .map(|p| p.clamp(config.propensity_floor, config.propensity_ceiling));
            let clipped = raw_propensity != propensity;
            if clipped {
                log::warn!(
                    "{quintile}: propensity {:.3} ({reference_count} reference, {flagged_count} flagged) clipped to {:.3}",
                    raw_propensity.unwrap_or(f64::NAN),
                    propensity.unwrap_or(f64::NAN)
                );
            }
            StratumSummary {
                quintile,
                reference_count,
                flagged_count,
                raw_propensity,
                propensity,
                clipped,
                raw_weight: propensity.map(|p| p / (1.0 - p)),
            }
        })
        .collect();

    let raw_weight_of = |q: Quintile| strata[q.slot()].raw_weight;
    let raw_total: f64 = inputs
        .iter()
        .filter(|i| i.membership == Membership::Flagged)
        .filter_map(|i| quintile_of(i).and_then(raw_weight_of))
        .sum();
    let weighted_flagged = inputs
        .iter()
        .filter(|i| i.membership == Membership::Flagged)
        .filter(|i| quintile_of(*i).is_some())
        .count();
    let normalization = (raw_total > 0.0).then(|| weighted_flagged as f64 / raw_total);

    let records = inputs
        .iter()
        .map(|input| {
            let quintile = quintile_of(input);
            let weight = if !input.sufficient {
                Weight::Undefined(UndefinedReason::InsufficientData)
            } else {
                match input.membership {
                    Membership::Reference => Weight::Defined(1.0),
                    Membership::Flagged => match (quintile.and_then(raw_weight_of), normalization) {
                        (Some(raw), Some(scale)) => Weight::Defined(raw * scale),
                        _ => Weight::Undefined(UndefinedReason::NotScored),
                    },
                }
            };
            WeightRecord {
                respondent_id: input.respondent_id,
                membership: input.membership,
                fit_quality: input.fit_quality,
                quintile,
                weight,
            }
        })
        .collect();

    let table = WeightTable {
        records,
        strata,
        normalization,
    };
    log::info!(
        "Weights assigned: {weighted_flagged} flagged respondents weighted (sum {:.6}), {} undefined",
        table.flagged_weight_sum(),
        table.undefined_count()
    );
    table
}
