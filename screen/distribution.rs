//! Reference distribution of fit-quality scores: the z-score transform and the
//! frozen quintile boundaries used to stratify every later respondent.

use crate::stats::{mean, quantile_sorted, sample_sd};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const QUINTILE_COUNT: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributionError {
    #[error("At least two finite fit-quality scores are needed; found {0}.")]
    TooFewScores(usize),
    #[error("Reference fit-quality scores have zero spread; z-scores are undefined.")]
    ZeroSpread,
}

/// One of the five strata, numbered 1 to 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quintile(u8);

impl Quintile {
    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based position, for indexing per-stratum tables.
    pub fn slot(self) -> usize {
        usize::from(self.0 - 1)
    }

    pub fn all() -> impl Iterator<Item = Quintile> {
        (1..=QUINTILE_COUNT as u8).map(Quintile)
    }
}

impl fmt::Display for Quintile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.0)
    }
}

/// Six non-decreasing cut points at the 0, 20, 40, 60, 80 and 100th percentiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuintileBoundaries {
    pub cuts: [f64; QUINTILE_COUNT + 1],
}

impl QuintileBoundaries {
    pub fn from_scores(scores: &[f64]) -> Result<Self, DistributionError> {
        let mut sorted: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
        if sorted.is_empty() {
            return Err(DistributionError::TooFewScores(0));
        }
        sorted.sort_by(f64::total_cmp);
        let mut cuts = [0.0; QUINTILE_COUNT + 1];
        for (k, cut) in cuts.iter_mut().enumerate() {
            *cut = quantile_sorted(&sorted, k as f64 / QUINTILE_COUNT as f64);
        }
        Ok(Self { cuts })
    }

    /// Bucket `q` is `(cuts[q-1], cuts[q]]`, except the first, which also holds
    /// `cuts[0]`. Scores outside the reference range go to the nearest end bucket,
    /// and a score equal to an interior cut goes to the lower bucket.
    pub fn classify(&self, score: f64) -> Quintile {
        let bucket = self.cuts[1..QUINTILE_COUNT]
            .iter()
            .position(|&upper| score <= upper)
            .unwrap_or(QUINTILE_COUNT - 1);
        Quintile(bucket as u8 + 1)
    }
}

/// Mean and standard deviation of the reference fit-quality scores, plus the
/// quintile boundaries over the same set. Computed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDistribution {
    pub mean: f64,
    pub sd: f64,
    pub count: usize,
    pub boundaries: QuintileBoundaries,
}

impl ReferenceDistribution {
    /// Builds the distribution from fit-quality scores of units with both fits converged.
    pub fn from_scores(scores: &[f64]) -> Result<Self, DistributionError> {
        let finite: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
        if finite.len() < 2 {
            return Err(DistributionError::TooFewScores(finite.len()));
        }
        let mean = mean(&finite).ok_or(DistributionError::TooFewScores(0))?;
        let sd = sample_sd(&finite).ok_or(DistributionError::TooFewScores(finite.len()))?;
        if sd <= 0.0 {
            return Err(DistributionError::ZeroSpread);
        }
        let boundaries = QuintileBoundaries::from_scores(&finite)?;
        log::info!(
            "Reference fit quality: mean {mean:.4}, sd {sd:.4} over {} respondents; quintile cuts {:?}",
            finite.len(),
            boundaries.cuts
        );
        Ok(Self {
            mean,
            sd,
            count: finite.len(),
            boundaries,
        })
    }

    pub fn z_score(&self, fit_quality: f64) -> f64 {
        (fit_quality - self.mean) / self.sd
    }

    pub fn quintile(&self, fit_quality: f64) -> Quintile {
        self.boundaries.classify(fit_quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reference_z_scores_are_standardized() {
        let scores = [-1.3, -0.9, -1.1, -0.7, -1.6, -0.8, -1.0, -1.2];
        let dist = ReferenceDistribution::from_scores(&scores).unwrap();
        let z: Vec<f64> = scores.iter().map(|s| dist.z_score(*s)).collect();
        assert_abs_diff_eq!(z.iter().sum::<f64>() / z.len() as f64, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sample_sd(&z).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn boundaries_are_non_decreasing_and_bracket_the_data() {
        let scores = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        let b = QuintileBoundaries::from_scores(&scores).unwrap();
        assert!(b.cuts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(b.cuts[0], 1.0);
        assert_eq!(b.cuts[5], 9.0);
    }

    #[test]
    fn boundary_values_go_to_the_lower_quintile() {
        let b = QuintileBoundaries {
            cuts: [0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        };
        assert_eq!(b.classify(0.0).number(), 1);
        assert_eq!(b.classify(1.0).number(), 1);
        assert_eq!(b.classify(1.0 + 1e-12).number(), 2);
        assert_eq!(b.classify(3.0).number(), 3);
        assert_eq!(b.classify(4.0).number(), 4);
        assert_eq!(b.classify(5.0).number(), 5);
        assert_eq!(b.classify(-10.0).number(), 1);
        assert_eq!(b.classify(10.0).number(), 5);
    }

    #[test]
    fn tied_boundaries_still_give_one_quintile() {
        let b = QuintileBoundaries::from_scores(&[2.0, 2.0, 2.0, 2.0, 7.0]).unwrap();
        assert_eq!(b.classify(2.0).number(), 1);
        assert_eq!(b.classify(7.0).number(), 5);
    }

    #[test]
    fn constant_scores_have_no_z_transform() {
        assert_eq!(
            ReferenceDistribution::from_scores(&[1.0, 1.0, 1.0]),
            Err(DistributionError::ZeroSpread)
        );
        assert_eq!(
            ReferenceDistribution::from_scores(&[1.0, f64::NAN]),
            Err(DistributionError::TooFewScores(1))
        );
    }
}
