//! ROC-based cut points on fit-quality z-scores.
//!
//! Two one-sided analyses run on a labeled reference-versus-flagged set: the low
//! tail (z below the reference mean, poor fit) and the high tail (z above it,
//! suspiciously good fit). Each picks the cut maximizing Youden's J. The
//! combined rule flags a respondent when `z < low_cut` or `z > high_cut`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A z-score with its known group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabeledScore {
    pub z: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tail {
    /// `z < 0`; predicts flagged when `z < cut`.
    Low,
    /// `z > 0`; predicts flagged when `z > cut`.
    High,
}

impl Tail {
    fn contains(self, z: f64) -> bool {
        match self {
            Self::Low => z < 0.0,
            Self::High => z > 0.0,
        }
    }

    /// Orients z so that larger always means "more likely flagged".
    fn orient(self, z: f64) -> f64 {
        match self {
            Self::Low => -z,
            Self::High => z,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TailAnalysis {
    pub tail: Tail,
    pub flagged_count: usize,
    pub reference_count: usize,
    /// `None` when the tail lacks one of the two groups.
    pub auc: Option<f64>,
    /// Cut on the z scale; `None` means this side never flags.
    pub cut: Option<f64>,
    pub youden_j: Option<f64>,
    pub sensitivity: Option<f64>,
    pub specificity: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionMatrix {
    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub sensitivity: Option<f64>,
    pub specificity: Option<f64>,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub f1: Option<f64>,
}

fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

impl From<&ConfusionMatrix> for ClassificationMetrics {
    fn from(m: &ConfusionMatrix) -> Self {
        let sensitivity = ratio(m.true_positive, m.true_positive + m.false_negative);
        let precision = ratio(m.true_positive, m.true_positive + m.false_positive);
        let f1 = match (precision, sensitivity) {
            (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
            _ => None,
        };
        Self {
            sensitivity,
            specificity: ratio(m.true_negative, m.true_negative + m.false_positive),
            accuracy: ratio(m.true_positive + m.true_negative, m.total()),
            precision,
            f1,
        }
    }
}

/// The combined two-sided decision rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionRule {
    pub low_cut: Option<f64>,
    pub high_cut: Option<f64>,
}

impl DecisionRule {
    pub fn is_flagged(&self, z: f64) -> bool {
        self.low_cut.is_some_and(|cut| z < cut) || self.high_cut.is_some_and(|cut| z > cut)
    }

    pub fn confusion(&self, scores: &[LabeledScore]) -> ConfusionMatrix {
        let mut m = ConfusionMatrix::default();
        for s in scores {
            match (s.flagged, self.is_flagged(s.z)) {
                (true, true) => m.true_positive += 1,
                (true, false) => m.false_negative += 1,
                (false, true) => m.false_positive += 1,
                (false, false) => m.true_negative += 1,
            }
        }
        m
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub low: TailAnalysis,
    pub high: TailAnalysis,
    pub rule: DecisionRule,
    pub confusion: ConfusionMatrix,
    pub metrics: ClassificationMetrics,
}

/// Runs both one-sided analyses and evaluates the combined rule on all scores.
///
/// Non-finite z-scores are ignored.
pub fn select_thresholds(scores: &[LabeledScore]) -> ThresholdReport {
    let finite: Vec<LabeledScore> = scores.iter().copied().filter(|s| s.z.is_finite()).collect();
    let low = analyze_tail(&finite, Tail::Low);
    let high = analyze_tail(&finite, Tail::High);
    let rule = DecisionRule {
        low_cut: low.cut,
        high_cut: high.cut,
    };
    let confusion = rule.confusion(&finite);
    let metrics = ClassificationMetrics::from(&confusion);
    log::info!(
        "Thresholds: low cut {:?} (AUC {:?}), high cut {:?} (AUC {:?}); accuracy {:?}",
        low.cut,
        low.auc,
        high.cut,
        high.auc,
        metrics.accuracy
    );
    ThresholdReport {
        low,
        high,
        rule,
        confusion,
        metrics,
    }
}

pub fn analyze_tail(scores: &[LabeledScore], tail: Tail) -> TailAnalysis {
    let subset: Vec<(f64, bool)> = scores
        .iter()
        .filter(|s| tail.contains(s.z))
        .map(|s| (tail.orient(s.z), s.flagged))
        .collect();
    let flagged_count = subset.iter().filter(|(_, f)| *f).count();
    let reference_count = subset.len() - flagged_count;

    let mut analysis = TailAnalysis {
        tail,
        flagged_count,
        reference_count,
        auc: None,
        cut: None,
        youden_j: None,
        sensitivity: None,
        specificity: None,
    };
    if flagged_count == 0 || reference_count == 0 {
        log::warn!(
            "{tail:?} tail has {flagged_count} flagged and {reference_count} reference respondents; no cut point"
        );
        return analysis;
    }

    let oriented: Vec<f64> = subset.iter().map(|(s, _)| *s).collect();
    let labels: Vec<bool> = subset.iter().map(|(_, f)| *f).collect();
    analysis.auc = mann_whitney_auc(&oriented, &labels);

    let mut distinct = oriented.clone();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();

    // Ascending candidates with `>=` keeps the most extreme cut among ties.
    let mut best: Option<(f64, f64, f64, f64)> = None;
    for pair in distinct.windows(2) {
        let threshold = 0.5 * (pair[0] + pair[1]);
        let caught = subset.iter().filter(|(s, f)| *f && *s > threshold).count();
        let cleared = subset.iter().filter(|(s, f)| !*f && *s <= threshold).count();
        let sensitivity = caught as f64 / flagged_count as f64;
        let specificity = cleared as f64 / reference_count as f64;
        let j = sensitivity + specificity - 1.0;
        if best.is_none_or(|(best_j, ..)| j >= best_j) {
            best = Some((j, threshold, sensitivity, specificity));
        }
    }

    if let Some((j, threshold, sensitivity, specificity)) = best {
        analysis.cut = Some(match tail {
            Tail::Low => -threshold,
            Tail::High => threshold,
        });
        analysis.youden_j = Some(j);
        analysis.sensitivity = Some(sensitivity);
        analysis.specificity = Some(specificity);
    }
    analysis
}

/// Area under the ROC curve from the Mann-Whitney U statistic, with average
/// ranks for ties. `positive[i]` marks the group expected to score higher.
pub fn mann_whitney_auc(scores: &[f64], positive: &[bool]) -> Option<f64> {
    if scores.len() != positive.len() {
        return None;
    }
    let n = scores.len();
    let n_pos = positive.iter().filter(|p| **p).count() as f64;
    let n_neg = n as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return None;
    }

    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&i, &j| scores[i].partial_cmp(&scores[j]).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && scores[idx[j]] == scores[idx[i]] {
            j += 1;
        }
        let avg_rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for k in i..j {
            ranks[idx[k]] = avg_rank;
        }
        i = j;
    }

    let sum_ranks_pos: f64 = ranks
        .iter()
        .zip(positive)
        .filter(|(_, p)| **p)
        .map(|(r, _)| *r)
        .sum();
    Some((sum_ranks_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn labeled(values: &[(f64, bool)]) -> Vec<LabeledScore> {
        values
            .iter()
            .map(|&(z, flagged)| LabeledScore { z, flagged })
            .collect()
    }

    #[test]
    fn auc_handles_ties_and_perfect_separation() {
        assert_eq!(
            mann_whitney_auc(&[0.1, 0.2, 0.8, 0.9], &[false, false, true, true]),
            Some(1.0)
        );
        assert_eq!(mann_whitney_auc(&[0.5, 0.5], &[false, true]), Some(0.5));
        assert_eq!(mann_whitney_auc(&[0.5, 0.7], &[true, true]), None);
    }

    #[test]
    fn separable_low_tail_gets_perfect_youden() {
        let scores = labeled(&[
            (-3.0, true),
            (-2.5, true),
            (-0.5, false),
            (-0.2, false),
            (-0.1, false),
        ]);
        let low = analyze_tail(&scores, Tail::Low);
        assert_eq!(low.auc, Some(1.0));
        assert_abs_diff_eq!(low.cut.unwrap(), -1.5, epsilon = 1e-12);
        assert_eq!(low.youden_j, Some(1.0));
    }

    #[test]
    fn tail_without_flagged_respondents_never_flags() {
        let scores = labeled(&[(0.5, false), (1.5, false), (-2.0, true), (-0.1, false)]);
        let report = select_thresholds(&scores);
        assert_eq!(report.high.cut, None);
        assert_eq!(report.high.auc, None);
        assert!(!report.rule.is_flagged(10.0));
        assert!(report.rule.is_flagged(-2.0));
        assert_eq!(report.confusion.total(), 4);
        assert_eq!(report.metrics.accuracy, Some(1.0));
    }

    #[test]
    fn combined_rule_flags_both_tails() {
        let scores = labeled(&[
            (-2.4, true),
            (-0.3, false),
            (-0.6, false),
            (0.4, false),
            (0.2, false),
            (2.1, true),
            (1.9, true),
        ]);
        let report = select_thresholds(&scores);
        let rule = report.rule;
        assert!(rule.is_flagged(-2.4) && rule.is_flagged(2.1) && rule.is_flagged(1.9));
        assert!(!rule.is_flagged(0.0));
        assert_eq!(report.confusion.false_positive, 0);
        assert_eq!(report.metrics.f1, Some(1.0));
    }

    #[test]
    fn youden_ties_keep_the_most_extreme_cut() {
        // Cuts at -1.5 and -3.5 both reach J = 0.5.
        let scores = labeled(&[(-1.0, false), (-2.0, true), (-3.0, false), (-4.0, true)]);
        let low = analyze_tail(&scores, Tail::Low);
        assert_abs_diff_eq!(low.youden_j.unwrap(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(low.cut.unwrap(), -3.5, epsilon = 1e-12);
        assert_eq!(low.sensitivity, Some(0.5));
        assert_eq!(low.specificity, Some(1.0));
    }
}
