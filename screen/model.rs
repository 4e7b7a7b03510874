use crate::data::{ItemBank, Respondent, RespondentId, ResponseView};
use crate::estimate::EstimationError;
use crate::index::{IndexError, RespondentIndex};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs are the typed output contract of every fitting call. Downstream
// stages index parameters by position, never by name.

/// Shape of the flattened item-parameter vector.
///
/// The vector order is fixed:
/// `[threshold_0..threshold_{J-1}, age_slope_0..age_slope_{J-1}, log_spacing_0..log_spacing_{D-1}, atanh(correlation)]`,
/// with the trailing correlation term present only for two-dimensional models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterLayout {
    pub n_items: usize,
    pub n_dimensions: usize,
}

impl ParameterLayout {
    pub fn for_bank(bank: &ItemBank) -> Self {
        Self {
            n_items: bank.len(),
            n_dimensions: bank.dimensions(),
        }
    }

    pub fn correlated(&self) -> bool {
        self.n_dimensions > 1
    }

    /// Total number of item-level parameters, `p`.
    pub fn len(&self) -> usize {
        2 * self.n_items + self.n_dimensions + usize::from(self.correlated())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn age_slope_offset(&self) -> usize {
        self.n_items
    }

    pub fn spacing_offset(&self) -> usize {
        2 * self.n_items
    }

    pub fn correlation_offset(&self) -> Option<usize> {
        self.correlated()
            .then_some(2 * self.n_items + self.n_dimensions)
    }

    /// Column labels for the flattened vector, for human-readable tables only.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = Vec::with_capacity(self.len());
        labels.extend((0..self.n_items).map(|j| format!("threshold_{j}")));
        labels.extend((0..self.n_items).map(|j| format!("age_slope_{j}")));
        labels.extend((0..self.n_dimensions).map(|d| format!("log_spacing_{d}")));
        if self.correlated() {
            labels.push("atanh_correlation".to_string());
        }
        labels
    }
}

/// Item-level parameters of the graded response model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemParameters {
    /// Location of each item's central cut point.
    pub thresholds: Array1<f64>,
    /// Per-item shift of the cut points per standardized year of age.
    pub age_slopes: Array1<f64>,
    /// Log of the distance between adjacent cut points, one per dimension.
    pub log_spacings: Array1<f64>,
    /// Correlation between the two latent dimensions; `None` for one dimension.
    pub correlation: Option<f64>,
}

impl ItemParameters {
    /// Neutral starting values: centred thresholds, no age effect, unit spacing.
    pub fn neutral(layout: ParameterLayout) -> Self {
        Self {
            thresholds: Array1::zeros(layout.n_items),
            age_slopes: Array1::zeros(layout.n_items),
            log_spacings: Array1::zeros(layout.n_dimensions),
            correlation: layout.correlated().then_some(0.0),
        }
    }

    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout {
            n_items: self.thresholds.len(),
            n_dimensions: self.log_spacings.len(),
        }
    }

    pub fn spacing(&self, dimension: usize) -> f64 {
        self.log_spacings[dimension].exp()
    }

    pub fn latent_correlation(&self) -> f64 {
        self.correlation.unwrap_or(0.0)
    }

    /// Flattens into the documented fixed order (see [`ParameterLayout`]).
    pub fn to_vector(&self) -> Array1<f64> {
        let layout = self.layout();
        let mut out = Array1::zeros(layout.len());
        for j in 0..layout.n_items {
            out[j] = self.thresholds[j];
            out[layout.age_slope_offset() + j] = self.age_slopes[j];
        }
        for d in 0..layout.n_dimensions {
            out[layout.spacing_offset() + d] = self.log_spacings[d];
        }
        if let Some(offset) = layout.correlation_offset() {
            out[offset] = self.latent_correlation().atanh();
        }
        out
    }

    pub fn from_vector(layout: ParameterLayout, values: ArrayView1<f64>) -> Result<Self, ModelError> {
        if values.len() != layout.len() {
            return Err(ModelError::ParameterLength {
                expected: layout.len(),
                found: values.len(),
            });
        }
        let j = layout.n_items;
        let thresholds = values.slice(ndarray::s![..j]).to_owned();
        let age_slopes = values.slice(ndarray::s![j..2 * j]).to_owned();
        let log_spacings = values
            .slice(ndarray::s![layout.spacing_offset()..layout.spacing_offset() + layout.n_dimensions])
            .to_owned();
        let correlation = layout.correlation_offset().map(|offset| values[offset].tanh());
        Ok(Self {
            thresholds,
            age_slopes,
            log_spacings,
            correlation,
        })
    }
}

/// Outcome of a numerical optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceCode {
    /// The optimizer met its gradient tolerance.
    Converged,
    /// The line search or iteration cap stopped the optimizer, but the gradient at
    /// the final point is below the acceptance tolerance.
    StalledNearOptimum,
    IterationLimit,
    Failed,
}

impl ConvergenceCode {
    pub fn is_converged(self) -> bool {
        matches!(self, Self::Converged | Self::StalledNearOptimum)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::StalledNearOptimum => "stalled_near_optimum",
            Self::IterationLimit => "iteration_limit",
            Self::Failed => "failed",
        }
    }
}

/// Result of one fitting call. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFit {
    pub items: ItemParameters,
    /// External ids in the row order of `abilities`.
    pub respondent_ids: Vec<RespondentId>,
    /// Ability estimates, one row per respondent and one column per dimension.
    pub abilities: Array2<f64>,
    pub log_posterior: f64,
    pub convergence: ConvergenceCode,
    pub iterations: usize,
    pub gradient_norm: f64,
}

impl ModelFit {
    pub fn index(&self) -> Result<RespondentIndex, IndexError> {
        RespondentIndex::from_ids(self.respondent_ids.iter().copied())
    }

    pub fn layout(&self) -> ParameterLayout {
        self.items.layout()
    }

    /// Saves the fit to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fit from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let fit: Self = toml::from_str(&toml_string)?;
        if fit.abilities.nrows() != fit.respondent_ids.len() {
            return Err(ModelError::AbilityShape {
                rows: fit.abilities.nrows(),
                respondents: fit.respondent_ids.len(),
            });
        }
        Ok(fit)
    }
}

/// Result of scoring one respondent against frozen item parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldoutFit {
    pub ability: Array1<f64>,
    pub log_posterior: f64,
    pub convergence: ConvergenceCode,
}

/// Starting point for a fitting call, aligned to the view's respondent order.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialValues {
    pub items: ItemParameters,
    pub abilities: Array2<f64>,
}

/// The latent-trait estimator consumed by the screening core.
///
/// Implementations must be deterministic given identical data and initial values.
pub trait ModelFitter: Sync {
    fn fit(
        &self,
        data: &ResponseView<'_>,
        init: Option<&InitialValues>,
    ) -> Result<ModelFit, EstimationError>;

    fn fit_holdout(
        &self,
        items: &ItemParameters,
        bank: &ItemBank,
        respondent: &Respondent,
    ) -> Result<HoldoutFit, EstimationError>;
}

/// Custom error type for model persistence and parameter reshaping.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Parameter vector has length {found}, but the layout requires {expected}.")]
    ParameterLength { expected: usize, found: usize },
    #[error("Model file has {rows} ability rows for {respondents} respondents.")]
    AbilityShape { rows: usize, respondents: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn layout_counts_match_two_dimensional_scenario() {
        let layout = ParameterLayout {
            n_items: 10,
            n_dimensions: 2,
        };
        assert_eq!(layout.len(), 23);
        assert_eq!(layout.correlation_offset(), Some(22));
        let labels = layout.labels();
        assert_eq!(labels.len(), 23);
        assert_eq!(labels[10], "age_slope_0");
        assert_eq!(labels[22], "atanh_correlation");

        let single = ParameterLayout {
            n_items: 4,
            n_dimensions: 1,
        };
        assert_eq!(single.len(), 9);
        assert_eq!(single.correlation_offset(), None);
    }

    #[test]
    fn vector_order_is_positional() {
        let params = ItemParameters {
            thresholds: array![0.1, 0.2],
            age_slopes: array![-0.3, 0.4],
            log_spacings: array![0.5, 0.6],
            correlation: Some(0.25),
        };
        let v = params.to_vector();
        assert_eq!(v.len(), 7);
        assert_eq!(v[1], 0.2);
        assert_eq!(v[2], -0.3);
        assert_eq!(v[5], 0.6);
        assert!((v[6] - 0.25_f64.atanh()).abs() < 1e-15);

        let back = ItemParameters::from_vector(params.layout(), v.view()).unwrap();
        assert!((back.latent_correlation() - 0.25).abs() < 1e-12);
        assert_eq!(back.thresholds, params.thresholds);
    }

    #[test]
    fn from_vector_rejects_wrong_length() {
        let layout = ParameterLayout {
            n_items: 2,
            n_dimensions: 1,
        };
        let err = ItemParameters::from_vector(layout, array![1.0, 2.0].view()).unwrap_err();
        assert!(matches!(
            err,
            ModelError::ParameterLength {
                expected: 5,
                found: 2
            }
        ));
    }

    #[test]
    fn fit_survives_toml_round_trip() {
        let fit = ModelFit {
            items: ItemParameters::neutral(ParameterLayout {
                n_items: 3,
                n_dimensions: 2,
            }),
            respondent_ids: vec![RespondentId(4), RespondentId(9)],
            abilities: array![[0.5, -0.5], [-0.5, 0.5]],
            log_posterior: -42.5,
            convergence: ConvergenceCode::Converged,
            iterations: 17,
            gradient_norm: 1e-7,
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        fit.save(&path).unwrap();
        let loaded = ModelFit::load(&path).unwrap();
        assert_eq!(loaded.respondent_ids, fit.respondent_ids);
        assert_eq!(loaded.abilities, fit.abilities);
        assert_eq!(loaded.items, fit.items);
        assert_eq!(loaded.convergence, ConvergenceCode::Converged);
    }
}
