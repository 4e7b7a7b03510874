//! Run configuration. Every field has a default so a partial TOML file is enough.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Standard deviations of the Gaussian priors on the unconstrained item parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorScales {
    pub threshold_sd: f64,
    pub age_slope_sd: f64,
    pub log_spacing_sd: f64,
    pub correlation_sd: f64,
}

impl Default for PriorScales {
    fn default() -> Self {
        Self {
            threshold_sd: 2.0,
            age_slope_sd: 1.0,
            log_spacing_sd: 1.0,
            correlation_sd: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    /// Iteration cap for the joint fit. Also the only runtime bound on a LOOCV unit.
    pub max_iterations: usize,
    /// Iteration cap for single-respondent holdout fits.
    pub holdout_max_iterations: usize,
    /// Gradient-norm tolerance handed to BFGS.
    pub tolerance: f64,
    /// Gradient norm below which a stalled optimizer is still accepted as converged.
    pub acceptance_tolerance: f64,
    pub priors: PriorScales,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            holdout_max_iterations: 200,
            tolerance: 1e-6,
            acceptance_tolerance: 1e-3,
            priors: PriorScales::default(),
        }
    }
}

/// How the leave-one-out warm start is renormalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmStartStrategy {
    /// Per-dimension mean zero.
    MeanCentered,
    /// Mean zero and sample covariance equal to the latent correlation matrix.
    CorrelationConsistent,
}

impl WarmStartStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MeanCentered => "mean_centered",
            Self::CorrelationConsistent => "correlation_consistent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmStartConfig {
    pub strategy: WarmStartStrategy,
    /// Tolerance for the identification-constraint postcondition.
    pub tolerance: f64,
}

impl Default for WarmStartConfig {
    fn default() -> Self {
        Self {
            strategy: WarmStartStrategy::CorrelationConsistent,
            tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JackknifeConfig {
    /// Largest eigenvalue ratio accepted without regularization.
    pub condition_limit: f64,
    /// Ridge added to the diagonal, as a multiple of the mean diagonal.
    pub ridge_scale: f64,
    /// Minimum share of reference respondents with a usable difference vector.
    pub min_completion_fraction: f64,
}

impl Default for JackknifeConfig {
    fn default() -> Self {
        Self {
            condition_limit: 1e10,
            ridge_scale: 1e-6,
            min_completion_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluenceConfig {
    /// Scaled-score cutoff for "high influence" (the classical 4/N rule).
    pub high_threshold: f64,
    /// Score flagged respondents through augmented fits.
    pub score_flagged: bool,
}

impl Default for InfluenceConfig {
    fn default() -> Self {
        Self {
            high_threshold: 4.0,
            score_flagged: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingConfig {
    /// Propensities are clipped into `[lower, upper]` before the odds transform.
    pub propensity_floor: f64,
    pub propensity_ceiling: f64,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            propensity_floor: 0.05,
            propensity_ceiling: 0.95,
        }
    }
}

/// The complete configuration of one screening run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Minimum number of observed items for a respondent to be scored.
    pub min_items: usize,
    /// Worker threads for LOOCV and augmented fits; `None` uses every core.
    pub workers: Option<usize>,
    /// Completed LOOCV units between checkpoint flushes.
    pub checkpoint_every: usize,
    pub fitter: FitterConfig,
    pub warm_start: WarmStartConfig,
    pub jackknife: JackknifeConfig,
    pub influence: InfluenceConfig,
    pub weighting: WeightingConfig,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            min_items: 5,
            workers: None,
            checkpoint_every: 25,
            fitter: FitterConfig::default(),
            warm_start: WarmStartConfig::default(),
            jackknife: JackknifeConfig::default(),
            influence: InfluenceConfig::default(),
            weighting: WeightingConfig::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ScreeningConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.weighting;
        if !(0.0 < w.propensity_floor
            && w.propensity_floor < w.propensity_ceiling
            && w.propensity_ceiling < 1.0)
        {
            return Err(ConfigError::Invalid(format!(
                "propensity clip [{}, {}] must satisfy 0 < floor < ceiling < 1",
                w.propensity_floor, w.propensity_ceiling
            )));
        }
        if self.checkpoint_every == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint_every must be at least 1".to_string(),
            ));
        }
        let fraction = self.jackknife.min_completion_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::Invalid(format!(
                "min_completion_fraction {fraction} is outside [0, 1]"
            )));
        }
        for (name, value) in [
            ("threshold_sd", self.fitter.priors.threshold_sd),
            ("age_slope_sd", self.fitter.priors.age_slope_sd),
            ("log_spacing_sd", self.fitter.priors.log_spacing_sd),
            ("correlation_sd", self.fitter.priors.correlation_sd),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "prior scale {name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }
}
