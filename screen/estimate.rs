// screen/estimate.rs

//! # Graded Response Model Estimation
//!
//! This module provides the concrete latent-trait estimator used by the screening
//! core. The model is a between-item multidimensional graded response model:
//!
//! 1.  **Likelihood:** item `j` loads on dimension `d_j`. With shift
//!     `s = theta_{i,d_j} - age_slope_j * age_i` and cut points
//!     `tau_k = threshold_j + spacing_{d_j} * (k - K_j / 2)`, the cumulative
//!     probability is `P(Y >= k) = logistic(s - tau_k)`.
//!
//! 2.  **Posterior:** abilities follow `N(0, R)` where `R` is the latent
//!     correlation matrix; item parameters carry independent Gaussian priors on
//!     their unconstrained scale (log spacing, atanh correlation).
//!
//! 3.  **Optimization:** the joint MAP is found with BFGS (Wolfe line search) on
//!     analytic gradients. The holdout fit optimizes one respondent's abilities
//!     against frozen item parameters.

use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

use crate::config::{FitterConfig, PriorScales};
use crate::data::{ItemBank, MAX_DIMENSIONS, Respondent, RespondentId, ResponseView};
use crate::model::{
    ConvergenceCode, HoldoutFit, InitialValues, ItemParameters, ModelError, ModelFit,
    ModelFitter, ParameterLayout,
};

use ndarray::{Array1, Array2, ArrayView1, s};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/// Floor applied to category probabilities before taking logs.
const MIN_PROBABILITY: f64 = 1e-300;

/// Cost returned to the line search when the objective is not finite.
const NON_FINITE_COST: f64 = 1e10;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Cannot fit a model to a view with no respondents.")]
    EmptyData,

    #[error("Respondent {0} has no observed items to score.")]
    EmptyRespondent(RespondentId),

    #[error("Item parameters have layout {found:?}, but the item bank requires {expected:?}.")]
    LayoutMismatch {
        expected: ParameterLayout,
        found: ParameterLayout,
    },

    #[error(
        "Initial abilities have shape ({rows}, {cols}); the view requires ({expected_rows}, {expected_cols})."
    )]
    InitialValuesShape {
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },

    #[error("BFGS optimization failed: {0}")]
    OptimizerFailed(String),

    #[error("The objective is not finite at the starting point (value {0}).")]
    NonFiniteStart(f64),

    #[error("Model parameter reshaping failed: {0}")]
    Model(#[from] ModelError),
}

/// Centre and scale used to standardize age. Frozen once per screening run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeScaling {
    pub center: f64,
    pub scale: f64,
}

impl Default for AgeScaling {
    fn default() -> Self {
        Self {
            center: 0.0,
            scale: 1.0,
        }
    }
}

impl AgeScaling {
    /// Mean and standard deviation (n - 1 divisor) of the given ages.
    pub fn from_ages<I>(ages: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let values: Vec<f64> = ages.into_iter().collect();
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let center = values.iter().sum::<f64>() / n;
        let scale = if values.len() > 1 {
            (values.iter().map(|a| (a - center).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        Self {
            center,
            scale: if scale > 1e-12 { scale } else { 1.0 },
        }
    }

    pub fn standardize(&self, age: f64) -> f64 {
        (age - self.center) / self.scale
    }
}

/// The production estimator: MAP fitting of the graded response model.
#[derive(Debug, Clone)]
pub struct GrmFitter {
    config: FitterConfig,
    age: AgeScaling,
}

impl GrmFitter {
    pub fn new(config: FitterConfig, age: AgeScaling) -> Self {
        Self { config, age }
    }

    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    pub fn age_scaling(&self) -> AgeScaling {
        self.age
    }
}

impl ModelFitter for GrmFitter {
    fn fit(
        &self,
        data: &ResponseView<'_>,
        init: Option<&InitialValues>,
    ) -> Result<ModelFit, EstimationError> {
        if data.is_empty() {
            return Err(EstimationError::EmptyData);
        }
        let layout = ParameterLayout::for_bank(data.bank());
        let n = data.len();
        let dims = layout.n_dimensions;

        let start = match init {
            Some(init) => {
                if init.items.layout() != layout {
                    return Err(EstimationError::LayoutMismatch {
                        expected: layout,
                        found: init.items.layout(),
                    });
                }
                if init.abilities.dim() != (n, dims) {
                    return Err(EstimationError::InitialValuesShape {
                        expected_rows: n,
                        expected_cols: dims,
                        rows: init.abilities.nrows(),
                        cols: init.abilities.ncols(),
                    });
                }
                internal::pack(&init.items, init.abilities.view())
            }
            None => internal::pack(
                &ItemParameters::neutral(layout),
                Array2::<f64>::zeros((n, dims)).view(),
            ),
        };

        let objective = internal::JointObjective::new(data, layout, self.age, self.config.priors);
        let minimum = internal::minimize(
            start,
            |x| objective.cost_and_grad(x),
            self.config.max_iterations,
            self.config.tolerance,
            self.config.acceptance_tolerance,
        )?;

        let p = layout.len();
        let items = ItemParameters::from_vector(layout, minimum.point.slice(s![..p]))?;
        let abilities = Array2::from_shape_vec((n, dims), minimum.point.slice(s![p..]).to_vec())
            .map_err(|e| EstimationError::OptimizerFailed(format!("ability reshape: {e}")))?;

        log::debug!(
            "GRM fit over {} respondents: log-posterior {:.4}, {} iterations, {}",
            n,
            -minimum.value,
            minimum.iterations,
            minimum.convergence.as_str()
        );

        Ok(ModelFit {
            items,
            respondent_ids: data.index().ids().to_vec(),
            abilities,
            log_posterior: -minimum.value,
            convergence: minimum.convergence,
            iterations: minimum.iterations,
            gradient_norm: minimum.gradient_norm,
        })
    }

    fn fit_holdout(
        &self,
        items: &ItemParameters,
        bank: &ItemBank,
        respondent: &Respondent,
    ) -> Result<HoldoutFit, EstimationError> {
        let layout = ParameterLayout::for_bank(bank);
        if items.layout() != layout {
            return Err(EstimationError::LayoutMismatch {
                expected: layout,
                found: items.layout(),
            });
        }
        if respondent.observations.is_empty() {
            return Err(EstimationError::EmptyRespondent(respondent.id));
        }

        let objective = internal::HoldoutObjective {
            bank,
            items,
            respondent,
            age: self.age.standardize(respondent.age),
        };
        let minimum = internal::minimize(
            Array1::zeros(layout.n_dimensions),
            |theta| objective.cost_and_grad(theta),
            self.config.holdout_max_iterations,
            self.config.tolerance,
            self.config.acceptance_tolerance,
        )?;

        Ok(HoldoutFit {
            ability: minimum.point,
            log_posterior: -minimum.value,
            convergence: minimum.convergence,
        })
    }
}

/// Log-probability of one graded response and its partial derivatives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GradedTerm {
    pub log_prob: f64,
    /// Derivative with respect to the shift `theta - age_slope * age`.
    /// The threshold derivative is its negation.
    pub d_shift: f64,
    /// Derivative with respect to the (positive) cut-point spacing.
    pub d_spacing: f64,
}

fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub(crate) fn graded_term(
    response: usize,
    categories: usize,
    shift: f64,
    threshold: f64,
    spacing: f64,
) -> GradedTerm {
    let mid = categories as f64 / 2.0;
    // +inf below the first cut point, -inf above the last one.
    let argument = |k: usize| -> f64 {
        if k == 0 {
            f64::INFINITY
        } else if k >= categories {
            f64::NEG_INFINITY
        } else {
            shift - threshold - spacing * (k as f64 - mid)
        }
    };
    let density = |u: f64| -> f64 {
        if u.is_finite() {
            let p = logistic(u);
            p * (1.0 - p)
        } else {
            0.0
        }
    };

    let upper = argument(response);
    let lower = argument(response + 1);
    let raw = if lower > 0.0 {
        logistic(-lower) - logistic(-upper)
    } else {
        logistic(upper) - logistic(lower)
    };
    let prob = raw.max(MIN_PROBABILITY);

    let q_upper = density(upper);
    let q_lower = density(lower);
    let c_upper = response as f64 - mid;
    let c_lower = (response + 1) as f64 - mid;

    GradedTerm {
        log_prob: prob.ln(),
        d_shift: (q_upper - q_lower) / prob,
        d_spacing: (c_lower * q_lower - c_upper * q_upper) / prob,
    }
}

/// Log-density of the latent ability prior and its derivatives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LatentPrior {
    pub log_density: f64,
    pub d_theta: [f64; MAX_DIMENSIONS],
    /// Derivative with respect to `atanh(correlation)`.
    pub d_atanh: f64,
}

pub(crate) fn latent_log_prior(theta: ArrayView1<f64>, correlation: f64) -> LatentPrior {
    match theta.len() {
        1 => LatentPrior {
            log_density: -0.5 * theta[0] * theta[0] - 0.5 * (2.0 * PI).ln(),
            d_theta: [-theta[0], 0.0],
            d_atanh: 0.0,
        },
        _ => {
            let (t1, t2) = (theta[0], theta[1]);
            let r = correlation;
            let one_minus = 1.0 - r * r;
            let q = t1 * t1 - 2.0 * r * t1 * t2 + t2 * t2;
            LatentPrior {
                log_density: -0.5 * q / one_minus - 0.5 * one_minus.ln() - (2.0 * PI).ln(),
                d_theta: [-(t1 - r * t2) / one_minus, -(t2 - r * t1) / one_minus],
                d_atanh: t1 * t2 - r * q / one_minus + r,
            }
        }
    }
}

/// `log N(x; 0, sd^2)` and its derivative.
fn gaussian_log_density(x: f64, sd: f64) -> (f64, f64) {
    let z = x / sd;
    (
        -0.5 * z * z - sd.ln() - 0.5 * (2.0 * PI).ln(),
        -x / (sd * sd),
    )
}

/// Internal module for objective evaluation and the optimizer driver.
mod internal {
    use super::*;

    pub(super) struct Minimum {
        pub point: Array1<f64>,
        pub value: f64,
        pub iterations: usize,
        pub gradient_norm: f64,
        pub convergence: ConvergenceCode,
    }

    pub(super) fn pack(items: &ItemParameters, abilities: ndarray::ArrayView2<f64>) -> Array1<f64> {
        let head = items.to_vector();
        let mut out = Array1::zeros(head.len() + abilities.len());
        out.slice_mut(s![..head.len()]).assign(&head);
        for (slot, value) in abilities.iter().enumerate() {
            out[head.len() + slot] = *value;
        }
        out
    }

    fn guard(cost: f64, grad: Array1<f64>) -> (f64, Array1<f64>) {
        if cost.is_finite() && grad.iter().all(|g| g.is_finite()) {
            (cost, grad)
        } else {
            log::trace!("Non-finite cost encountered: {cost}, returning large finite value");
            let len = grad.len();
            (NON_FINITE_COST, Array1::zeros(len))
        }
    }

    /// Runs BFGS and classifies how it stopped.
    pub(super) fn minimize<F>(
        start: Array1<f64>,
        objective: F,
        max_iterations: usize,
        tolerance: f64,
        acceptance_tolerance: f64,
    ) -> Result<Minimum, EstimationError>
    where
        F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
    {
        let (initial_cost, _) = objective(&start);
        if !initial_cost.is_finite() || initial_cost >= NON_FINITE_COST {
            return Err(EstimationError::NonFiniteStart(initial_cost));
        }

        let outcome = Bfgs::new(start, |x: &Array1<f64>| objective(x))
            .with_tolerance(tolerance)
            .with_max_iterations(max_iterations)
            .run();

        let (solution, stop): (BfgsSolution, Option<ConvergenceCode>) = match outcome {
            Ok(solution) => (solution, None),
            Err(BfgsError::LineSearchFailed { last_solution, .. }) => {
                (*last_solution, Some(ConvergenceCode::Failed))
            }
            Err(BfgsError::MaxIterationsReached { last_solution, .. }) => {
                (*last_solution, Some(ConvergenceCode::IterationLimit))
            }
            Err(e) => {
                return Err(EstimationError::OptimizerFailed(format!("{e:?}")));
            }
        };

        let (value, grad) = objective(&solution.final_point);
        let gradient_norm = grad.dot(&grad).sqrt();
        let convergence = match stop {
            None => ConvergenceCode::Converged,
            Some(_) if value < NON_FINITE_COST && gradient_norm <= acceptance_tolerance => {
                ConvergenceCode::StalledNearOptimum
            }
            Some(code) => code,
        };

        Ok(Minimum {
            point: solution.final_point,
            value,
            iterations: solution.iterations,
            gradient_norm,
            convergence,
        })
    }

    /// Negative joint log-posterior over item parameters and all abilities.
    pub(super) struct JointObjective<'v, 'a> {
        view: &'v ResponseView<'a>,
        layout: ParameterLayout,
        ages: Vec<f64>,
        priors: PriorScales,
    }

    impl<'v, 'a> JointObjective<'v, 'a> {
        pub fn new(
            view: &'v ResponseView<'a>,
            layout: ParameterLayout,
            age: AgeScaling,
            priors: PriorScales,
        ) -> Self {
            let ages = view
                .respondents()
                .iter()
                .map(|r| age.standardize(r.age))
                .collect();
            Self {
                view,
                layout,
                ages,
                priors,
            }
        }

        pub fn log_posterior(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
            let layout = self.layout;
            let p = layout.len();
            let dims = layout.n_dimensions;
            let slope_at = layout.age_slope_offset();
            let spacing_at = layout.spacing_offset();
            let correlation = layout.correlation_offset().map_or(0.0, |o| x[o].tanh());
            let spacings: Vec<f64> = (0..dims).map(|d| x[spacing_at + d].exp()).collect();

            let mut grad = Array1::zeros(x.len());
            let mut total = 0.0;

            for (i, respondent) in self.view.respondents().iter().enumerate() {
                let age = self.ages[i];
                let base = p + i * dims;
                for obs in &respondent.observations {
                    let item = self.view.bank().item(obs.item);
                    let d = item.dimension;
                    let j = obs.item;
                    let shift = x[base + d] - x[slope_at + j] * age;
                    let term =
                        graded_term(obs.response, item.categories, shift, x[j], spacings[d]);
                    total += term.log_prob;
                    grad[base + d] += term.d_shift;
                    grad[j] -= term.d_shift;
                    grad[slope_at + j] -= age * term.d_shift;
                    grad[spacing_at + d] += spacings[d] * term.d_spacing;
                }

                let prior = latent_log_prior(x.slice(s![base..base + dims]), correlation);
                total += prior.log_density;
                for d in 0..dims {
                    grad[base + d] += prior.d_theta[d];
                }
                if let Some(offset) = layout.correlation_offset() {
                    grad[offset] += prior.d_atanh;
                }
            }

            for j in 0..layout.n_items {
                let (lp, g) = gaussian_log_density(x[j], self.priors.threshold_sd);
                total += lp;
                grad[j] += g;
                let (lp, g) = gaussian_log_density(x[slope_at + j], self.priors.age_slope_sd);
                total += lp;
                grad[slope_at + j] += g;
            }
            for d in 0..dims {
                let (lp, g) = gaussian_log_density(x[spacing_at + d], self.priors.log_spacing_sd);
                total += lp;
                grad[spacing_at + d] += g;
            }
            if let Some(offset) = layout.correlation_offset() {
                let (lp, g) = gaussian_log_density(x[offset], self.priors.correlation_sd);
                total += lp;
                grad[offset] += g;
            }

            (total, grad)
        }

        pub fn cost_and_grad(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
            let (lp, grad) = self.log_posterior(x);
            guard(-lp, -grad)
        }
    }

    /// Negative log-posterior of one respondent's abilities with items frozen.
    pub(super) struct HoldoutObjective<'a> {
        pub bank: &'a ItemBank,
        pub items: &'a ItemParameters,
        pub respondent: &'a Respondent,
        pub age: f64,
    }

    impl HoldoutObjective<'_> {
        pub fn log_posterior(&self, theta: &Array1<f64>) -> (f64, Array1<f64>) {
            let mut grad = Array1::zeros(theta.len());
            let mut total = 0.0;
            for obs in &self.respondent.observations {
                let item = self.bank.item(obs.item);
                let d = item.dimension;
                let shift = theta[d] - self.items.age_slopes[obs.item] * self.age;
                let term = graded_term(
                    obs.response,
                    item.categories,
                    shift,
                    self.items.thresholds[obs.item],
                    self.items.spacing(d),
                );
                total += term.log_prob;
                grad[d] += term.d_shift;
            }
            let prior = latent_log_prior(theta.view(), self.items.latent_correlation());
            total += prior.log_density;
            for d in 0..theta.len() {
                grad[d] += prior.d_theta[d];
            }
            (total, grad)
        }

        pub fn cost_and_grad(&self, theta: &Array1<f64>) -> (f64, Array1<f64>) {
            let (lp, grad) = self.log_posterior(theta);
            guard(-lp, -grad)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Item, Membership, Observation, ResponseData};
    use approx::assert_abs_diff_eq;

    fn small_data() -> ResponseData {
        let bank = ItemBank::new(vec![
            Item {
                id: "a".to_string(),
                categories: 3,
                dimension: 0,
            },
            Item {
                id: "b".to_string(),
                categories: 4,
                dimension: 0,
            },
            Item {
                id: "c".to_string(),
                categories: 2,
                dimension: 1,
            },
            Item {
                id: "d".to_string(),
                categories: 5,
                dimension: 1,
            },
        ])
        .unwrap();
        let patterns = [
            [0usize, 1, 0, 2],
            [2, 3, 1, 4],
            [1, 2, 1, 3],
            [0, 0, 0, 1],
            [2, 2, 1, 2],
            [1, 1, 0, 0],
        ];
        let respondents = patterns
            .iter()
            .enumerate()
            .map(|(i, pattern)| Respondent {
                id: RespondentId(i as u64 + 1),
                age: 20.0 + 7.0 * i as f64,
                membership: Membership::Reference,
                observations: pattern
                    .iter()
                    .enumerate()
                    .map(|(item, &response)| Observation { item, response })
                    .collect(),
            })
            .collect();
        ResponseData::new(bank, respondents).unwrap()
    }

    #[test]
    fn category_probabilities_sum_to_one() {
        for categories in 2..6 {
            let total: f64 = (0..categories)
                .map(|y| graded_term(y, categories, 0.3, -0.2, 0.8).log_prob.exp())
                .sum();
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn graded_term_derivatives_match_finite_differences() {
        let h = 1e-6;
        for y in 0..4 {
            let base = graded_term(y, 4, 0.4, 0.1, 0.9);
            let ds = (graded_term(y, 4, 0.4 + h, 0.1, 0.9).log_prob
                - graded_term(y, 4, 0.4 - h, 0.1, 0.9).log_prob)
                / (2.0 * h);
            let dd = (graded_term(y, 4, 0.4, 0.1, 0.9 + h).log_prob
                - graded_term(y, 4, 0.4, 0.1, 0.9 - h).log_prob)
                / (2.0 * h);
            assert_abs_diff_eq!(base.d_shift, ds, epsilon = 1e-6);
            assert_abs_diff_eq!(base.d_spacing, dd, epsilon = 1e-6);
        }
    }

    #[test]
    fn joint_gradient_matches_finite_differences() {
        let data = small_data();
        let view = data.reference_view(1).unwrap();
        let layout = ParameterLayout::for_bank(view.bank());
        let objective = internal::JointObjective::new(
            &view,
            layout,
            AgeScaling::from_ages(view.respondents().iter().map(|r| r.age)),
            PriorScales::default(),
        );

        let len = layout.len() + view.len() * layout.n_dimensions;
        let x = Array1::from_iter((0..len).map(|k| 0.1 * ((k * 7 % 11) as f64 - 5.0) / 5.0));
        let (_, grad) = objective.log_posterior(&x);

        let h = 1e-6;
        for k in 0..len {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[k] += h;
            minus[k] -= h;
            let fd = (objective.log_posterior(&plus).0 - objective.log_posterior(&minus).0)
                / (2.0 * h);
            assert_abs_diff_eq!(grad[k], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn age_scaling_handles_constant_ages() {
        let scaling = AgeScaling::from_ages([40.0, 40.0, 40.0]);
        assert_eq!(scaling.scale, 1.0);
        assert_eq!(scaling.standardize(41.0), 1.0);
    }

    #[test]
    fn fit_and_holdout_return_finite_posteriors() {
        let data = small_data();
        let view = data.reference_view(1).unwrap();
        let fitter = GrmFitter::new(
            FitterConfig::default(),
            AgeScaling::from_ages(view.respondents().iter().map(|r| r.age)),
        );
        let fit = fitter.fit(&view, None).unwrap();
        assert!(fit.log_posterior.is_finite());
        assert_eq!(fit.abilities.dim(), (6, 2));
        assert_eq!(fit.items.to_vector().len(), 2 * 4 + 2 + 1);

        let respondent = data.respondent(RespondentId(2)).unwrap();
        let holdout = fitter
            .fit_holdout(&fit.items, data.bank(), respondent)
            .unwrap();
        assert!(holdout.log_posterior.is_finite());
        assert!(holdout.convergence.is_converged());
        assert_eq!(holdout.ability.len(), 2);
    }

    #[test]
    fn warm_started_refit_rejects_mismatched_abilities() {
        let data = small_data();
        let view = data.reference_view(1).unwrap();
        let fitter = GrmFitter::new(FitterConfig::default(), AgeScaling::default());
        let init = InitialValues {
            items: ItemParameters::neutral(ParameterLayout::for_bank(view.bank())),
            abilities: Array2::zeros((3, 2)),
        };
        assert!(matches!(
            fitter.fit(&view, Some(&init)),
            Err(EstimationError::InitialValuesShape { rows: 3, .. })
        ));
    }
}
