//! Synthetic survey data drawn from the graded response model.
//!
//! Reference respondents answer according to the model with correlated latent
//! abilities. Flagged respondents answer uniformly at random, which is the
//! pattern the screening is meant to separate. Output is deterministic for a
//! given seed.

use crate::data::{
    DataError, Item, ItemBank, MAX_DIMENSIONS, Membership, Observation, Respondent, RespondentId,
    ResponseData,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Simulation needs between 1 and {max} dimensions, got {0}.", max = MAX_DIMENSIONS)]
    Dimensions(usize),
    #[error("Latent correlation must lie strictly inside (-1, 1), got {0}.")]
    Correlation(f64),
    #[error("Missing-response rate must lie in [0, 1), got {0}.")]
    MissingRate(f64),
    #[error("Invalid distribution parameter: {0}")]
    Distribution(#[from] rand_distr::NormalError),
    #[error("Simulated data failed validation: {0}")]
    Data(#[from] DataError),
    #[error("Failed to write simulated table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to write simulated table: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub reference_count: usize,
    pub flagged_count: usize,
    pub item_count: usize,
    pub dimensions: usize,
    pub categories: usize,
    pub latent_correlation: f64,
    /// Probability that any single item is left unanswered.
    pub missing_rate: f64,
    /// Sd of the true item thresholds.
    pub threshold_sd: f64,
    /// Sd of the true per-item age slopes.
    pub age_slope_sd: f64,
    pub min_age: f64,
    pub max_age: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            reference_count: 40,
            flagged_count: 10,
            item_count: 10,
            dimensions: 2,
            categories: 5,
            latent_correlation: 0.4,
            missing_rate: 0.0,
            threshold_sd: 0.5,
            age_slope_sd: 0.1,
            min_age: 18.0,
            max_age: 80.0,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    fn validate(&self) -> Result<(), SimulationError> {
        if self.dimensions == 0 || self.dimensions > MAX_DIMENSIONS {
            return Err(SimulationError::Dimensions(self.dimensions));
        }
        if !(self.latent_correlation > -1.0 && self.latent_correlation < 1.0) {
            return Err(SimulationError::Correlation(self.latent_correlation));
        }
        if !(0.0..1.0).contains(&self.missing_rate) {
            return Err(SimulationError::MissingRate(self.missing_rate));
        }
        Ok(())
    }
}

/// Draws a complete dataset. Reference ids come first (`1..=reference_count`),
/// flagged ids follow.
pub fn simulate(config: &SimulationConfig) -> Result<ResponseData, SimulationError> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let items: Vec<Item> = (0..config.item_count)
        .map(|j| Item {
            id: format!("item_{j:02}"),
            categories: config.categories,
            dimension: j % config.dimensions,
        })
        .collect();
    let bank = ItemBank::new(items)?;

    let thresholds = Normal::new(0.0, config.threshold_sd)?;
    let slopes = Normal::new(0.0, config.age_slope_sd)?;
    let truth: Vec<(f64, f64)> = (0..bank.len())
        .map(|_| (thresholds.sample(&mut rng), slopes.sample(&mut rng)))
        .collect();
    let age_center = 0.5 * (config.min_age + config.max_age);
    let age_scale = ((config.max_age - config.min_age) / 12f64.sqrt()).max(1.0);

    let total = config.reference_count + config.flagged_count;
    let mut respondents = Vec::with_capacity(total);
    for slot in 0..total {
        let membership = if slot < config.reference_count {
            Membership::Reference
        } else {
            Membership::Flagged
        };
        let age = rng.gen_range(config.min_age..=config.max_age).round();
        let theta = draw_ability(&mut rng, config.dimensions, config.latent_correlation);
        let standardized_age = (age - age_center) / age_scale;

        let mut observations = Vec::with_capacity(bank.len());
        for (position, &(threshold, slope)) in truth.iter().enumerate() {
            if config.missing_rate > 0.0 && rng.gen_bool(config.missing_rate) {
                continue;
            }
            let item = bank.item(position);
            let response = match membership {
                Membership::Reference => {
                    let shift = theta[item.dimension] - slope * standardized_age;
                    graded_response(&mut rng, item.categories, shift - threshold)
                }
                Membership::Flagged => rng.gen_range(0..item.categories),
            };
            observations.push(Observation {
                item: position,
                response,
            });
        }
        respondents.push(Respondent {
            id: RespondentId(slot as u64 + 1),
            age,
            membership,
            observations,
        });
    }

    log::info!(
        "Simulated {} reference and {} flagged respondents over {} items (seed {})",
        config.reference_count,
        config.flagged_count,
        bank.len(),
        config.seed
    );
    Ok(ResponseData::new(bank, respondents)?)
}

fn draw_ability(rng: &mut StdRng, dimensions: usize, correlation: f64) -> [f64; MAX_DIMENSIONS] {
    let first: f64 = rng.sample(StandardNormal);
    if dimensions == 1 {
        return [first, 0.0];
    }
    let noise: f64 = rng.sample(StandardNormal);
    [
        first,
        correlation * first + (1.0 - correlation * correlation).sqrt() * noise,
    ]
}

/// Samples a category with unit cut-point spacing centred on the item midpoint.
fn graded_response(rng: &mut StdRng, categories: usize, location: f64) -> usize {
    let mid = categories as f64 / 2.0;
    let u: f64 = rng.gen_range(0.0..1.0);
    // P(Y >= k) falls with k, so the category is the number of exceeded cut points.
    (1..categories)
        .filter(|&k| u < 1.0 / (1.0 + (-(location - (k as f64 - mid))).exp()))
        .count()
}

/// Writes the dataset as the two tab-separated tables `load_response_data` reads.
pub fn write_dataset(
    data: &ResponseData,
    items_path: &Path,
    responses_path: &Path,
) -> Result<(), SimulationError> {
    let mut items = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(items_path)?;
    items.write_record(["item_id", "categories", "dimension"])?;
    for item in data.bank().items() {
        items.write_record([
            item.id.clone(),
            item.categories.to_string(),
            item.dimension.to_string(),
        ])?;
    }
    items.flush()?;

    let mut responses = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(responses_path)?;
    responses.write_record(["respondent_id", "age", "authentic", "item_id", "response"])?;
    for respondent in data.respondents() {
        let authentic = match respondent.membership {
            Membership::Reference => "1",
            Membership::Flagged => "0",
        };
        for obs in &respondent.observations {
            responses.write_record([
                respondent.id.to_string(),
                respondent.age.to_string(),
                authentic.to_string(),
                data.bank().item(obs.item).id.clone(),
                obs.response.to_string(),
            ])?;
        }
    }
    responses.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::load_response_data;
    use tempfile::tempdir;

    #[test]
    fn same_seed_gives_same_data() {
        let config = SimulationConfig::default();
        let a = simulate(&config).unwrap();
        let b = simulate(&config).unwrap();
        assert_eq!(a.respondents(), b.respondents());
        assert_eq!(a.respondents().len(), 50);
        assert_eq!(a.bank().dimensions(), 2);
        assert_eq!(a.flagged().count(), 10);
    }

    #[test]
    fn responses_stay_inside_categories() {
        let config = SimulationConfig {
            categories: 3,
            missing_rate: 0.3,
            seed: 7,
            ..SimulationConfig::default()
        };
        let data = simulate(&config).unwrap();
        for respondent in data.respondents() {
            assert!(respondent.observations.iter().all(|o| o.response < 3));
            assert!(respondent.item_count() <= 10);
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let three_dims = SimulationConfig {
            dimensions: 3,
            ..SimulationConfig::default()
        };
        assert!(matches!(
            simulate(&three_dims),
            Err(SimulationError::Dimensions(3))
        ));
        let perfect = SimulationConfig {
            latent_correlation: 1.0,
            ..SimulationConfig::default()
        };
        assert!(matches!(
            simulate(&perfect),
            Err(SimulationError::Correlation(_))
        ));
    }

    #[test]
    fn written_tables_load_back() {
        let data = simulate(&SimulationConfig::default()).unwrap();
        let dir = tempdir().unwrap();
        let items = dir.path().join("items.tsv");
        let responses = dir.path().join("responses.tsv");
        write_dataset(&data, &items, &responses).unwrap();
        let loaded = load_response_data(&items, &responses).unwrap();
        assert_eq!(loaded.respondents(), data.respondents());
        assert_eq!(loaded.bank().items(), data.bank().items());
    }
}
