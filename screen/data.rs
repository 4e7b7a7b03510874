//! # Response Data Loading and Validation
//!
//! This module is the entry point for survey data. It reads the item bank and the
//! long-form response table (TSV), validates them against a fixed schema, and builds
//! the owned `ResponseData` arena that every later stage borrows from.
//!
//! - Strict Schema: column names are not configurable. The item bank must carry
//!   `item_id`, `categories`, `dimension`; the response table must carry
//!   `respondent_id`, `age`, `authentic`, `item_id`, `response`.
//! - User-Centric Errors: failures are assumed to be user-input errors and are
//!   reported through `DataError` with the offending row or identifier.
//! - Borrowed Views: fitting never copies observations. A `ResponseView` holds
//!   references into the arena plus a freshly validated `RespondentIndex`.

use crate::index::{IndexError, RespondentIndex};
use ahash::AHashMap;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Largest number of latent dimensions the graded response model supports.
pub const MAX_DIMENSIONS: usize = 2;

/// External respondent identifier as it appears in the source data.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RespondentId(pub u64);

impl fmt::Display for RespondentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a respondent belongs to the authentic reference sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Reference,
    Flagged,
}

impl Membership {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Flagged => "flagged",
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single survey question with ordered response categories `0..categories`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub categories: usize,
    pub dimension: usize,
}

/// The validated set of items, addressed by integer position.
#[derive(Debug, Clone)]
pub struct ItemBank {
    items: Vec<Item>,
    lookup: AHashMap<String, usize>,
    dimensions: usize,
}

impl ItemBank {
    /// Validates the items and fixes their positional order.
    ///
    /// Dimension ids must form the contiguous range `0..D` with `1 <= D <= 2`.
    pub fn new(items: Vec<Item>) -> Result<Self, DataError> {
        if items.is_empty() {
            return Err(DataError::EmptyItemBank);
        }

        let mut lookup = AHashMap::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            if item.categories < 2 {
                return Err(DataError::TooFewCategories {
                    item_id: item.id.clone(),
                    categories: item.categories,
                });
            }
            if lookup.insert(item.id.clone(), position).is_some() {
                return Err(DataError::DuplicateItem(item.id.clone()));
            }
        }

        let used: HashSet<usize> = items.iter().map(|item| item.dimension).collect();
        let dimensions = used.len();
        if dimensions > MAX_DIMENSIONS {
            return Err(DataError::UnsupportedDimensionCount(dimensions));
        }
        if (0..dimensions).any(|d| !used.contains(&d)) {
            let mut found: Vec<usize> = used.into_iter().collect();
            found.sort_unstable();
            return Err(DataError::NonContiguousDimensions(found));
        }

        Ok(Self {
            items,
            lookup,
            dimensions,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn item(&self, position: usize) -> &Item {
        &self.items[position]
    }

    pub fn position(&self, item_id: &str) -> Option<usize> {
        self.lookup.get(item_id).copied()
    }
}

/// One observed (item, category) pair. `item` is a position in the `ItemBank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub item: usize,
    pub response: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Respondent {
    pub id: RespondentId,
    pub age: f64,
    pub membership: Membership,
    pub observations: Vec<Observation>,
}

impl Respondent {
    pub fn item_count(&self) -> usize {
        self.observations.len()
    }

    /// True when at least `min_items` items were answered.
    pub fn has_minimum_data(&self, min_items: usize) -> bool {
        self.item_count() >= min_items
    }
}

/// The owned arena of validated respondents.
#[derive(Debug, Clone)]
pub struct ResponseData {
    bank: ItemBank,
    respondents: Vec<Respondent>,
    index: RespondentIndex,
}

impl ResponseData {
    pub fn new(bank: ItemBank, respondents: Vec<Respondent>) -> Result<Self, DataError> {
        for respondent in &respondents {
            if !respondent.age.is_finite() {
                return Err(DataError::NonFiniteAge(respondent.id));
            }
            let mut seen = HashSet::with_capacity(respondent.observations.len());
            for obs in &respondent.observations {
                if obs.item >= bank.len() {
                    return Err(DataError::UnknownItemPosition {
                        respondent: respondent.id,
                        position: obs.item,
                    });
                }
                let item = bank.item(obs.item);
                if obs.response >= item.categories {
                    return Err(DataError::ResponseOutOfRange {
                        respondent: respondent.id,
                        item_id: item.id.clone(),
                        response: obs.response as i64,
                        categories: item.categories,
                    });
                }
                if !seen.insert(obs.item) {
                    return Err(DataError::DuplicateObservation {
                        respondent: respondent.id,
                        item_id: item.id.clone(),
                    });
                }
            }
        }

        let index = RespondentIndex::from_ids(respondents.iter().map(|r| r.id))?;
        Ok(Self {
            bank,
            respondents,
            index,
        })
    }

    pub fn bank(&self) -> &ItemBank {
        &self.bank
    }

    pub fn respondents(&self) -> &[Respondent] {
        &self.respondents
    }

    pub fn respondent(&self, id: RespondentId) -> Option<&Respondent> {
        self.index.position(id).map(|i| &self.respondents[i])
    }

    /// Reference respondents with enough observed items to enter the reference fit.
    pub fn reference_view(&self, min_items: usize) -> Result<ResponseView<'_>, IndexError> {
        let members = self
            .respondents
            .iter()
            .filter(|r| r.membership == Membership::Reference && r.has_minimum_data(min_items))
            .collect();
        ResponseView::from_members(&self.bank, members)
    }

    pub fn flagged(&self) -> impl Iterator<Item = &Respondent> {
        self.respondents
            .iter()
            .filter(|r| r.membership == Membership::Flagged)
    }
}

/// A borrowed subset of respondents with a contiguous, validated index.
#[derive(Debug, Clone)]
pub struct ResponseView<'a> {
    bank: &'a ItemBank,
    members: Vec<&'a Respondent>,
    index: RespondentIndex,
}

impl<'a> ResponseView<'a> {
    pub fn from_members(
        bank: &'a ItemBank,
        members: Vec<&'a Respondent>,
    ) -> Result<Self, IndexError> {
        let index = RespondentIndex::from_ids(members.iter().map(|r| r.id))?;
        index.validate()?;
        Ok(Self {
            bank,
            members,
            index,
        })
    }

    /// Removes one respondent and rebuilds the contiguous index over the rest.
    pub fn leave_one_out(&self, excluded: RespondentId) -> Result<ResponseView<'a>, IndexError> {
        if self.index.position(excluded).is_none() {
            return Err(IndexError::UnknownRespondent(excluded));
        }
        let members = self
            .members
            .iter()
            .copied()
            .filter(|r| r.id != excluded)
            .collect();
        Self::from_members(self.bank, members)
    }

    /// Appends one respondent that is not already part of the view.
    pub fn augmented(&self, extra: &'a Respondent) -> Result<ResponseView<'a>, IndexError> {
        let mut members = self.members.clone();
        members.push(extra);
        Self::from_members(self.bank, members)
    }

    pub fn bank(&self) -> &'a ItemBank {
        self.bank
    }

    pub fn respondents(&self) -> &[&'a Respondent] {
        &self.members
    }

    pub fn index(&self) -> &RespondentIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn observation_count(&self) -> usize {
        self.members.iter().map(|r| r.item_count()).sum()
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found: {found})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("The item bank is empty.")]
    EmptyItemBank,
    #[error("Item '{0}' is listed more than once in the item bank.")]
    DuplicateItem(String),
    #[error("Item '{item_id}' declares {categories} categories; at least 2 are required.")]
    TooFewCategories { item_id: String, categories: usize },
    #[error("The item bank uses {0} latent dimensions; at most 2 are supported.")]
    UnsupportedDimensionCount(usize),
    #[error("Dimension ids must be contiguous from 0; found {0:?}.")]
    NonContiguousDimensions(Vec<usize>),
    #[error("Respondent {respondent} answered item '{item_id}', which is not in the item bank.")]
    UnknownItem {
        respondent: RespondentId,
        item_id: String,
    },
    #[error("Respondent {respondent} references item position {position}, which is out of range.")]
    UnknownItemPosition {
        respondent: RespondentId,
        position: usize,
    },
    #[error(
        "Respondent {respondent} gave response {response} to item '{item_id}', outside [0, {categories})."
    )]
    ResponseOutOfRange {
        respondent: RespondentId,
        item_id: String,
        response: i64,
        categories: usize,
    },
    #[error("Respondent {respondent} answered item '{item_id}' more than once.")]
    DuplicateObservation {
        respondent: RespondentId,
        item_id: String,
    },
    #[error("Respondent {0} has rows that disagree on age or membership.")]
    InconsistentRespondent(RespondentId),
    #[error("Respondent {0} has a non-finite age.")]
    NonFiniteAge(RespondentId),
    #[error("Respondent index is inconsistent: {0}")]
    Index(#[from] IndexError),
}

/// Loads the item bank and response table and assembles the validated arena.
pub fn load_response_data(
    items_path: &Path,
    responses_path: &Path,
) -> Result<ResponseData, DataError> {
    let bank = load_item_bank(items_path)?;
    let respondents = internal::load_respondents(responses_path, &bank)?;
    log::info!(
        "Loaded {} respondents ({} reference) over {} items in {} dimension(s).",
        respondents.len(),
        respondents
            .iter()
            .filter(|r| r.membership == Membership::Reference)
            .count(),
        bank.len(),
        bank.dimensions()
    );
    ResponseData::new(bank, respondents)
}

/// Loads and validates the item bank TSV.
pub fn load_item_bank(path: &Path) -> Result<ItemBank, DataError> {
    let df = internal::read_tsv(path, &["item_id", "categories", "dimension"])?;
    let ids = internal::extract_string_column(&df, "item_id")?;
    let categories = internal::extract_integer_column(&df, "categories")?;
    let dimensions = internal::extract_integer_column(&df, "dimension")?;

    let items = ids
        .into_iter()
        .zip(categories)
        .zip(dimensions)
        .map(|((id, categories), dimension)| {
            Ok(Item {
                id,
                categories: internal::non_negative("categories", categories)?,
                dimension: internal::non_negative("dimension", dimension)?,
            })
        })
        .collect::<Result<Vec<_>, DataError>>()?;
    ItemBank::new(items)
}

/// Internal module for the shared TSV parsing logic.
mod internal {
    use super::*;

    pub(super) fn read_tsv(path: &Path, required: &[&str]) -> Result<DataFrame, DataError> {
        log::debug!("Loading data from '{}'", path.display());
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let columns: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for name in required {
            if !columns.contains(*name) {
                return Err(DataError::ColumnNotFound((*name).to_string()));
            }
        }
        Ok(df)
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found: format!("{:?}", series.dtype()),
            })?;
        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found: format!("{:?}", series.dtype()),
            });
        }

        let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_integer_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<i64>, DataError> {
        extract_numeric_column(df, column_name)?
            .into_iter()
            .map(|v| {
                if v.fract() == 0.0 {
                    Ok(v as i64)
                } else {
                    Err(DataError::ColumnWrongType {
                        column_name: column_name.to_string(),
                        expected_type: "integer",
                        found: v.to_string(),
                    })
                }
            })
            .collect()
    }

    pub(super) fn extract_string_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = series.cast(&DataType::String)?;
        Ok(casted
            .str()?
            .into_no_null_iter()
            .map(|s| s.trim().to_string())
            .collect())
    }

    struct PendingRespondent {
        age: f64,
        membership: Membership,
        observations: Vec<Observation>,
    }

    /// Converts a column value that must not be negative.
    pub(super) fn non_negative<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, DataError> {
        T::try_from(value).map_err(|_| DataError::ColumnWrongType {
            column_name: column.to_string(),
            expected_type: "non-negative integer",
            found: value.to_string(),
        })
    }

    pub(super) fn load_respondents(
        path: &Path,
        bank: &ItemBank,
    ) -> Result<Vec<Respondent>, DataError> {
        let df = read_tsv(
            path,
            &["respondent_id", "age", "authentic", "item_id", "response"],
        )?;
        let ids = extract_integer_column(&df, "respondent_id")?;
        let ages = extract_numeric_column(&df, "age")?;
        let authentic = extract_integer_column(&df, "authentic")?;
        let item_ids = extract_string_column(&df, "item_id")?;
        let responses = extract_integer_column(&df, "response")?;

        // BTreeMap keeps respondents in ascending id order regardless of row order.
        let mut pending: BTreeMap<RespondentId, PendingRespondent> = BTreeMap::new();
        for row in 0..df.height() {
            let id = RespondentId(non_negative("respondent_id", ids[row])?);
            let membership = match authentic[row] {
                1 => Membership::Reference,
                0 => Membership::Flagged,
                other => {
                    return Err(DataError::ColumnWrongType {
                        column_name: "authentic".to_string(),
                        expected_type: "0 or 1",
                        found: other.to_string(),
                    });
                }
            };
            let item = bank
                .position(&item_ids[row])
                .ok_or_else(|| DataError::UnknownItem {
                    respondent: id,
                    item_id: item_ids[row].clone(),
                })?;
            let categories = bank.item(item).categories;
            if responses[row] < 0 || responses[row] as usize >= categories {
                return Err(DataError::ResponseOutOfRange {
                    respondent: id,
                    item_id: item_ids[row].clone(),
                    response: responses[row],
                    categories,
                });
            }

            let entry = pending.entry(id).or_insert_with(|| PendingRespondent {
                age: ages[row],
                membership,
                observations: Vec::new(),
            });
            if entry.age != ages[row] || entry.membership != membership {
                return Err(DataError::InconsistentRespondent(id));
            }
            entry.observations.push(Observation {
                item,
                response: responses[row] as usize,
            });
        }

        Ok(pending
            .into_iter()
            .map(|(id, p)| Respondent {
                id,
                age: p.age,
                membership: p.membership,
                observations: p.observations,
            })
            .collect())
    }
}
