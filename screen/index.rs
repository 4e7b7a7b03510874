//! Stable external-id to contiguous-index mapping for respondent subsets.
//!
//! Every view handed to a fitter (full reference set, leave-one-out set, augmented
//! set) gets its own `RespondentIndex`. Internal indices are always `0..n` with no
//! gaps, and the mapping is checked to be a bijection before use.

use crate::data::RespondentId;
use ahash::AHashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Respondent {0} appears more than once in the same view.")]
    DuplicateRespondent(RespondentId),
    #[error("Respondent {0} is not part of this view.")]
    UnknownRespondent(RespondentId),
    #[error(
        "Respondent index is not a bijection: {forward} forward entries, {reverse} reverse entries, first bad slot {slot}."
    )]
    NotBijective {
        forward: usize,
        reverse: usize,
        slot: usize,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RespondentIndex {
    forward: AHashMap<RespondentId, usize>,
    reverse: Vec<RespondentId>,
}

impl RespondentIndex {
    /// Assigns contiguous indices in iteration order.
    pub fn from_ids<I>(ids: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = RespondentId>,
    {
        let mut index = Self::default();
        for id in ids {
            let slot = index.reverse.len();
            if index.forward.insert(id, slot).is_some() {
                return Err(IndexError::DuplicateRespondent(id));
            }
            index.reverse.push(id);
        }
        Ok(index)
    }

    /// Checks that forward and reverse tables agree on every slot in `0..len`.
    pub fn validate(&self) -> Result<(), IndexError> {
        let forward = self.forward.len();
        let reverse = self.reverse.len();
        if forward != reverse {
            return Err(IndexError::NotBijective {
                forward,
                reverse,
                slot: forward.min(reverse),
            });
        }
        for (slot, id) in self.reverse.iter().enumerate() {
            if self.forward.get(id) != Some(&slot) {
                return Err(IndexError::NotBijective {
                    forward,
                    reverse,
                    slot,
                });
            }
        }
        Ok(())
    }

    pub fn position(&self, id: RespondentId) -> Option<usize> {
        self.forward.get(&id).copied()
    }

    pub fn id_at(&self, slot: usize) -> RespondentId {
        self.reverse[slot]
    }

    pub fn ids(&self) -> &[RespondentId] {
        &self.reverse
    }

    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }
}
