//! Results buffer -- one pre-allocated slot per ordinal.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::{Ordinal, RowResult, TerminalState};

/// Pre-allocated, ordinal-indexed result slots
///
/// Each slot is published at most once; publishing is atomic per slot, so a
/// snapshot taken while workers are still running sees either a complete
/// result or nothing for every ordinal.
#[derive(Debug)]
pub(crate) struct ResultsBuffer {
    slots: Vec<OnceLock<RowResult>>,
    filled: AtomicUsize,
}

/// Per-state totals over the filled slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StateCounts {
    pub(crate) success: usize,
    pub(crate) classified_failure: usize,
    pub(crate) error: usize,
}

impl ResultsBuffer {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            slots: (0..total).map(|_| OnceLock::new()).collect(),
            filled: AtomicUsize::new(0),
        }
    }

    /// Number of slots (rows in the run)
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Slots holding a result
    pub(crate) fn filled(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.filled() == self.len()
    }

    pub(crate) fn contains(&self, ordinal: Ordinal) -> bool {
        self.slots
            .get(ordinal.get())
            .is_some_and(|slot| slot.get().is_some())
    }

    /// Store a result in its ordinal's slot
    ///
    /// Returns the number of filled slots after this publish, or gives the
    /// result back if its ordinal is out of range or already published.
    pub(crate) fn publish(&self, result: RowResult) -> Result<usize, RowResult> {
        let Some(slot) = self.slots.get(result.ordinal.get()) else {
            return Err(result);
        };
        slot.set(result)?;
        Ok(self.filled.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Filled slots in ordinal order
    pub(crate) fn iter(&self) -> impl Iterator<Item = &RowResult> {
        self.slots.iter().filter_map(OnceLock::get)
    }

    /// Ordinals with no result yet
    pub(crate) fn missing(&self) -> impl Iterator<Item = Ordinal> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.get().is_none())
            .map(|(i, _)| Ordinal(i))
    }

    pub(crate) fn counts(&self) -> StateCounts {
        self.iter().fold(StateCounts::default(), |mut counts, result| {
            match result.state {
                TerminalState::Success => counts.success += 1,
                TerminalState::ClassifiedFailure => counts.classified_failure += 1,
                TerminalState::UnrecoverableError => counts.error += 1,
            }
            counts
        })
    }
}
