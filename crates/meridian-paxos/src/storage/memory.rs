//! Volatile state log.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::PaxosStateLog;
use crate::{PaxosResult, SequenceNumber};

/// A [`PaxosStateLog`] held entirely in memory.
///
/// Loses everything on restart; use only where losing a node's
/// promises is acceptable, i.e. tests and single-process clusters.
#[derive(Debug, Default)]
pub struct MemoryStateLog<T> {
    rounds: Mutex<BTreeMap<SequenceNumber, T>>,
}

impl<T> MemoryStateLog<T> {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rounds: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync> PaxosStateLog<T> for MemoryStateLog<T> {
    fn write_round(&self, seq: SequenceNumber, state: &T) -> PaxosResult<()> {
        self.rounds.lock().insert(seq, state.clone());
        Ok(())
    }

    fn read_round(&self, seq: SequenceNumber) -> PaxosResult<Option<T>> {
        Ok(self.rounds.lock().get(&seq).cloned())
    }

    fn greatest_round(&self) -> PaxosResult<Option<SequenceNumber>> {
        Ok(self.rounds.lock().keys().next_back().copied())
    }

    fn read_rounds_since(&self, from: SequenceNumber) -> PaxosResult<Vec<(SequenceNumber, T)>> {
        Ok(self
            .rounds
            .lock()
            .range(from..)
            .map(|(&seq, state)| (seq, state.clone()))
            .collect())
    }
}
