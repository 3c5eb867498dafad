//! The learner half of the protocol.
//!
//! Learners hold the decided value of each round. A value, once
//! learned, is immutable: relearning the same round is a no-op, and a
//! conflicting relearn keeps the first value and logs loudly, since
//! two values for one round means the protocol was violated somewhere.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use meridian_common::types::NodeId;
use parking_lot::Mutex;
use tracing::warn;

use crate::rpc::{AcceptedProposal, PaxosLearn};
use crate::storage::PaxosStateLog;
use crate::{PaxosResult, SequenceNumber};

/// A Paxos learner over a durable state log.
pub struct PaxosLearner {
    node_id: NodeId,
    learned: Mutex<BTreeMap<SequenceNumber, AcceptedProposal>>,
    log: Arc<dyn PaxosStateLog<AcceptedProposal>>,
}

impl PaxosLearner {
    /// Opens a learner, reloading all previously learned rounds.
    ///
    /// # Errors
    ///
    /// Propagates state log read failures.
    pub fn new(
        node_id: NodeId,
        log: Arc<dyn PaxosStateLog<AcceptedProposal>>,
    ) -> PaxosResult<Self> {
        let learned = log.read_rounds_since(0)?.into_iter().collect();
        Ok(Self {
            node_id,
            learned: Mutex::new(learned),
            log,
        })
    }

    /// The node this learner runs on.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Records a decided value.
    ///
    /// Idempotent for repeated learns of the same round. A conflicting
    /// value for an already learned round is dropped.
    ///
    /// # Errors
    ///
    /// Propagates state log write failures; the round is not recorded
    /// when persistence fails.
    pub fn learn(&self, request: &PaxosLearn) -> PaxosResult<()> {
        let mut learned = self.learned.lock();
        if let Some(existing) = learned.get(&request.seq) {
            if existing.value != request.value {
                warn!(
                    node = %self.node_id,
                    seq = request.seq,
                    kept = %existing.proposal,
                    dropped = %request.proposal,
                    "conflicting learn for a decided round, keeping the first value"
                );
            }
            return Ok(());
        }

        let record = AcceptedProposal::new(request.proposal, request.value.clone());
        self.log.write_round(request.seq, &record)?;
        learned.insert(request.seq, record);
        Ok(())
    }

    /// The decided value of one round, if learned.
    #[must_use]
    pub fn learned_value(&self, seq: SequenceNumber) -> Option<Bytes> {
        self.learned.lock().get(&seq).map(|r| r.value.clone())
    }

    /// The highest learned round and its value.
    #[must_use]
    pub fn greatest_learned(&self) -> Option<(SequenceNumber, Bytes)> {
        self.learned
            .lock()
            .last_key_value()
            .map(|(&seq, record)| (seq, record.value.clone()))
    }

    /// All learned rounds with sequence at least `from`, ascending.
    #[must_use]
    pub fn learned_values_since(&self, from: SequenceNumber) -> Vec<(SequenceNumber, Bytes)> {
        self.learned
            .lock()
            .range(from..)
            .map(|(&seq, record)| (seq, record.value.clone()))
            .collect()
    }
}
