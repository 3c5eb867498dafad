//! Consensus-backed bound store.
//!
//! The bound lives in a dedicated Paxos sequence series: round `n+1`
//! holds the limit stored after round `n`. Reading asks an acceptor
//! quorum for the highest round they have touched, then closes any
//! round that never finished; writing proposes the new limit at the
//! next round. Because every write is a decided Paxos value, a second
//! oracle instance cannot move the bound without this one noticing the
//! adopted foreign value and failing fast.

use std::sync::Arc;

use bytes::Bytes;
use meridian_common::types::{NodeId, Timestamp};
use meridian_common::{MeridianError, MeridianResult};
use meridian_paxos::{
    AcceptorClient, LearnerClient, PaxosProposer, SequenceNumber, FIRST_SEQUENCE,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::TimestampBoundStore;

/// The last round this instance agreed on, and the bound it carried.
#[derive(Debug, Clone, Copy)]
struct Agreed {
    seq: Option<SequenceNumber>,
    bound: Timestamp,
}

/// Timestamp bound store over a dedicated Paxos fleet.
pub struct PaxosTimestampBoundStore {
    node_id: NodeId,
    proposer: Arc<PaxosProposer>,
    acceptor_clients: Vec<Arc<dyn AcceptorClient>>,
    learner_clients: Vec<Arc<dyn LearnerClient>>,
    agreed: Mutex<Option<Agreed>>,
}

impl PaxosTimestampBoundStore {
    /// Creates a store over the given fleet.
    ///
    /// The proposer must target the same acceptors and learners; the
    /// fleet is dedicated to timestamp bounds and shared with nothing
    /// else.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        proposer: Arc<PaxosProposer>,
        acceptor_clients: Vec<Arc<dyn AcceptorClient>>,
        learner_clients: Vec<Arc<dyn LearnerClient>>,
    ) -> Self {
        Self {
            node_id,
            proposer,
            acceptor_clients,
            learner_clients,
            agreed: Mutex::new(None),
        }
    }

    /// The highest round any acceptor in a quorum has participated in.
    ///
    /// Every decided round passed through a majority of acceptors, so
    /// a majority of answers cannot miss one.
    fn latest_round(&self) -> MeridianResult<Option<SequenceNumber>> {
        let quorum = self.acceptor_clients.len() / 2 + 1;
        let mut responses = 0;
        let mut latest = None;
        for client in &self.acceptor_clients {
            match client.latest_sequence() {
                Ok(seq) => {
                    responses += 1;
                    latest = latest.max(seq);
                }
                Err(err) => {
                    debug!(peer = %client.node_id(), error = %err, "acceptor unreachable during bound read");
                }
            }
        }
        if responses < quorum {
            return Err(MeridianError::QuorumNotReached {
                received: responses,
                required: quorum,
            });
        }
        Ok(latest)
    }

    fn learned_anywhere(&self, seq: SequenceNumber) -> Option<Bytes> {
        for client in &self.learner_clients {
            match client.learned_value(seq) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(err) => {
                    debug!(peer = %client.node_id(), seq, error = %err, "learner unreachable during bound read");
                }
            }
        }
        None
    }

    /// Resolves the bound as of round `seq`, deciding unfinished rounds
    /// along the way.
    ///
    /// A round a crashed writer only prepared carries the previous
    /// bound forward; a round with an accepted value is decided as that
    /// value through proposal adoption. Either way the fleet's learners
    /// end up with every round filled in.
    fn resolve_bound_at(&self, seq: SequenceNumber) -> MeridianResult<Timestamp> {
        let mut bound = Timestamp::ZERO;
        let mut next = FIRST_SEQUENCE;
        let mut cursor = seq;
        loop {
            if let Some(value) = self.learned_anywhere(cursor) {
                bound = Self::decode_bound(&value)?;
                next = cursor + 1;
                break;
            }
            if cursor <= FIRST_SEQUENCE {
                break;
            }
            cursor -= 1;
        }
        while next <= seq {
            let decided = self.proposer.propose(next, Self::encode_bound(bound))?;
            bound = Self::decode_bound(&decided)?;
            next += 1;
        }
        Ok(bound)
    }

    fn read_agreed_state(&self) -> MeridianResult<Agreed> {
        match self.latest_round()? {
            None => Ok(Agreed {
                seq: None,
                bound: Timestamp::ZERO,
            }),
            Some(seq) => Ok(Agreed {
                seq: Some(seq),
                bound: self.resolve_bound_at(seq)?,
            }),
        }
    }

    fn encode_bound(bound: Timestamp) -> Bytes {
        Bytes::copy_from_slice(&bound.to_be_bytes())
    }

    fn decode_bound(value: &Bytes) -> MeridianResult<Timestamp> {
        let raw: [u8; 8] = value.as_ref().try_into().map_err(|_| {
            MeridianError::corruption(format!(
                "timestamp bound has {} bytes, expected 8",
                value.len()
            ))
        })?;
        Ok(Timestamp::from_be_bytes(raw))
    }
}

impl TimestampBoundStore for PaxosTimestampBoundStore {
    fn get_upper_limit(&self) -> MeridianResult<Timestamp> {
        let mut agreed = self.agreed.lock();
        let state = self.read_agreed_state()?;
        *agreed = Some(state);
        Ok(state.bound)
    }

    fn store_upper_limit(&self, limit: Timestamp) -> MeridianResult<()> {
        let mut agreed = self.agreed.lock();
        let current = match *agreed {
            Some(state) => state,
            None => {
                let state = self.read_agreed_state()?;
                *agreed = Some(state);
                state
            }
        };
        if limit < current.bound {
            return Err(MeridianError::internal(format!(
                "timestamp bound regression: {} is below the stored limit {}",
                limit, current.bound
            )));
        }

        let seq = current.seq.map_or(FIRST_SEQUENCE, |s| s + 1);
        let decided = self.proposer.propose(seq, Self::encode_bound(limit))?;
        let decided_bound = Self::decode_bound(&decided)?;
        *agreed = Some(Agreed {
            seq: Some(seq),
            bound: decided_bound,
        });
        if decided_bound != limit {
            warn!(
                node = %self.node_id,
                seq,
                proposed = %limit,
                decided = %decided_bound,
                "another timestamp service moved the bound"
            );
            return Err(MeridianError::not_leader(None));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_paxos::storage::MemoryStateLog;
    use meridian_paxos::{
        InMemoryAcceptorClient, InMemoryLearnerClient, PaxosAcceptor, PaxosLearner, PaxosPrepare,
        ProposalId,
    };

    struct Fleet {
        acceptors: Vec<Arc<PaxosAcceptor>>,
        acceptor_clients: Vec<Arc<InMemoryAcceptorClient>>,
        learner_clients: Vec<Arc<InMemoryLearnerClient>>,
    }

    fn fleet(size: u32) -> Fleet {
        let mut acceptors = Vec::new();
        let mut acceptor_clients = Vec::new();
        let mut learner_clients = Vec::new();
        for node in 1..=size {
            let acceptor = Arc::new(
                PaxosAcceptor::new(NodeId::new(node), Arc::new(MemoryStateLog::new())).unwrap(),
            );
            acceptor_clients.push(Arc::new(InMemoryAcceptorClient::new(Arc::clone(&acceptor))));
            acceptors.push(acceptor);
            let learner = Arc::new(
                PaxosLearner::new(NodeId::new(node), Arc::new(MemoryStateLog::new())).unwrap(),
            );
            learner_clients.push(Arc::new(InMemoryLearnerClient::new(learner)));
        }
        Fleet {
            acceptors,
            acceptor_clients,
            learner_clients,
        }
    }

    fn store(node: u32, fleet: &Fleet) -> PaxosTimestampBoundStore {
        let node_id = NodeId::new(node);
        let acceptor_clients: Vec<Arc<dyn AcceptorClient>> = fleet
            .acceptor_clients
            .iter()
            .map(|c| Arc::clone(c) as _)
            .collect();
        let learner_clients: Vec<Arc<dyn LearnerClient>> = fleet
            .learner_clients
            .iter()
            .map(|c| Arc::clone(c) as _)
            .collect();
        let proposer = Arc::new(PaxosProposer::new(
            node_id,
            acceptor_clients.clone(),
            learner_clients.clone(),
        ));
        PaxosTimestampBoundStore::new(node_id, proposer, acceptor_clients, learner_clients)
    }

    #[test]
    fn test_fresh_fleet_starts_at_zero() {
        let fleet = fleet(3);
        let store = store(1, &fleet);

        assert_eq!(store.get_upper_limit().unwrap(), Timestamp::ZERO);
        store.store_upper_limit(Timestamp::new(1_000_000)).unwrap();
        assert_eq!(store.get_upper_limit().unwrap(), Timestamp::new(1_000_000));
    }

    #[test]
    fn test_bound_survives_a_new_instance() {
        let fleet = fleet(3);
        let first = store(1, &fleet);
        first.store_upper_limit(Timestamp::new(1_000_000)).unwrap();
        first.store_upper_limit(Timestamp::new(2_000_000)).unwrap();

        let second = store(2, &fleet);
        assert_eq!(second.get_upper_limit().unwrap(), Timestamp::new(2_000_000));
    }

    #[test]
    fn test_concurrent_instance_is_detected() {
        let fleet = fleet(3);
        let first = store(1, &fleet);
        first.store_upper_limit(Timestamp::new(1_000_000)).unwrap();

        let second = store(2, &fleet);
        assert_eq!(second.get_upper_limit().unwrap(), Timestamp::new(1_000_000));
        second.store_upper_limit(Timestamp::new(2_000_000)).unwrap();

        // The first instance still thinks round 1 is the latest; its
        // proposal at round 2 adopts the other instance's bound.
        let err = first
            .store_upper_limit(Timestamp::new(3_000_000))
            .unwrap_err();
        assert!(matches!(err, MeridianError::NotLeader { .. }));

        // After observing the foreign bound it can move on cleanly.
        first.store_upper_limit(Timestamp::new(3_000_000)).unwrap();
        assert_eq!(second.get_upper_limit().unwrap(), Timestamp::new(3_000_000));
    }

    #[test]
    fn test_regression_rejected() {
        let fleet = fleet(3);
        let store = store(1, &fleet);
        store.store_upper_limit(Timestamp::new(1_000_000)).unwrap();

        let err = store.store_upper_limit(Timestamp::new(999)).unwrap_err();
        assert!(matches!(err, MeridianError::Internal { .. }));
    }

    #[test]
    fn test_read_closes_an_unfinished_round() {
        let fleet = fleet(3);
        let first = store(1, &fleet);
        first.store_upper_limit(Timestamp::new(1_000_000)).unwrap();

        // A writer that crashed after phase one leaves round 2 prepared
        // but valueless on every acceptor.
        let orphan = PaxosPrepare::new(2, ProposalId::new(9, NodeId::new(9)));
        for acceptor in &fleet.acceptors {
            acceptor.prepare(&orphan).unwrap();
        }

        let second = store(2, &fleet);
        assert_eq!(second.get_upper_limit().unwrap(), Timestamp::new(1_000_000));
        second.store_upper_limit(Timestamp::new(2_000_000)).unwrap();
        assert_eq!(second.get_upper_limit().unwrap(), Timestamp::new(2_000_000));
    }
}
