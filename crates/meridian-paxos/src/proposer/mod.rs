//! The proposal driver.
//!
//! A proposer runs both phases against every reachable acceptor and
//! counts a round as decided once a majority accepts. Unreachable
//! peers are skipped, not waited on, so a minority of down nodes never
//! blocks a decision.
//!
//! When a quorum's promises reveal a previously accepted value, the
//! proposer must adopt it: that value may already be decided, and
//! proposing anything else could decide a round twice. Callers
//! therefore get back the value the round actually decided, which is
//! not always the value they passed in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use meridian_common::types::NodeId;
use meridian_common::{DEFAULT_PROPOSAL_RETRIES, PROPOSAL_BACKOFF_MAX_MS, PROPOSAL_BACKOFF_MIN_MS};
use rand::Rng;
use tracing::debug;

use crate::network::{AcceptorClient, LearnerClient};
use crate::rpc::{PaxosAccept, PaxosLearn, PaxosPrepare, ProposalId};
use crate::{PaxosError, PaxosResult, SequenceNumber};

/// A Paxos proposer bound to a fleet of acceptors and learners.
pub struct PaxosProposer {
    node_id: NodeId,
    acceptors: Vec<Arc<dyn AcceptorClient>>,
    learners: Vec<Arc<dyn LearnerClient>>,
    /// Source of proposal numbers. Bumped past every competing number
    /// seen in a rejection so the next attempt can win.
    counter: AtomicU64,
    max_retries: usize,
}

impl PaxosProposer {
    /// Creates a proposer over the given fleet.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        acceptors: Vec<Arc<dyn AcceptorClient>>,
        learners: Vec<Arc<dyn LearnerClient>>,
    ) -> Self {
        Self {
            node_id,
            acceptors,
            learners,
            counter: AtomicU64::new(0),
            max_retries: DEFAULT_PROPOSAL_RETRIES as usize,
        }
    }

    /// Overrides the number of proposal attempts per [`propose`] call.
    ///
    /// [`propose`]: PaxosProposer::propose
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// The proposing node.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Responses required for a majority of the acceptor fleet.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.acceptors.len() / 2 + 1
    }

    /// Drives `seq` to a decision, preferring `value`.
    ///
    /// Returns the decided value, which is `value` unless an earlier
    /// proposal already reached this round first. Retries contention
    /// with a randomized backoff before giving up.
    ///
    /// # Errors
    ///
    /// `QuorumNotReached` or `ProposalRejected` once retries are
    /// exhausted.
    pub fn propose(&self, seq: SequenceNumber, value: Bytes) -> PaxosResult<Bytes> {
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.run_round(seq, &value) {
                Ok(decided) => return Ok(decided),
                Err(err) if err.is_retryable() => {
                    debug!(
                        node = %self.node_id,
                        seq,
                        attempt,
                        error = %err,
                        "proposal attempt failed, backing off"
                    );
                    last_err = Some(err);
                    if attempt < self.max_retries {
                        std::thread::sleep(Self::backoff());
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(PaxosError::ProposalRejected { seq }))
    }

    fn run_round(&self, seq: SequenceNumber, own_value: &Bytes) -> PaxosResult<Bytes> {
        let proposal = self.next_proposal();
        let quorum = self.quorum_size();

        // Phase one: collect promises.
        let prepare = PaxosPrepare::new(seq, proposal);
        let mut promises = Vec::new();
        for client in &self.acceptors {
            match client.prepare(&prepare) {
                Ok(promise) if promise.promised => promises.push(promise),
                Ok(promise) => self.observe_competitor(promise.highest_promised),
                Err(err) => {
                    debug!(peer = %client.node_id(), seq, error = %err, "no promise from peer");
                }
            }
        }
        if promises.len() < quorum {
            return Err(PaxosError::QuorumNotReached {
                received: promises.len(),
                required: quorum,
            });
        }

        // Adopt the highest value already accepted within the quorum.
        let value = promises
            .iter()
            .filter_map(|promise| promise.last_accepted.as_ref())
            .max_by_key(|accepted| accepted.proposal)
            .map_or_else(|| own_value.clone(), |accepted| accepted.value.clone());

        // Phase two: fix the value.
        let accept = PaxosAccept::new(seq, proposal, value.clone());
        let mut accepted = 0;
        for client in &self.acceptors {
            match client.accept(&accept) {
                Ok(response) if response.accepted => accepted += 1,
                Ok(response) => self.observe_competitor(response.highest_promised),
                Err(err) => {
                    debug!(peer = %client.node_id(), seq, error = %err, "no acceptance from peer");
                }
            }
        }
        if accepted < quorum {
            return Err(PaxosError::ProposalRejected { seq });
        }

        // Decided. Distribution to learners is best effort; a missed
        // learner catches up from its peers.
        let learn = PaxosLearn::new(seq, proposal, value.clone());
        for learner in &self.learners {
            if let Err(err) = learner.learn(&learn) {
                debug!(peer = %learner.node_id(), seq, error = %err, "learner missed a decided round");
            }
        }
        Ok(value)
    }

    fn next_proposal(&self) -> ProposalId {
        let number = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        ProposalId::new(number, self.node_id)
    }

    fn observe_competitor(&self, competitor: ProposalId) {
        self.counter.fetch_max(competitor.number, Ordering::SeqCst);
    }

    fn backoff() -> Duration {
        let millis = rand::thread_rng().gen_range(PROPOSAL_BACKOFF_MIN_MS..=PROPOSAL_BACKOFF_MAX_MS);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::PaxosAcceptor;
    use crate::learner::PaxosLearner;
    use crate::network::{InMemoryAcceptorClient, InMemoryLearnerClient};
    use crate::storage::MemoryStateLog;

    struct Fleet {
        acceptor_clients: Vec<Arc<InMemoryAcceptorClient>>,
        learners: Vec<Arc<PaxosLearner>>,
        learner_clients: Vec<Arc<InMemoryLearnerClient>>,
    }

    fn fleet(size: u32) -> Fleet {
        let mut acceptor_clients = Vec::new();
        let mut learners = Vec::new();
        let mut learner_clients = Vec::new();
        for node in 1..=size {
            let acceptor = Arc::new(
                PaxosAcceptor::new(NodeId::new(node), Arc::new(MemoryStateLog::new())).unwrap(),
            );
            acceptor_clients.push(Arc::new(InMemoryAcceptorClient::new(acceptor)));

            let learner = Arc::new(
                PaxosLearner::new(NodeId::new(node), Arc::new(MemoryStateLog::new())).unwrap(),
            );
            learner_clients.push(Arc::new(InMemoryLearnerClient::new(Arc::clone(&learner))));
            learners.push(learner);
        }
        Fleet {
            acceptor_clients,
            learners,
            learner_clients,
        }
    }

    fn proposer(node: u32, fleet: &Fleet) -> PaxosProposer {
        PaxosProposer::new(
            NodeId::new(node),
            fleet
                .acceptor_clients
                .iter()
                .map(|c| Arc::clone(c) as Arc<dyn AcceptorClient>)
                .collect(),
            fleet
                .learner_clients
                .iter()
                .map(|c| Arc::clone(c) as Arc<dyn LearnerClient>)
                .collect(),
        )
    }

    #[test]
    fn test_propose_decides_and_distributes() {
        let fleet = fleet(3);
        let proposer = proposer(1, &fleet);

        let decided = proposer.propose(1, Bytes::from_static(b"v")).unwrap();
        assert_eq!(decided, Bytes::from_static(b"v"));

        for learner in &fleet.learners {
            assert_eq!(learner.learned_value(1), Some(Bytes::from_static(b"v")));
        }
    }

    #[test]
    fn test_minority_unreachable_still_decides() {
        let fleet = fleet(3);
        fleet.acceptor_clients[0].set_reachable(false);
        fleet.learner_clients[0].set_reachable(false);

        let proposer = proposer(2, &fleet);
        let decided = proposer.propose(1, Bytes::from_static(b"v")).unwrap();
        assert_eq!(decided, Bytes::from_static(b"v"));

        // The partitioned learner missed the round; the others have it.
        assert_eq!(fleet.learners[0].learned_value(1), None);
        assert!(fleet.learners[1].learned_value(1).is_some());
    }

    #[test]
    fn test_majority_unreachable_fails_with_quorum_error() {
        let fleet = fleet(3);
        fleet.acceptor_clients[0].set_reachable(false);
        fleet.acceptor_clients[1].set_reachable(false);

        let proposer = proposer(1, &fleet).with_max_retries(2);
        let err = proposer.propose(1, Bytes::from_static(b"v")).unwrap_err();
        assert!(matches!(
            err,
            PaxosError::QuorumNotReached {
                received: 1,
                required: 2
            }
        ));
    }

    #[test]
    fn test_second_proposer_adopts_decided_value() {
        let fleet = fleet(5);

        let first = proposer(1, &fleet);
        let decided = first.propose(1, Bytes::from_static(b"first")).unwrap();
        assert_eq!(decided, Bytes::from_static(b"first"));

        let second = proposer(2, &fleet);
        let decided = second.propose(1, Bytes::from_static(b"second")).unwrap();
        assert_eq!(decided, Bytes::from_static(b"first"));
    }

    #[test]
    fn test_dueling_proposers_converge() {
        let fleet = fleet(5);
        let first = Arc::new(proposer(1, &fleet));
        let second = Arc::new(proposer(2, &fleet));

        let t1 = {
            let p = Arc::clone(&first);
            std::thread::spawn(move || p.propose(7, Bytes::from_static(b"one")))
        };
        let t2 = {
            let p = Arc::clone(&second);
            std::thread::spawn(move || p.propose(7, Bytes::from_static(b"two")))
        };

        let v1 = t1.join().unwrap().unwrap();
        let v2 = t2.join().unwrap().unwrap();

        assert_eq!(v1, v2);
        assert!(v1 == Bytes::from_static(b"one") || v1 == Bytes::from_static(b"two"));
        for learner in &fleet.learners {
            assert_eq!(learner.learned_value(7), Some(v1.clone()));
        }
    }

    #[test]
    fn test_distinct_sequences_decide_independently() {
        let fleet = fleet(3);
        let proposer = proposer(1, &fleet);

        proposer.propose(1, Bytes::from_static(b"a")).unwrap();
        proposer.propose(2, Bytes::from_static(b"b")).unwrap();

        assert_eq!(
            fleet.learners[0].learned_value(1),
            Some(Bytes::from_static(b"a"))
        );
        assert_eq!(
            fleet.learners[0].learned_value(2),
            Some(Bytes::from_static(b"b"))
        );
    }
}
