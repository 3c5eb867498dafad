//! Leader election over the Paxos fleet.
//!
//! Each election is one decided round: candidates propose their own
//! node id at the next unused sequence number, and whatever id that
//! round decides is the leader. A losing candidate learns the winner
//! from the decided value and records it as a hint for redirects.
//!
//! Verification re-reads the fleet's learned rounds. A node only keeps
//! claiming leadership while a quorum of learners confirms no later
//! round elected someone else. Verification is advisory: the hard
//! safety guard is that timestamp bound updates themselves go through
//! consensus, so a deposed leader's allocations fail regardless.

use std::sync::Arc;

use bytes::Bytes;
use meridian_common::types::NodeId;
use meridian_common::{LeadershipState, Role};
use tracing::{debug, info, warn};

use crate::network::LearnerClient;
use crate::proposer::PaxosProposer;
use crate::{PaxosError, PaxosResult, SequenceNumber, FIRST_SEQUENCE};

/// Runs elections for one node and keeps its [`LeadershipState`] current.
pub struct LeaderElector {
    node_id: NodeId,
    proposer: Arc<PaxosProposer>,
    learner_clients: Vec<Arc<dyn LearnerClient>>,
    leadership: Arc<LeadershipState>,
}

impl LeaderElector {
    /// Creates an elector for `node_id`.
    ///
    /// `learner_clients` must cover the whole learner fleet, including
    /// this node's own learner, so round discovery sees local state.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        proposer: Arc<PaxosProposer>,
        learner_clients: Vec<Arc<dyn LearnerClient>>,
        leadership: Arc<LeadershipState>,
    ) -> Self {
        Self {
            node_id,
            proposer,
            learner_clients,
            leadership,
        }
    }

    /// The node this elector campaigns for.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Shared leadership state updated by elections and verification.
    #[must_use]
    pub fn leadership(&self) -> Arc<LeadershipState> {
        Arc::clone(&self.leadership)
    }

    /// Stands for election and returns the resulting role.
    ///
    /// Proposes this node's id at the round after the latest one any
    /// reachable learner has seen. The round may decide a competing
    /// candidate instead; the outcome is recorded either way.
    ///
    /// # Errors
    ///
    /// Fails when no quorum is reachable or the decided value does not
    /// parse as a node id.
    pub fn elect(&self) -> PaxosResult<Role> {
        let round = self.next_election_round();
        let decided = self
            .proposer
            .propose(round, Self::encode_node(self.node_id))?;
        let winner = Self::decode_node(&decided)?;

        if winner == self.node_id {
            info!(node = %self.node_id, round, "won leader election");
            self.leadership.become_leader(round);
            Ok(Role::Leader)
        } else {
            info!(node = %self.node_id, round, leader = %winner, "lost leader election");
            self.leadership.become_follower(round, Some(winner));
            Ok(Role::Follower)
        }
    }

    /// Re-checks this node's role against the fleet's learned rounds.
    ///
    /// Returns whether this node is still leader. A round newer than
    /// the one we won demotes us immediately.
    ///
    /// # Errors
    ///
    /// `QuorumNotReached` when too few learners answer to rule out a
    /// newer round; the role drops to unknown until a check succeeds.
    pub fn verify_leadership(&self) -> PaxosResult<bool> {
        let quorum = self.learner_clients.len() / 2 + 1;
        let mut responses = 0;
        let mut freshest: Option<(SequenceNumber, Bytes)> = None;

        for client in &self.learner_clients {
            match client.greatest_learned() {
                Ok(latest) => {
                    responses += 1;
                    if let Some((seq, value)) = latest {
                        if freshest.as_ref().map_or(true, |(best, _)| seq > *best) {
                            freshest = Some((seq, value));
                        }
                    }
                }
                Err(err) => {
                    debug!(peer = %client.node_id(), error = %err, "learner unreachable during verification");
                }
            }
        }

        if responses < quorum {
            warn!(
                node = %self.node_id,
                responses,
                quorum,
                "could not verify leadership, stepping to unknown"
            );
            self.leadership.mark_unknown();
            return Err(PaxosError::QuorumNotReached {
                received: responses,
                required: quorum,
            });
        }

        if let Some((round, value)) = freshest {
            if round > self.leadership.round() {
                let winner = Self::decode_node(&value)?;
                if winner == self.node_id {
                    self.leadership.become_leader(round);
                } else {
                    info!(node = %self.node_id, round, leader = %winner, "newer election round observed");
                    self.leadership.become_follower(round, Some(winner));
                }
            }
        }
        Ok(self.leadership.is_leader())
    }

    /// Voluntarily gives up any leadership claim.
    pub fn step_down(&self) {
        info!(node = %self.node_id, "stepping down");
        self.leadership.mark_unknown();
    }

    /// The sequence number the next election should use.
    fn next_election_round(&self) -> SequenceNumber {
        let mut latest = None;
        for client in &self.learner_clients {
            match client.greatest_learned() {
                Ok(Some((seq, _))) => {
                    latest = Some(latest.map_or(seq, |cur: SequenceNumber| cur.max(seq)));
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(peer = %client.node_id(), error = %err, "learner unreachable during round discovery");
                }
            }
        }
        latest.map_or(FIRST_SEQUENCE, |seq| seq + 1)
    }

    fn encode_node(node: NodeId) -> Bytes {
        Bytes::copy_from_slice(&node.as_u32().to_be_bytes())
    }

    fn decode_node(value: &Bytes) -> PaxosResult<NodeId> {
        let raw: [u8; 4] = value.as_ref().try_into().map_err(|_| {
            PaxosError::corruption(format!(
                "election value has {} bytes, expected 4",
                value.len()
            ))
        })?;
        Ok(NodeId::new(u32::from_be_bytes(raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::PaxosAcceptor;
    use crate::learner::PaxosLearner;
    use crate::network::{AcceptorClient, InMemoryAcceptorClient, InMemoryLearnerClient};
    use crate::storage::MemoryStateLog;
    use meridian_common::MeridianError;

    struct Fleet {
        acceptor_clients: Vec<Arc<InMemoryAcceptorClient>>,
        learner_clients: Vec<Arc<InMemoryLearnerClient>>,
    }

    fn fleet(size: u32) -> Fleet {
        let mut acceptor_clients = Vec::new();
        let mut learner_clients = Vec::new();
        for node in 1..=size {
            let acceptor = Arc::new(
                PaxosAcceptor::new(NodeId::new(node), Arc::new(MemoryStateLog::new())).unwrap(),
            );
            acceptor_clients.push(Arc::new(InMemoryAcceptorClient::new(acceptor)));
            let learner = Arc::new(
                PaxosLearner::new(NodeId::new(node), Arc::new(MemoryStateLog::new())).unwrap(),
            );
            learner_clients.push(Arc::new(InMemoryLearnerClient::new(learner)));
        }
        Fleet {
            acceptor_clients,
            learner_clients,
        }
    }

    fn elector(node: u32, fleet: &Fleet, max_retries: usize) -> LeaderElector {
        let node_id = NodeId::new(node);
        let proposer = PaxosProposer::new(
            node_id,
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
        .with_max_retries(max_retries);
        LeaderElector::new(
            node_id,
            Arc::new(proposer),
            fleet
                .learner_clients
                .iter()
                .map(|c| Arc::clone(c) as Arc<dyn LearnerClient>)
                .collect(),
            Arc::new(LeadershipState::new()),
        )
    }

    #[test]
    fn test_uncontested_election_wins() {
        let fleet = fleet(3);
        let elector = elector(1, &fleet, 3);

        assert_eq!(elector.elect().unwrap(), Role::Leader);
        assert!(elector.leadership().is_leader());
        assert_eq!(elector.leadership().round(), FIRST_SEQUENCE);
        assert!(elector.verify_leadership().unwrap());
    }

    #[test]
    fn test_leadership_changes_hands() {
        let fleet = fleet(3);
        let first = elector(1, &fleet, 3);
        let second = elector(2, &fleet, 3);

        assert_eq!(first.elect().unwrap(), Role::Leader);
        assert_eq!(second.elect().unwrap(), Role::Leader);
        assert_eq!(second.leadership().round(), 2);

        // The old leader discovers the newer round and demotes itself.
        assert!(!first.verify_leadership().unwrap());
        assert_eq!(first.leadership().current_role(), Role::Follower);
        assert_eq!(first.leadership().leader_hint(), Some(NodeId::new(2)));

        match first.leadership().require_leader() {
            Err(MeridianError::NotLeader { leader_hint }) => {
                assert_eq!(leader_hint, Some(NodeId::new(2)));
            }
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[test]
    fn test_election_without_quorum_fails() {
        let fleet = fleet(3);
        fleet.acceptor_clients[1].set_reachable(false);
        fleet.acceptor_clients[2].set_reachable(false);

        let elector = elector(1, &fleet, 2);
        let err = elector.elect().unwrap_err();
        assert!(matches!(err, PaxosError::QuorumNotReached { .. }));
        assert!(!elector.leadership().is_leader());
    }

    #[test]
    fn test_verification_without_quorum_steps_to_unknown() {
        let fleet = fleet(3);
        let elector = elector(1, &fleet, 3);
        assert_eq!(elector.elect().unwrap(), Role::Leader);

        fleet.learner_clients[1].set_reachable(false);
        fleet.learner_clients[2].set_reachable(false);

        assert!(elector.verify_leadership().is_err());
        assert_eq!(elector.leadership().current_role(), Role::Unknown);
        assert!(matches!(
            elector.leadership().require_leader(),
            Err(MeridianError::LeaderUnknown)
        ));
    }

    #[test]
    fn test_reelection_advances_the_round() {
        let fleet = fleet(3);
        let elector = elector(1, &fleet, 3);

        assert_eq!(elector.elect().unwrap(), Role::Leader);
        elector.step_down();
        assert_eq!(elector.leadership().current_role(), Role::Unknown);

        assert_eq!(elector.elect().unwrap(), Role::Leader);
        assert_eq!(elector.leadership().round(), 2);
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        let err = LeaderElector::decode_node(&Bytes::from_static(b"abc")).unwrap_err();
        assert!(matches!(err, PaxosError::Corruption { .. }));

        let encoded = LeaderElector::encode_node(NodeId::new(7));
        assert_eq!(LeaderElector::decode_node(&encoded).unwrap(), NodeId::new(7));
    }
}
