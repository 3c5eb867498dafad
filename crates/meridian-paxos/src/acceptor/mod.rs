//! The acceptor half of the protocol.
//!
//! An acceptor's obligations are entirely local: never promise below a
//! promise already given, never accept below a promise, and never
//! forget either across a restart. State is persisted through the
//! state log before any response leaves this node.

use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_common::types::NodeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rpc::{
    AcceptedProposal, PaxosAccept, PaxosAccepted, PaxosPrepare, PaxosPromise, ProposalId,
};
use crate::storage::PaxosStateLog;
use crate::{PaxosResult, SequenceNumber};

/// Durable per-round acceptor state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptorState {
    /// Highest proposal promised for this round.
    pub last_promised: Option<ProposalId>,
    /// Highest proposal accepted for this round, with its value.
    pub last_accepted: Option<AcceptedProposal>,
}

/// A Paxos acceptor over a durable state log.
pub struct PaxosAcceptor {
    node_id: NodeId,
    rounds: Mutex<BTreeMap<SequenceNumber, AcceptorState>>,
    log: Arc<dyn PaxosStateLog<AcceptorState>>,
}

impl PaxosAcceptor {
    /// Opens an acceptor, reloading all previously persisted rounds.
    ///
    /// # Errors
    ///
    /// Propagates state log read failures.
    pub fn new(node_id: NodeId, log: Arc<dyn PaxosStateLog<AcceptorState>>) -> PaxosResult<Self> {
        let rounds = log.read_rounds_since(0)?.into_iter().collect();
        Ok(Self {
            node_id,
            rounds: Mutex::new(rounds),
            log,
        })
    }

    /// The node this acceptor runs on.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Handles a phase one request.
    ///
    /// Grants when the proposal is at least the highest promise so far;
    /// a repeated prepare from the same proposer grants again with the
    /// same answer. The grant carries this round's previously accepted
    /// proposal so the proposer can adopt it.
    ///
    /// # Errors
    ///
    /// Propagates state log write failures. No promise is given out
    /// when persistence fails.
    pub fn prepare(&self, request: &PaxosPrepare) -> PaxosResult<PaxosPromise> {
        let mut rounds = self.rounds.lock();
        let state = rounds.entry(request.seq).or_default();

        if let Some(promised) = state.last_promised {
            if request.proposal < promised {
                debug!(
                    node = %self.node_id,
                    seq = request.seq,
                    proposal = %request.proposal,
                    promised = %promised,
                    "rejecting stale prepare"
                );
                return Ok(PaxosPromise::reject(request.seq, promised));
            }
        }

        state.last_promised = Some(request.proposal);
        self.log.write_round(request.seq, state)?;
        Ok(PaxosPromise::grant(
            request.seq,
            request.proposal,
            state.last_accepted.clone(),
        ))
    }

    /// Handles a phase two request.
    ///
    /// Accepts when the proposal is at least the highest promise so
    /// far, recording it as this round's accepted proposal.
    ///
    /// # Errors
    ///
    /// Propagates state log write failures. Nothing is accepted when
    /// persistence fails.
    pub fn accept(&self, request: &PaxosAccept) -> PaxosResult<PaxosAccepted> {
        let mut rounds = self.rounds.lock();
        let state = rounds.entry(request.seq).or_default();

        if let Some(promised) = state.last_promised {
            if request.proposal < promised {
                debug!(
                    node = %self.node_id,
                    seq = request.seq,
                    proposal = %request.proposal,
                    promised = %promised,
                    "rejecting stale accept"
                );
                return Ok(PaxosAccepted::reject(request.seq, promised));
            }
        }

        state.last_promised = Some(request.proposal);
        state.last_accepted = Some(AcceptedProposal::new(
            request.proposal,
            request.value.clone(),
        ));
        self.log.write_round(request.seq, state)?;
        Ok(PaxosAccepted::accept(request.seq, request.proposal))
    }

    /// The persisted state of one round, if any.
    #[must_use]
    pub fn round_state(&self, seq: SequenceNumber) -> Option<AcceptorState> {
        self.rounds.lock().get(&seq).cloned()
    }

    /// The highest round this acceptor has promised or accepted in.
    ///
    /// A quorum of these answers bounds the newest decided round: any
    /// decision passed through a majority of acceptors, and majorities
    /// intersect.
    #[must_use]
    pub fn latest_sequence(&self) -> Option<SequenceNumber> {
        self.rounds.lock().keys().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStateLog;
    use bytes::Bytes;

    fn acceptor() -> PaxosAcceptor {
        PaxosAcceptor::new(NodeId::new(1), Arc::new(MemoryStateLog::new())).unwrap()
    }

    fn id(number: u64, proposer: u32) -> ProposalId {
        ProposalId::new(number, NodeId::new(proposer))
    }

    #[test]
    fn test_first_prepare_granted() {
        let acceptor = acceptor();
        let promise = acceptor.prepare(&PaxosPrepare::new(1, id(1, 2))).unwrap();
        assert!(promise.promised);
        assert!(promise.last_accepted.is_none());
    }

    #[test]
    fn test_lower_prepare_rejected_with_competitor() {
        let acceptor = acceptor();
        acceptor.prepare(&PaxosPrepare::new(1, id(5, 2))).unwrap();

        let promise = acceptor.prepare(&PaxosPrepare::new(1, id(3, 3))).unwrap();
        assert!(!promise.promised);
        assert_eq!(promise.highest_promised, id(5, 2));
    }

    #[test]
    fn test_repeated_prepare_idempotent() {
        let acceptor = acceptor();
        let first = acceptor.prepare(&PaxosPrepare::new(1, id(5, 2))).unwrap();
        let second = acceptor.prepare(&PaxosPrepare::new(1, id(5, 2))).unwrap();
        assert!(first.promised && second.promised);
        assert_eq!(first, second);
    }

    #[test]
    fn test_accept_below_promise_rejected() {
        let acceptor = acceptor();
        acceptor.prepare(&PaxosPrepare::new(1, id(5, 2))).unwrap();

        let response = acceptor
            .accept(&PaxosAccept::new(1, id(3, 3), Bytes::from_static(b"v")))
            .unwrap();
        assert!(!response.accepted);
        assert_eq!(response.highest_promised, id(5, 2));
    }

    #[test]
    fn test_promise_carries_prior_accepted_value() {
        let acceptor = acceptor();
        acceptor.prepare(&PaxosPrepare::new(1, id(1, 2))).unwrap();
        acceptor
            .accept(&PaxosAccept::new(1, id(1, 2), Bytes::from_static(b"early")))
            .unwrap();

        let promise = acceptor.prepare(&PaxosPrepare::new(1, id(2, 3))).unwrap();
        assert!(promise.promised);
        let accepted = promise.last_accepted.unwrap();
        assert_eq!(accepted.proposal, id(1, 2));
        assert_eq!(accepted.value, Bytes::from_static(b"early"));
    }

    #[test]
    fn test_rounds_independent() {
        let acceptor = acceptor();
        acceptor.prepare(&PaxosPrepare::new(1, id(9, 2))).unwrap();

        // A low proposal in a different round is unaffected.
        let promise = acceptor.prepare(&PaxosPrepare::new(2, id(1, 3))).unwrap();
        assert!(promise.promised);
    }

    #[test]
    fn test_promises_survive_reload() {
        let log: Arc<MemoryStateLog<AcceptorState>> = Arc::new(MemoryStateLog::new());
        {
            let acceptor = PaxosAcceptor::new(NodeId::new(1), Arc::clone(&log) as _).unwrap();
            acceptor.prepare(&PaxosPrepare::new(1, id(5, 2))).unwrap();
            acceptor
                .accept(&PaxosAccept::new(1, id(5, 2), Bytes::from_static(b"v")))
                .unwrap();
        }

        let reloaded = PaxosAcceptor::new(NodeId::new(1), log).unwrap();
        let promise = reloaded.prepare(&PaxosPrepare::new(1, id(4, 3))).unwrap();
        assert!(!promise.promised);
        assert_eq!(promise.highest_promised, id(5, 2));

        let state = reloaded.round_state(1).unwrap();
        assert_eq!(state.last_accepted.unwrap().value, Bytes::from_static(b"v"));
    }

    #[test]
    fn test_latest_sequence_tracks_highest_round() {
        let acceptor = acceptor();
        assert_eq!(acceptor.latest_sequence(), None);

        acceptor.prepare(&PaxosPrepare::new(3, id(1, 2))).unwrap();
        acceptor.prepare(&PaxosPrepare::new(7, id(1, 2))).unwrap();
        assert_eq!(acceptor.latest_sequence(), Some(7));
    }
}
