//! Client traits over acceptors and learners.
//!
//! Proposers talk to peers through these traits, so the same protocol
//! code runs against in-process wiring in tests and a real transport
//! in a deployment. The in-memory clients carry a reachability switch
//! for simulating partitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use meridian_common::types::NodeId;

use crate::acceptor::PaxosAcceptor;
use crate::learner::PaxosLearner;
use crate::rpc::{PaxosAccept, PaxosAccepted, PaxosLearn, PaxosPrepare, PaxosPromise};
use crate::{PaxosError, PaxosResult, SequenceNumber};

/// Remote interface of an acceptor.
pub trait AcceptorClient: Send + Sync {
    /// The node the acceptor runs on.
    fn node_id(&self) -> NodeId;

    /// Sends a phase one request.
    ///
    /// # Errors
    ///
    /// `Unreachable` when the peer does not answer.
    fn prepare(&self, request: &PaxosPrepare) -> PaxosResult<PaxosPromise>;

    /// Sends a phase two request.
    ///
    /// # Errors
    ///
    /// `Unreachable` when the peer does not answer.
    fn accept(&self, request: &PaxosAccept) -> PaxosResult<PaxosAccepted>;

    /// Asks for the highest round the acceptor has participated in.
    ///
    /// # Errors
    ///
    /// `Unreachable` when the peer does not answer.
    fn latest_sequence(&self) -> PaxosResult<Option<SequenceNumber>>;
}

/// Remote interface of a learner.
pub trait LearnerClient: Send + Sync {
    /// The node the learner runs on.
    fn node_id(&self) -> NodeId;

    /// Delivers a decided value.
    ///
    /// # Errors
    ///
    /// `Unreachable` when the peer does not answer.
    fn learn(&self, request: &PaxosLearn) -> PaxosResult<()>;

    /// Asks for the peer's highest learned round.
    ///
    /// # Errors
    ///
    /// `Unreachable` when the peer does not answer.
    fn greatest_learned(&self) -> PaxosResult<Option<(SequenceNumber, Bytes)>>;

    /// Asks for the peer's learned value in one round.
    ///
    /// # Errors
    ///
    /// `Unreachable` when the peer does not answer.
    fn learned_value(&self, seq: SequenceNumber) -> PaxosResult<Option<Bytes>>;
}

/// An [`AcceptorClient`] calling an in-process acceptor directly.
///
/// Flipping [`set_reachable`] to false makes every call fail the way a
/// partitioned peer would.
///
/// [`set_reachable`]: InMemoryAcceptorClient::set_reachable
pub struct InMemoryAcceptorClient {
    acceptor: Arc<PaxosAcceptor>,
    reachable: AtomicBool,
}

impl InMemoryAcceptorClient {
    /// Wraps an acceptor.
    #[must_use]
    pub fn new(acceptor: Arc<PaxosAcceptor>) -> Self {
        Self {
            acceptor,
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates a partition to or healing of this peer.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    fn check_reachable(&self) -> PaxosResult<()> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PaxosError::Unreachable {
                node: self.acceptor.node_id(),
            })
        }
    }
}

impl AcceptorClient for InMemoryAcceptorClient {
    fn node_id(&self) -> NodeId {
        self.acceptor.node_id()
    }

    fn prepare(&self, request: &PaxosPrepare) -> PaxosResult<PaxosPromise> {
        self.check_reachable()?;
        self.acceptor.prepare(request)
    }

    fn accept(&self, request: &PaxosAccept) -> PaxosResult<PaxosAccepted> {
        self.check_reachable()?;
        self.acceptor.accept(request)
    }

    fn latest_sequence(&self) -> PaxosResult<Option<SequenceNumber>> {
        self.check_reachable()?;
        Ok(self.acceptor.latest_sequence())
    }
}

/// A [`LearnerClient`] calling an in-process learner directly.
pub struct InMemoryLearnerClient {
    learner: Arc<PaxosLearner>,
    reachable: AtomicBool,
}

impl InMemoryLearnerClient {
    /// Wraps a learner.
    #[must_use]
    pub fn new(learner: Arc<PaxosLearner>) -> Self {
        Self {
            learner,
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates a partition to or healing of this peer.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    fn check_reachable(&self) -> PaxosResult<()> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PaxosError::Unreachable {
                node: self.learner.node_id(),
            })
        }
    }
}

impl LearnerClient for InMemoryLearnerClient {
    fn node_id(&self) -> NodeId {
        self.learner.node_id()
    }

    fn learn(&self, request: &PaxosLearn) -> PaxosResult<()> {
        self.check_reachable()?;
        self.learner.learn(request)
    }

    fn greatest_learned(&self) -> PaxosResult<Option<(SequenceNumber, Bytes)>> {
        self.check_reachable()?;
        Ok(self.learner.greatest_learned())
    }

    fn learned_value(&self, seq: SequenceNumber) -> PaxosResult<Option<Bytes>> {
        self.check_reachable()?;
        Ok(self.learner.learned_value(seq))
    }
}
