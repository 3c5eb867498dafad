//! # meridian-paxos
//!
//! Single-decree Paxos consensus for Meridian.
//!
//! Each sequence number is an independent consensus instance deciding
//! one opaque value. Two fleets run in a deployment: one decides leader
//! election rounds, the other decides timestamp bound advances. The
//! crate is value-agnostic; callers encode what a round means.
//!
//! A proposal runs the classic two phases against every reachable
//! acceptor and succeeds once a majority answers, so a minority of
//! unreachable nodes never blocks progress. The value returned from a
//! proposal is the value the round actually decided, which may be an
//! earlier proposer's value rather than the caller's own.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Promise and accept bookkeeping per round
pub mod acceptor;

/// Leader election on top of proposals
pub mod election;

/// Learned value store
pub mod learner;

/// Client traits and in-process wiring
pub mod network;

/// Proposal driver
pub mod proposer;

/// Protocol message types
pub mod rpc;

/// Durable round state
pub mod storage;

use meridian_common::error::MeridianError;
use meridian_common::types::NodeId;
use thiserror::Error;

pub use acceptor::{AcceptorState, PaxosAcceptor};
pub use election::LeaderElector;
pub use learner::PaxosLearner;
pub use network::{
    AcceptorClient, InMemoryAcceptorClient, InMemoryLearnerClient, LearnerClient,
};
pub use proposer::PaxosProposer;
pub use rpc::{
    AcceptedProposal, PaxosAccept, PaxosAccepted, PaxosLearn, PaxosMessage, PaxosPrepare,
    PaxosPromise, ProposalId,
};
pub use storage::{FileStateLog, MemoryStateLog, PaxosStateLog};

/// Identifies one consensus instance. Each sequence decides one value.
pub type SequenceNumber = u64;

/// The first sequence number ever proposed. Zero is reserved to mean
/// "nothing learned yet".
pub const FIRST_SEQUENCE: SequenceNumber = 1;

/// Errors from consensus operations.
#[derive(Debug, Error)]
pub enum PaxosError {
    /// Durable state could not be read or written.
    #[error("paxos io error: {source}")]
    Io {
        /// Underlying io failure.
        #[from]
        source: std::io::Error,
    },

    /// A round could not be encoded or decoded.
    #[error("paxos serialization failed: {message}")]
    Serialization {
        /// What failed to round-trip.
        message: String,
    },

    /// Durable state is present but unreadable.
    #[error("paxos state corrupted: {message}")]
    Corruption {
        /// What was found.
        message: String,
    },

    /// A peer did not answer.
    #[error("paxos peer {node} unreachable")]
    Unreachable {
        /// The peer that did not answer.
        node: NodeId,
    },

    /// Fewer than a majority of acceptors answered a phase.
    #[error("paxos quorum not reached: {received} of {required} responses")]
    QuorumNotReached {
        /// Positive responses received.
        received: usize,
        /// Responses required for a majority.
        required: usize,
    },

    /// A majority answered but rejected the proposal, usually because a
    /// higher-numbered proposer is active.
    #[error("paxos proposal rejected for sequence {seq}")]
    ProposalRejected {
        /// The contended sequence.
        seq: SequenceNumber,
    },
}

impl PaxosError {
    /// True for failures a fresh proposal attempt can get past.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaxosError::Unreachable { .. }
                | PaxosError::QuorumNotReached { .. }
                | PaxosError::ProposalRejected { .. }
        )
    }

    /// Serialization failure from any display-able cause.
    pub fn serialization(message: impl Into<String>) -> Self {
        PaxosError::Serialization {
            message: message.into(),
        }
    }

    /// Corruption with detail about what was found.
    pub fn corruption(message: impl Into<String>) -> Self {
        PaxosError::Corruption {
            message: message.into(),
        }
    }
}

impl From<PaxosError> for MeridianError {
    fn from(err: PaxosError) -> Self {
        match err {
            PaxosError::QuorumNotReached { received, required } => {
                MeridianError::QuorumNotReached { received, required }
            }
            other => MeridianError::ConsensusFailed {
                reason: other.to_string(),
            },
        }
    }
}

/// Result alias for consensus operations.
pub type PaxosResult<T> = std::result::Result<T, PaxosError>;
