//! Paxos protocol message types.
//!
//! One consensus round exchanges up to three message pairs:
//! - `Prepare`/`Promise`: phase one, reserving a proposal number
//! - `Accept`/`Accepted`: phase two, fixing a value
//! - `Learn`: distribution of the decided value to learners
//!
//! # Message Flow
//!
//! ```text
//! Proposer ──Prepare(n)───────▶ Acceptor
//! Proposer ◀──Promise(n, prev)── Acceptor
//! Proposer ──Accept(n, value)──▶ Acceptor
//! Proposer ◀──Accepted(n)─────── Acceptor
//! Proposer ──Learn(n, value)───▶ Learner
//! ```

use std::fmt;

use bytes::Bytes;
use meridian_common::types::NodeId;
use serde::{Deserialize, Serialize};

use crate::SequenceNumber;

/// A globally ordered proposal identifier.
///
/// Ordering is by number first, proposer second, so two proposers can
/// never issue equal but distinct identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalId {
    /// Proposal number, chosen fresh for every attempt.
    pub number: u64,
    /// The proposing node, used as a tiebreak.
    pub proposer: NodeId,
}

impl ProposalId {
    /// Creates a proposal identifier.
    #[must_use]
    pub const fn new(number: u64, proposer: NodeId) -> Self {
        Self { number, proposer }
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.number, self.proposer)
    }
}

/// A proposal an acceptor has accepted, with its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedProposal {
    /// The accepting proposal.
    pub proposal: ProposalId,
    /// The accepted value.
    pub value: Bytes,
}

impl AcceptedProposal {
    /// Creates an accepted proposal record.
    #[must_use]
    pub fn new(proposal: ProposalId, value: Bytes) -> Self {
        Self { proposal, value }
    }
}

/// Phase one request: reserve `proposal` for `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosPrepare {
    /// The consensus instance.
    pub seq: SequenceNumber,
    /// The proposal asking to be promised.
    pub proposal: ProposalId,
}

impl PaxosPrepare {
    /// Creates a prepare request.
    #[must_use]
    pub const fn new(seq: SequenceNumber, proposal: ProposalId) -> Self {
        Self { seq, proposal }
    }
}

/// Phase one response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosPromise {
    /// The consensus instance.
    pub seq: SequenceNumber,
    /// Whether the promise was granted.
    pub promised: bool,
    /// The highest proposal this acceptor is bound to. On a grant this
    /// echoes the request; on a rejection it names the competitor.
    pub highest_promised: ProposalId,
    /// The acceptor's previously accepted proposal, if any. The
    /// proposer must adopt the highest such value across its quorum.
    pub last_accepted: Option<AcceptedProposal>,
}

impl PaxosPromise {
    /// Creates a granted promise.
    #[must_use]
    pub fn grant(
        seq: SequenceNumber,
        proposal: ProposalId,
        last_accepted: Option<AcceptedProposal>,
    ) -> Self {
        Self {
            seq,
            promised: true,
            highest_promised: proposal,
            last_accepted,
        }
    }

    /// Creates a rejection naming the competing promise.
    #[must_use]
    pub fn reject(seq: SequenceNumber, highest_promised: ProposalId) -> Self {
        Self {
            seq,
            promised: false,
            highest_promised,
            last_accepted: None,
        }
    }
}

/// Phase two request: fix `value` under `proposal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosAccept {
    /// The consensus instance.
    pub seq: SequenceNumber,
    /// The proposal previously promised.
    pub proposal: ProposalId,
    /// The value to fix.
    pub value: Bytes,
}

impl PaxosAccept {
    /// Creates an accept request.
    #[must_use]
    pub fn new(seq: SequenceNumber, proposal: ProposalId, value: Bytes) -> Self {
        Self {
            seq,
            proposal,
            value,
        }
    }
}

/// Phase two response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosAccepted {
    /// The consensus instance.
    pub seq: SequenceNumber,
    /// Whether the value was accepted.
    pub accepted: bool,
    /// The highest proposal this acceptor is bound to.
    pub highest_promised: ProposalId,
}

impl PaxosAccepted {
    /// Creates an acceptance.
    #[must_use]
    pub const fn accept(seq: SequenceNumber, proposal: ProposalId) -> Self {
        Self {
            seq,
            accepted: true,
            highest_promised: proposal,
        }
    }

    /// Creates a rejection naming the competing promise.
    #[must_use]
    pub const fn reject(seq: SequenceNumber, highest_promised: ProposalId) -> Self {
        Self {
            seq,
            accepted: false,
            highest_promised,
        }
    }
}

/// Distribution of a decided value to a learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosLearn {
    /// The consensus instance.
    pub seq: SequenceNumber,
    /// The deciding proposal.
    pub proposal: ProposalId,
    /// The decided value.
    pub value: Bytes,
}

impl PaxosLearn {
    /// Creates a learn message.
    #[must_use]
    pub fn new(seq: SequenceNumber, proposal: ProposalId, value: Bytes) -> Self {
        Self {
            seq,
            proposal,
            value,
        }
    }
}

/// All Paxos protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosMessage {
    /// Phase one request.
    Prepare(PaxosPrepare),
    /// Phase one response.
    Promise(PaxosPromise),
    /// Phase two request.
    Accept(PaxosAccept),
    /// Phase two response.
    Accepted(PaxosAccepted),
    /// Decided value distribution.
    Learn(PaxosLearn),
}

impl PaxosMessage {
    /// Returns the sequence the message belongs to.
    #[must_use]
    pub const fn seq(&self) -> SequenceNumber {
        match self {
            PaxosMessage::Prepare(m) => m.seq,
            PaxosMessage::Promise(m) => m.seq,
            PaxosMessage::Accept(m) => m.seq,
            PaxosMessage::Accepted(m) => m.seq,
            PaxosMessage::Learn(m) => m.seq,
        }
    }

    /// Returns a short name for the message type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            PaxosMessage::Prepare(_) => "Prepare",
            PaxosMessage::Promise(_) => "Promise",
            PaxosMessage::Accept(_) => "Accept",
            PaxosMessage::Accepted(_) => "Accepted",
            PaxosMessage::Learn(_) => "Learn",
        }
    }
}

impl fmt::Display for PaxosMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(seq={})", self.type_name(), self.seq())
    }
}
