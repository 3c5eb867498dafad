//! Durable round state for acceptors and learners.
//!
//! Paxos is only safe when a node remembers its promises across
//! restarts, so both acceptor state and learned values go through a
//! [`PaxosStateLog`] before any response leaves the node. The log is
//! generic over the round payload: acceptors store promise and accept
//! state, learners store decided values.
//!
//! Two implementations are provided:
//! - [`MemoryStateLog`]: volatile, for tests and embedded clusters
//! - [`FileStateLog`]: one file per round, written atomically via a
//!   temp file and rename

mod file;
mod memory;

pub use file::FileStateLog;
pub use memory::MemoryStateLog;

use crate::{PaxosResult, SequenceNumber};

/// Durable storage of per-round state.
///
/// Writes must be durable before returning; a crash after
/// [`write_round`] returns must never lose the round.
///
/// [`write_round`]: PaxosStateLog::write_round
pub trait PaxosStateLog<T>: Send + Sync {
    /// Durably records the state of one round, replacing any previous
    /// state for the same sequence.
    fn write_round(&self, seq: SequenceNumber, state: &T) -> PaxosResult<()>;

    /// Reads the state of one round.
    fn read_round(&self, seq: SequenceNumber) -> PaxosResult<Option<T>>;

    /// Returns the greatest sequence with recorded state.
    fn greatest_round(&self) -> PaxosResult<Option<SequenceNumber>>;

    /// Returns all rounds with sequence at least `from`, ascending.
    fn read_rounds_since(&self, from: SequenceNumber) -> PaxosResult<Vec<(SequenceNumber, T)>>;
}
