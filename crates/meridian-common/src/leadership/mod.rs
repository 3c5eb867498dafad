//! Shared leadership state.
//!
//! Leadership is an explicit state machine, not a blocking proxy: every
//! oracle and lock entry point checks the current role and fails fast with
//! a typed error when this node is not the leader, so clients can redirect
//! instead of hanging through a leader transition. A supervising task (the
//! elector's loop) is the only writer of the state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{MeridianError, MeridianResult};
use crate::types::NodeId;

/// The role of a node with respect to the current election round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Won the highest known election round.
    Leader,
    /// Lost the highest known election round to another node.
    Follower,
    /// No election outcome observed yet (startup, or verification failed).
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "Leader"),
            Role::Follower => write!(f, "Follower"),
            Role::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RoleState {
    role: Role,
    leader_hint: Option<NodeId>,
}

/// Shared, concurrently readable leadership state.
///
/// Readers (timestamp service, lock service) call [`require_leader`] at
/// every entry point; the elector updates the state as rounds are won
/// and lost. The election round doubles as a leadership epoch.
///
/// [`require_leader`]: LeadershipState::require_leader
#[derive(Debug)]
pub struct LeadershipState {
    state: RwLock<RoleState>,
    round: AtomicU64,
}

impl LeadershipState {
    /// Creates a fresh state in the `Unknown` role.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RoleState {
                role: Role::Unknown,
                leader_hint: None,
            }),
            round: AtomicU64::new(0),
        }
    }

    /// Returns the current role.
    #[must_use]
    pub fn current_role(&self) -> Role {
        self.state.read().role
    }

    /// Returns true if this node currently believes it is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.current_role() == Role::Leader
    }

    /// Returns the last known leader, if any.
    #[must_use]
    pub fn leader_hint(&self) -> Option<NodeId> {
        self.state.read().leader_hint
    }

    /// Returns the election round the current role was derived from.
    #[must_use]
    pub fn round(&self) -> u64 {
        self.round.load(Ordering::Acquire)
    }

    /// Records that this node won the given election round.
    pub fn become_leader(&self, round: u64) {
        let mut state = self.state.write();
        state.role = Role::Leader;
        state.leader_hint = None;
        self.round.store(round, Ordering::Release);
    }

    /// Records that another node won the given election round.
    pub fn become_follower(&self, round: u64, leader: Option<NodeId>) {
        let mut state = self.state.write();
        state.role = Role::Follower;
        state.leader_hint = leader;
        self.round.store(round, Ordering::Release);
    }

    /// Drops back to `Unknown`, e.g. when verification fails.
    pub fn mark_unknown(&self) {
        self.state.write().role = Role::Unknown;
    }

    /// Fails fast unless this node is currently the leader.
    ///
    /// # Errors
    ///
    /// `NotLeader` with the last known leader as a hint, or
    /// `LeaderUnknown` when no election outcome has been observed.
    pub fn require_leader(&self) -> MeridianResult<()> {
        let state = self.state.read();
        match state.role {
            Role::Leader => Ok(()),
            Role::Follower => Err(MeridianError::not_leader(state.leader_hint)),
            Role::Unknown => Err(MeridianError::LeaderUnknown),
        }
    }
}

impl Default for LeadershipState {
    fn default() -> Self {
        Self::new()
    }
}
