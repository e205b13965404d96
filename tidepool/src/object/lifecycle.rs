//! Instance lifecycle state machine and eviction reasons.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Lifecycle of the in-memory instance behind one object id.
///
/// # State Transitions
///
/// ```text
/// Uninitialized → Active ⇄ Idle → Evicted
///       ↓
///       Evicted (activation never succeeded)
/// ```
///
/// # Invariants
///
/// - An instance only runs application code while `Active`
/// - `Evicted` is terminal; a later request for the same id starts a new
///   instance in `Uninitialized`
/// - In-memory state of an evicted instance is gone; only storage survives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Record exists, behavior not yet constructed.
    Uninitialized,

    /// A turn is running.
    Active,

    /// Resident in memory, no turn running.
    Idle,

    /// Removed from memory.
    Evicted,
}

impl InstanceStatus {
    /// Check if transition to `next` is valid.
    ///
    /// # Valid Transitions
    ///
    /// - Uninitialized → Active
    /// - Uninitialized → Evicted (shutdown or failed activation)
    /// - Active → Idle
    /// - Idle → Active
    /// - Idle → Evicted
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Uninitialized, Active)
                | (Uninitialized, Evicted)
                | (Active, Idle)
                | (Idle, Active)
                | (Idle, Evicted)
        )
    }

    /// Whether the instance still occupies a slot in the router.
    pub fn is_resident(&self) -> bool {
        !matches!(self, InstanceStatus::Evicted)
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Evicted)
    }
}

/// Why an instance left memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// No request arrived within the idle timeout.
    IdleTimeout,

    /// Explicit request through the router.
    Explicit,

    /// The runtime is shutting down.
    Shutdown,
}

/// Shared, observable status of one instance.
///
/// Written by the instance task, read by the router.
#[derive(Debug)]
pub(crate) struct StatusCell {
    state: Mutex<InstanceStatus>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(InstanceStatus::Uninitialized),
        }
    }

    pub(crate) fn get(&self) -> InstanceStatus {
        *self.state.lock()
    }

    /// Move to `next`. Same-state writes are ignored; invalid moves are
    /// logged and applied anyway so observers never see a stale status.
    pub(crate) fn transition(&self, next: InstanceStatus) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            tracing::warn!(from = ?*state, to = ?next, "unexpected instance status transition");
        }
        *state = next;
    }
}
