//! Per-actor admission control.
//!
//! [`ConcurrencyGate`] allows at most one in-flight generation per actor
//! and, optionally, a global cap on concurrent generations. Admission is
//! reject-on-conflict: callers never wait for a slot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::ActorId;

/// In-memory admission gate.
///
/// Construct one per process and share it behind an `Arc`. The actor set
/// and the counter live under a single mutex so readers never observe one
/// updated without the other.
#[derive(Debug)]
pub struct ConcurrencyGate {
    state: Mutex<GateState>,
    /// Global cap on concurrent slots. `0` means unbounded.
    max_global: usize,
}

#[derive(Debug, Default)]
struct GateState {
    active_actors: HashSet<ActorId>,
    active_count: usize,
}

impl ConcurrencyGate {
    /// Create a gate. `max_global == 0` disables the global cap.
    pub fn new(max_global: usize) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            max_global,
        }
    }

    /// Try to take a slot for `actor_id`.
    ///
    /// Returns `false` if the actor already holds a slot or the global cap
    /// is reached.
    pub fn try_acquire(&self, actor_id: ActorId) -> bool {
        let mut state = self.lock();

        if state.active_actors.contains(&actor_id) {
            return false;
        }
        if self.max_global > 0 && state.active_count >= self.max_global {
            return false;
        }

        state.active_actors.insert(actor_id);
        state.active_count += 1;
        true
    }

    /// Release the actor's slot. Releasing an actor that holds no slot is a
    /// no-op.
    pub fn release(&self, actor_id: ActorId) {
        let mut state = self.lock();
        if state.active_actors.remove(&actor_id) {
            state.active_count -= 1;
        }
    }

    /// Number of slots currently held.
    pub fn active_count(&self) -> usize {
        self.lock().active_count
    }

    pub fn is_actor_active(&self, actor_id: ActorId) -> bool {
        self.lock().active_actors.contains(&actor_id)
    }

    pub fn max_global(&self) -> usize {
        self.max_global
    }

    /// Take a slot and return a guard that releases it on drop.
    pub fn acquire_slot(self: &Arc<Self>, actor_id: ActorId) -> Option<GateSlot> {
        if self.try_acquire(actor_id) {
            Some(GateSlot {
                gate: Arc::clone(self),
                actor_id,
            })
        } else {
            None
        }
    }

    // The critical sections never panic, so a poisoned lock still holds
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held admission slot. Dropping it releases the slot, so every exit
/// path of a request (including early `?` returns and task cancellation)
/// gives the slot back.
#[derive(Debug)]
pub struct GateSlot {
    gate: Arc<ConcurrencyGate>,
    actor_id: ActorId,
}

impl GateSlot {
    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }
}

impl Drop for GateSlot {
    fn drop(&mut self) {
        self.gate.release(self.actor_id);
        tracing::trace!(actor_id = self.actor_id, "Released generation slot");
    }
}
