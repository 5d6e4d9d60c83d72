//! Cooperative pause/cancel gate shared by a producer and its controllers.
//!
//! The producer calls [`PauseGate::checkpoint`] at chunk boundaries;
//! controllers call `pause`, `resume` and `cancel` from any thread. The gate's
//! mutex is the only lock a transfer uses.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    cancelled: bool,
}

/// What the producer should do after a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Not paused; keep going
    Proceed,
    /// Was paused and has been resumed; keep going
    Resumed,
    /// Stop without finalizing
    Cancelled,
}

#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<GateState>,
    wake: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    // Two independent flags: always consistent, even after a poisoning panic.
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a pause. Returns false if already paused or cancelled.
    pub fn pause(&self) -> bool {
        let mut state = self.lock();
        if state.paused || state.cancelled {
            return false;
        }
        state.paused = true;
        true
    }

    /// Clear a pause and wake a blocked producer. Returns false if not paused.
    pub fn resume(&self) -> bool {
        let mut state = self.lock();
        if !state.paused {
            return false;
        }
        state.paused = false;
        self.wake.notify_all();
        true
    }

    /// Request cancellation, waking a paused producer. Returns false if
    /// already cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.cancelled {
            return false;
        }
        state.cancelled = true;
        state.paused = false;
        self.wake.notify_all();
        true
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Block while paused; see [`PauseGate::checkpoint_with`].
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint_with(|| {})
    }

    /// Consult the gate at a safe boundary.
    ///
    /// `on_suspend` runs without the lock held, right before the caller
    /// blocks, and only if it is about to block.
    pub fn checkpoint_with(&self, on_suspend: impl FnOnce()) -> Checkpoint {
        {
            let state = self.lock();
            if state.cancelled {
                return Checkpoint::Cancelled;
            }
            if !state.paused {
                return Checkpoint::Proceed;
            }
        }

        on_suspend();

        let mut state = self.lock();
        while state.paused && !state.cancelled {
            state = self
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if state.cancelled {
            Checkpoint::Cancelled
        } else {
            Checkpoint::Resumed
        }
    }
}
