//! Execution state machine
//!
//! ```text
//!            request                 complete
//!   Idle ─────────────▶ Executing ─────────────▶ Idle
//!     │                     │
//!     └───── teardown ──────┴──────▶ Unloading (terminal)
//! ```
//!
//! Alongside the state the machine tracks whether an accepted run is still owed a
//! `complete`. Teardown can move the state to `Unloading` while that run keeps
//! dispatching, so waiters key off the pending run rather than the state.
//!
//! All transitions go through [`ExecutionStateMachine::transition`], the only place
//! either field is written.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Idle,
    Executing,
    Unloading,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ExecutionState,
    run_pending: bool,
}

#[derive(Debug)]
pub struct ExecutionStateMachine {
    status: Mutex<Status>,
    changed: Condvar,
}

impl Default for ExecutionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStateMachine {
    pub fn new() -> Self {
        ExecutionStateMachine {
            status: Mutex::new(Status {
                state: ExecutionState::Idle,
                run_pending: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.lock().state
    }

    pub fn is_unloading(&self) -> bool {
        self.state() == ExecutionState::Unloading
    }

    /// Whether an accepted run has not called [`complete`](Self::complete) yet.
    pub fn run_pending(&self) -> bool {
        self.lock().run_pending
    }

    /// `Idle -> Executing`, marking a run pending. Returns `false` (and changes
    /// nothing) while executing or unloading.
    pub fn try_begin(&self) -> bool {
        self.transition(|status| match status.state {
            ExecutionState::Idle => Some(Status {
                state: ExecutionState::Executing,
                run_pending: true,
            }),
            _ => None,
        })
    }

    /// Settle the pending run and go `Executing -> Idle`.
    ///
    /// Returns `true` only when the machine went back to `Idle`; a run finishing
    /// after teardown began is settled but leaves the state `Unloading`.
    pub fn complete(&self) -> bool {
        let mut resumed = false;
        self.transition(|status| {
            if !status.run_pending && status.state != ExecutionState::Executing {
                return None;
            }
            resumed = status.state == ExecutionState::Executing;
            Some(Status {
                state: if resumed { ExecutionState::Idle } else { status.state },
                run_pending: false,
            })
        });
        resumed
    }

    /// `Idle | Executing -> Unloading`. Returns `true` only for the call that
    /// entered `Unloading`.
    pub fn begin_teardown(&self) -> bool {
        self.transition(|status| match status.state {
            ExecutionState::Unloading => None,
            _ => Some(Status {
                state: ExecutionState::Unloading,
                ..status
            }),
        })
    }

    /// Block until no run is pending or `timeout` elapses. Returns `false` on timeout.
    pub fn wait_until_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.lock();
        while status.run_pending {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            status = self
                .changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn transition(&self, next: impl FnOnce(Status) -> Option<Status>) -> bool {
        let mut status = self.lock();
        match next(*status) {
            Some(new_status) => {
                *status = new_status;
                self.changed.notify_all();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
