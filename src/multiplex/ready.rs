//! One-shot readiness signal.
//!
//! Waiters block on a condition variable until the flag is resolved; the
//! flag never reverts.

use std::sync::{Condvar, Mutex};

use super::errors::{MultiplexError, MultiplexResult};

#[derive(Debug, Default)]
pub struct ReadySignal {
    resolved: Mutex<bool>,
    cond: Condvar,
}

impl ReadySignal {
    /// Unresolved signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the signal and wake every waiter.
    ///
    /// Returns `false` if it was already resolved.
    pub fn resolve(&self) -> MultiplexResult<bool> {
        let mut resolved = self.resolved.lock().map_err(|_| MultiplexError::poisoned())?;
        if *resolved {
            return Ok(false);
        }
        *resolved = true;
        self.cond.notify_all();
        Ok(true)
    }

    /// Non-blocking check
    pub fn is_resolved(&self) -> bool {
        self.resolved.lock().map(|r| *r).unwrap_or(false)
    }

    /// Block until resolved
    pub fn wait(&self) -> MultiplexResult<()> {
        let mut resolved = self.resolved.lock().map_err(|_| MultiplexError::poisoned())?;
        while !*resolved {
            resolved = self
                .cond
                .wait(resolved)
                .map_err(|_| MultiplexError::poisoned())?;
        }
        Ok(())
    }
}
