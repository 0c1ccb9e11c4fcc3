//! One generation in flight per session.
//!
//! The watchdog timestamp is bumped on every received fragment. A holder
//! whose watchdog is older than the timeout is treated as stuck and its
//! lock can be taken over.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone)]
pub struct GuardState {
    is_generating: bool,
    watchdog: Option<Instant>,
    epoch: u64,
}

impl GuardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_generating(&self) -> bool {
        self.is_generating
    }

    pub fn watchdog(&self) -> Option<Instant> {
        self.watchdog
    }

    /// Bumped on every successful acquisition.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Take the lock if idle, or if the current holder's watchdog is older
    /// than `timeout`.
    pub fn try_acquire(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.is_generating {
            let idle_for = self
                .watchdog
                .map(|ts| now.saturating_duration_since(ts))
                .unwrap_or(Duration::MAX);
            if idle_for <= timeout {
                return false;
            }
            tracing::warn!(?idle_for, ?timeout, "previous generation looks stuck, taking over");
        }
        self.is_generating = true;
        self.watchdog = Some(now);
        self.epoch = self.epoch.wrapping_add(1);
        true
    }

    pub fn refresh(&mut self, now: Instant) {
        if self.is_generating {
            self.watchdog = Some(now);
        }
    }

    pub fn release(&mut self) {
        self.is_generating = false;
        self.watchdog = None;
    }
}

/// Shared guard handing out RAII permits.
#[derive(Debug)]
pub struct GenerationGuard {
    state: Mutex<GuardState>,
    watchdog_timeout: Duration,
}

impl GenerationGuard {
    pub fn new(watchdog_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(GuardState::new()),
            watchdog_timeout,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.state.lock().is_generating()
    }

    pub fn snapshot(&self) -> GuardState {
        self.state.lock().clone()
    }

    /// `None` while another generation holds the guard.
    pub fn acquire(&self, now: Instant) -> Option<GenerationPermit<'_>> {
        let mut state = self.state.lock();
        if !state.try_acquire(now, self.watchdog_timeout) {
            return None;
        }
        Some(GenerationPermit {
            guard: self,
            epoch: state.epoch(),
        })
    }
}

/// Held for the duration of one generation; releases the guard on drop.
#[derive(Debug)]
pub struct GenerationPermit<'a> {
    guard: &'a GenerationGuard,
    epoch: u64,
}

impl GenerationPermit<'_> {
    pub fn refresh(&self, now: Instant) {
        let mut state = self.guard.state.lock();
        if state.epoch() == self.epoch {
            state.refresh(now);
        }
    }

    /// False once a stale-lock takeover has handed the guard to someone else.
    pub fn is_current(&self) -> bool {
        self.guard.state.lock().epoch() == self.epoch
    }
}

impl Drop for GenerationPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.guard.state.lock();
        if state.epoch() == self.epoch {
            state.release();
        } else {
            tracing::debug!("superseded generation permit dropped");
        }
    }
}
