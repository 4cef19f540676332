//! Single-slot injection acknowledgement latch.
//!
//! A scheduler thread arms the tracker with [`AckTracker::start`] right before
//! it sends `N <addr>`. The controller's RX loop feeds every received line to
//! [`AckTracker::on_rx`]. The injection counts as acknowledged once the echo,
//! `SC 10` and `SC 00` have been seen in that order. The scheduler blocks in
//! [`AckTracker::wait`] for a bounded time.
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::semio::protocol::{classify, Reply, SC_ACCEPTED, SC_IDLE};

/// Public view of the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Idle,
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    AwaitEcho,
    AwaitAccepted,
    AwaitComplete,
    Resolved,
}

impl Slot {
    fn public(self) -> AckState {
        match self {
            Slot::Idle => AckState::Idle,
            Slot::Resolved => AckState::Resolved,
            _ => AckState::Pending,
        }
    }
}

#[derive(Debug)]
pub struct AckTracker {
    slot: Mutex<Slot>,
    resolved: Condvar,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
            resolved: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> AckState {
        self.lock().public()
    }

    /// Arm the latch for the next injection, discarding any earlier result.
    pub fn start(&self) {
        *self.lock() = Slot::AwaitEcho;
    }

    /// Feed one RX line. Returns `true` only for the call that moved the
    /// latch from pending to resolved.
    pub fn on_rx(&self, line: &str) -> bool {
        let mut slot = self.lock();
        let next = match (*slot, classify(line)) {
            (Slot::AwaitEcho, Reply::InjectEcho { .. }) => Slot::AwaitAccepted,
            (Slot::AwaitAccepted, Reply::StatusCode(SC_ACCEPTED)) => Slot::AwaitComplete,
            (Slot::AwaitComplete, Reply::StatusCode(SC_IDLE)) => Slot::Resolved,
            (current, _) => current,
        };
        if next == *slot {
            return false;
        }
        *slot = next;
        if next == Slot::Resolved {
            self.resolved.notify_all();
            return true;
        }
        false
    }

    /// Block until resolved or `timeout` passes. A timeout leaves the latch
    /// pending; a late resolution is absorbed and cleared by the next `start`.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        while *slot != Slot::Resolved {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .resolved
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            slot = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = "I> N C00A098000";

    #[test]
    fn resolves_once_on_echo_then_10_then_00() {
        let ack = AckTracker::new();
        ack.start();
        assert_eq!(ack.state(), AckState::Pending);
        assert!(!ack.on_rx(ECHO));
        assert!(!ack.on_rx("SC 10"));
        assert!(ack.on_rx("SC 00"));
        assert!(!ack.on_rx("SC 00"));
        assert_eq!(ack.state(), AckState::Resolved);
    }

    #[test]
    fn bare_00_without_start_does_nothing() {
        let ack = AckTracker::new();
        assert!(!ack.on_rx("SC 00"));
        assert_eq!(ack.state(), AckState::Idle);
        assert!(!ack.wait(Duration::from_millis(5)));
    }

    #[test]
    fn status_poll_00_while_pending_is_not_an_ack() {
        let ack = AckTracker::new();
        ack.start();
        assert!(!ack.on_rx("SC 00"));
        assert!(!ack.on_rx(ECHO));
        assert!(!ack.on_rx("SC 00"));
        assert!(!ack.on_rx("FC 00"));
        assert_eq!(ack.state(), AckState::Pending);
    }

    #[test]
    fn timed_out_wait_keeps_pending_and_start_clears_late_result() {
        let ack = AckTracker::new();
        ack.start();
        assert!(!ack.wait(Duration::from_millis(10)));
        assert_eq!(ack.state(), AckState::Pending);
        ack.on_rx(ECHO);
        ack.on_rx("SC 10");
        assert!(ack.on_rx("SC 00"));
        ack.start();
        assert_eq!(ack.state(), AckState::Pending);
    }
}
