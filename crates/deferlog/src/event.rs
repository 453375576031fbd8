use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

// =============================================================================
// SYNCHRONIZATION PROTOCOL
// =============================================================================
//
// The event is a one-bit latch with stronger memory semantics than a plain
// flag:
//
// - `signal()` stores the bit with Release, so everything the signaler wrote
//   before signaling is visible to a waiter that observes the bit.
// - `wait()` consumes the bit with an Acquire exchange, pairing with the
//   Release store.
//
// The condvar notify happens while the mutex is held. A waiter that found
// the bit clear re-checks it *inside* the lock before sleeping, so the
// store-then-notify of a concurrent signal cannot slip between the waiter's
// check and its sleep (the classic lost-wakeup race).
//
// Multiple signals before a wait collapse into one: the bit is binary.
//
// =============================================================================

/// Binary signal/wait primitive between one signaler and one waiter.
///
/// Stronger than a plain flag: a signal published with release semantics
/// is consumed with acquire semantics, so data written before `signal` is
/// visible after `wait`. Multiple signals before a wait collapse to one.
/// Extra signalers are harmless (the bit just stays set), which the log
/// core relies on: producers, `close` and `panic_flush` all nudge the
/// worker through the same event.
#[derive(Debug, Default)]
pub struct SpscEvent {
    signaled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SpscEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event and wakes at most one waiter.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_one();
    }

    /// Consumes the event, blocking until it is set.
    pub fn wait(&self) {
        if self.signaled.swap(false, Ordering::Acquire) {
            return;
        }
        let mut guard = self.lock.lock().unwrap();
        loop {
            if self.signaled.swap(false, Ordering::Acquire) {
                return;
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Consumes the event, blocking for at most `timeout`.
    ///
    /// Returns `true` if the event was consumed, `false` on timeout. The
    /// deadline is measured on the monotonic clock, so spurious condvar
    /// wakeups only shorten the individual sleeps, never the total wait.
    /// A zero timeout degenerates to a single poll.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.signaled.swap(false, Ordering::Acquire) {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap();
        loop {
            if self.signaled.swap(false, Ordering::Acquire) {
                return true;
            }
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return self.signaled.swap(false, Ordering::Acquire);
            };
            let (g, _timed_out) = self.cond.wait_timeout(guard, remaining).unwrap();
            guard = g;
        }
    }
}
