//! A condition variable that can be paired with [`crate::Mutex`] instead of
//! `std::sync::Mutex`.
//!
//! `std::sync::Condvar` is wired structurally to `std::sync::MutexGuard`, so
//! it cannot be used with our own [`crate::MutexGuard`]. This type gives the
//! same API surface (`new`, `wait`, `wait_timeout`, `notify_one`,
//! `notify_all`) against an internal, independent waiting mechanism, so it
//! can be bound to [`crate::Mutex::cond_wait`] instead.

use std::sync::{Condvar as StdCondvar, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Instant;

/// A condition variable usable with [`crate::Mutex`].
///
/// Internally this is just a `std::sync::{Mutex<()>, Condvar}` pair used as
/// a park/unpark rendezvous; the association with a particular
/// `skinny_mutex::Mutex` is made only by the caller passing the same
/// `Condvar` and mutex to every `cond_wait` call, exactly as with POSIX
/// `pthread_cond_wait`.
#[derive(Debug, Default)]
pub struct Condvar {
    gate: StdMutex<()>,
    inner: StdCondvar,
}

impl Condvar {
    /// Creates a new condition variable.
    pub fn new() -> Condvar {
        Condvar {
            gate: StdMutex::new(()),
            inner: StdCondvar::new(),
        }
    }

    /// Locks the internal rendezvous gate. Callers must hold this guard
    /// across releasing the mutex they are waiting on, so that a concurrent
    /// `notify_one`/`notify_all` (which also locks the gate) cannot run
    /// between "we gave up the mutex" and "we started waiting" and get
    /// lost.
    pub(crate) fn arm(&self) -> StdMutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until notified. Consumes the gate guard returned by
    /// [`Condvar::arm`].
    pub(crate) fn park(&self, gate: StdMutexGuard<'_, ()>) {
        let _ = self.inner.wait(gate).unwrap_or_else(|e| e.into_inner());
    }

    /// Blocks until notified or `deadline` passes. Returns `true` if the
    /// deadline elapsed without a notification.
    pub(crate) fn park_until(&self, mut gate: StdMutexGuard<'_, ()>, deadline: Instant) -> bool {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let timeout = deadline - now;
            let (next_gate, result) = self
                .inner
                .wait_timeout(gate, timeout)
                .unwrap_or_else(|e| e.into_inner());
            if !result.timed_out() {
                return false;
            }
            gate = next_gate;
            if Instant::now() >= deadline {
                return true;
            }
        }
    }

    /// Wakes one waiting thread, if any.
    pub fn notify_one(&self) {
        let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.notify_one();
    }

    /// Wakes all waiting threads.
    pub fn notify_all(&self) {
        let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.notify_all();
    }
}
