//! A pointer-sized mutex that only pays for a blocking mutex, condvar, and
//! waiter bookkeeping once a second thread actually shows up.
//!
//! Uncontended, a [`Mutex<T>`] is exactly one `usize`: `0` unlocked, `1`
//! locked. The first time a thread has to block, the word is atomically
//! promoted to point at a heap-allocated control block holding a real
//! `std::sync::{Mutex, Condvar}`; that block is reclaimed once nothing
//! references it anymore, via a pegging protocol that stands in for hazard
//! pointers (see `raw.rs` and `DESIGN.md`).

mod block;
mod condvar;
mod error;
mod mutex;
mod peg;
mod raw;
mod tag;

pub use condvar::Condvar;
pub use error::Error;
pub use mutex::{
    LockError, Mutex, MutexGuard, TransferError, TryLockError, UnlockError, VetoError, WaitError,
};

