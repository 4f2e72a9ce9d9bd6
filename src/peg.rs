//! Peg nodes: the ephemeral chain elements that stand in for hazard
//! pointers: installing a peg pins the control block it points past
//! against reclamation for as long as the peg lives.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::tag::Tag;

/// A freshly allocated chain node that pins a [`crate::block::ControlBlock`]
/// against reclamation while one thread is in the middle of accessing it.
///
/// `next` stores the same word-encoding as the mutex word: either another
/// peg's address or a control block's address (pegs are never chained to
/// `0`/`1`, only installed in front of an existing pointer).
#[repr(C)]
pub(crate) struct Peg {
    pub(crate) tag: Tag,
    /// Never exceeds 2: one reference for the installing thread, one for
    /// whichever chain (primary or secondary) currently has this peg as
    /// its head or an interior node.
    pub(crate) refcount: AtomicU8,
    pub(crate) next: AtomicUsize,
}

impl Peg {
    /// Allocates a peg with an initial refcount of 2:
    /// one reference belongs to the installing thread, one to the chain
    /// position it is about to occupy.
    pub(crate) fn new(next: usize) -> *mut Peg {
        #[cfg(test)]
        test_hooks::record_alloc();
        Box::into_raw(Box::new(Peg {
            tag: Tag::Peg,
            refcount: AtomicU8::new(2),
            next: AtomicUsize::new(next),
        }))
    }

    /// Atomically decrements this peg's refcount by `by` and reports whether
    /// the decrement drove it to zero (an atomic sub-and-fetch with a result
    /// test, so only the thread that observes zero ever frees the peg).
    ///
    /// # Safety
    /// `ptr` must point to a live `Peg` that has not yet been freed.
    pub(crate) unsafe fn decrement(ptr: *mut Peg, by: u8) -> bool {
        let prev = (*ptr).refcount.fetch_sub(by, Ordering::AcqRel);
        debug_assert!(prev >= by, "peg refcount underflow");
        prev == by
    }

    /// Frees a peg whose refcount has reached zero.
    ///
    /// # Safety
    /// `ptr` must be a still-live, uniquely-owned (refcount == 0, so no
    /// other thread holds a reference) peg previously allocated by
    /// [`Peg::new`].
    pub(crate) unsafe fn free(ptr: *mut Peg) {
        #[cfg(test)]
        test_hooks::record_free();
        drop(Box::from_raw(ptr));
    }
}

/// Live-peg bookkeeping for `mutex::test`, mirroring `block::test_hooks`.
#[cfg(test)]
pub(crate) mod test_hooks {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static LIVE: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn record_alloc() {
        LIVE.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_free() {
        LIVE.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn live() -> usize {
        LIVE.load(Ordering::SeqCst)
    }

    pub(crate) fn reset() {
        LIVE.store(0, Ordering::SeqCst);
    }
}
