//! The auxiliary "fat mutex" control block.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicIsize, Ordering};

use crate::tag::Tag;

/// Fields that are only ever read or written while the control block's
/// `inner` mutex is held: they are never read without holding it.
pub(crate) struct Inner {
    pub(crate) held: bool,
    pub(crate) waiters: u32,
    pub(crate) transfer_gen: u64,
    pub(crate) transfers: u32,
}

/// Heap-allocated, shared by every thread currently contending on the
/// mutex word that points (directly or through a chain of pegs) at it.
#[repr(C)]
pub(crate) struct ControlBlock {
    pub(crate) tag: Tag,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) condvar: Condvar,
    /// Real references only: blocked/about-to-block waiters, secondary-chain
    /// pegs, and the lock-holder pseudo-reference. The primary chain's own
    /// reference is *not* counted here (an "-1 offset" convention),
    /// so `refcount == 0` while the primary chain is the sole remaining
    /// reference means the block is free to reclaim.
    pub(crate) refcount: AtomicIsize,
}

impl ControlBlock {
    /// Promotes a bare mutex word: `held` reflects whether the
    /// word was `1` (held, uncontended) at promotion time, and so does the
    /// initial pseudo-reference for the holder.
    pub(crate) fn new(held: bool) -> *mut ControlBlock {
        log::trace!("allocating control block (held={held})");
        #[cfg(test)]
        test_hooks::record_alloc();
        Box::into_raw(Box::new(ControlBlock {
            tag: Tag::Control,
            inner: Mutex::new(Inner {
                held,
                waiters: 0,
                transfer_gen: 0,
                transfers: 0,
            }),
            condvar: Condvar::new(),
            refcount: AtomicIsize::new(if held { 1 } else { 0 }),
        }))
    }

    /// # Safety
    /// `ptr` must point to a live `ControlBlock` for the duration of the
    /// returned reference. Reclamation is gated entirely by the pegging
    /// protocol's refcount discipline, not by Rust's borrow checker, so
    /// this reference is manufactured with `'static` lifetime and callers
    /// must not let it outlive the peg (or equivalent real reference) that
    /// justified dereferencing `ptr` in the first place.
    pub(crate) unsafe fn from_raw<'a>(ptr: *const ControlBlock) -> &'a ControlBlock {
        &*ptr
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds `by` real references to the block's refcount.
    pub(crate) fn incref(&self, by: isize) {
        self.refcount.fetch_add(by, Ordering::AcqRel);
    }

    /// Removes `by` real references, returning the value *after* the
    /// decrement (the "refcount decremented to zero" test).
    pub(crate) fn decref(&self, by: isize) -> isize {
        let remaining = self.refcount.fetch_sub(by, Ordering::AcqRel) - by;
        debug_assert!(remaining >= 0, "control block refcount underflow");
        remaining
    }

    /// Destroys the condvar/mutex and frees the allocation.
    ///
    /// # Safety
    /// `ptr` must be a live control block with refcount == 0, the inner
    /// mutex must already be genuinely unlocked (not just unguarded in this
    /// thread's stack), and the primary chain must already have been
    /// detached from it (mutex word CAS'd to `0`) so that no other thread
    /// can newly reference it.
    pub(crate) unsafe fn free(ptr: *mut ControlBlock) {
        log::trace!("freeing control block");
        #[cfg(test)]
        test_hooks::record_free();
        drop(Box::from_raw(ptr));
    }
}

/// Allocation bookkeeping used only by `mutex::test` to check the
/// zero-allocation-fast-path, promotion-once and no-leak properties. Not
/// part of the library's real logic.
#[cfg(test)]
pub(crate) mod test_hooks {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static LIVE: AtomicUsize = AtomicUsize::new(0);
    static TOTAL: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn record_alloc() {
        LIVE.fetch_add(1, Ordering::SeqCst);
        TOTAL.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_free() {
        LIVE.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn live() -> usize {
        LIVE.load(Ordering::SeqCst)
    }

    pub(crate) fn total_allocated() -> usize {
        TOTAL.load(Ordering::SeqCst)
    }

    pub(crate) fn reset() {
        LIVE.store(0, Ordering::SeqCst);
        TOTAL.store(0, Ordering::SeqCst);
    }
}
