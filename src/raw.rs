//! The untyped mutex word and the pegging protocol that promotes it to a
//! [`ControlBlock`] under contention.
//!
//! This module knows nothing about the payload `T` a [`crate::Mutex<T>`]
//! protects; [`crate::mutex`] is the thin typed wrapper on top.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::MutexGuard as StdMutexGuard;
use std::time::Instant;

use crate::block::{ControlBlock, Inner};
use crate::condvar::Condvar;
use crate::error::{compose, Error};
use crate::peg::Peg;
use crate::tag::{tag_of, Tag};

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;

fn is_ptr(word: usize) -> bool {
    word != UNLOCKED && word != LOCKED
}

/// The mutex word itself: `0` unheld, `1` held with no waiters ever having
/// shown up, anything else a `*const ControlBlock` reached through zero or
/// more [`Peg`]s.
pub(crate) struct RawMutex {
    word: AtomicUsize,
}

impl RawMutex {
    pub(crate) const fn new() -> RawMutex {
        RawMutex { word: AtomicUsize::new(UNLOCKED) }
    }

    pub(crate) fn lock(&self) -> Result<(), Error> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
        self.lock_slow()
    }

    fn lock_slow(&self) -> Result<(), Error> {
        loop {
            let current = self.word.load(Ordering::SeqCst);
            if current == UNLOCKED {
                if self
                    .word
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            let (control_ptr, guard) = get(&self.word);
            let control = unsafe { ControlBlock::from_raw(control_ptr) };
            control.incref(1);
            let guard = wait_until_free(control, guard);
            drop(guard);
            return Ok(());
        }
    }

    pub(crate) fn try_lock(&self) -> Result<(), Error> {
        loop {
            let current = self.word.load(Ordering::SeqCst);
            if current == UNLOCKED {
                if self
                    .word
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if current == LOCKED {
                return Err(Error::Busy);
            }
            match peg_and_acquire(&self.word, current) {
                None => continue,
                Some((control_ptr, mut guard)) => {
                    let control = unsafe { ControlBlock::from_raw(control_ptr) };
                    if guard.held {
                        release(&self.word, control_ptr, guard, 0);
                        return Err(Error::Busy);
                    }
                    guard.held = true;
                    control.incref(1);
                    drop(guard);
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn unlock(&self) -> Result<(), Error> {
        if self
            .word
            .compare_exchange(LOCKED, UNLOCKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
        self.unlock_slow()
    }

    fn unlock_slow(&self) -> Result<(), Error> {
        if self.word.load(Ordering::SeqCst) == UNLOCKED {
            return Err(Error::NotPermitted);
        }
        let (control_ptr, mut guard) = get(&self.word);
        let control = unsafe { ControlBlock::from_raw(control_ptr) };
        if !guard.held {
            release(&self.word, control_ptr, guard, 0);
            return Err(Error::NotPermitted);
        }
        guard.held = false;
        if guard.waiters > 0 {
            control.condvar.notify_one();
        }
        release(&self.word, control_ptr, guard, 1);
        Ok(())
    }

    /// `cond_wait`/`cond_timedwait`: hands the caller's held mutex off
    /// while blocking on `cond`, then re-acquires it identically to
    /// [`RawMutex::lock_slow`] before returning, even if the wait itself
    /// panics. Returns whether the deadline (if any) elapsed.
    pub(crate) fn cond_wait(&self, cond: &Condvar, deadline: Option<Instant>) -> Result<bool, Error> {
        let (control_ptr, mut guard) = get(&self.word);
        let control = unsafe { ControlBlock::from_raw(control_ptr) };
        if !guard.held {
            release(&self.word, control_ptr, guard, 0);
            return Err(Error::NotPermitted);
        }
        if guard.waiters > 0 {
            control.condvar.notify_one();
        }
        guard.held = false;

        // Arm the rendezvous before giving up anything, so a concurrent
        // notifier (which must also arm it) cannot run between us clearing
        // `held` and us actually parking.
        let gate = cond.arm();
        drop(guard);

        // No matter how we leave this function - normal return, or a panic
        // unwinding through `park`/`park_until` - the block must come back
        // re-acquired before our caller's guard can be considered valid
        // again. `scopeguard` runs this on every path, mirroring a
        // cancellation cleanup handler.
        let reacquire = scopeguard::guard((), move |()| {
            let control = unsafe { ControlBlock::from_raw(control_ptr) };
            let inner = control.lock_inner();
            let inner = wait_until_free(control, inner);
            drop(inner);
        });

        let timed_out = match deadline {
            None => {
                cond.park(gate);
                false
            }
            Some(deadline) => cond.park_until(gate, deadline),
        };

        drop(reacquire);
        Ok(timed_out)
    }

    /// Atomically hands the held state of `self` to `other`.
    pub(crate) fn transfer(&self, other: &RawMutex) -> Result<(), Error> {
        if other
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return match self.unlock() {
                Ok(()) => Ok(()),
                Err(e) => {
                    let undo = other.unlock();
                    compose(Err(e), undo)
                }
            };
        }

        let (b_ptr, mut b_guard) = get(&other.word);
        let b_control = unsafe { ControlBlock::from_raw(b_ptr) };
        b_control.incref(1);
        let snapshot_gen = b_guard.transfer_gen;

        // Drop B's inner lock before touching A, to avoid holding two inner
        // locks across a blocking call.
        drop(b_guard);

        if let Err(e) = self.unlock() {
            let guard = b_control.lock_inner();
            release(&other.word, b_ptr, guard, 1);
            return Err(e);
        }

        let mut b_guard = b_control.lock_inner();
        b_guard.transfers += 1;
        b_guard.waiters += 1;

        let outcome = loop {
            if !b_guard.held {
                debug_assert!(b_guard.transfers > 0 && b_guard.waiters > 0);
                b_guard.transfers -= 1;
                b_guard.waiters -= 1;
                b_guard.held = true;
                break Ok(());
            }
            if b_guard.transfer_gen != snapshot_gen {
                break Err(Error::Again);
            }
            b_guard = b_control
                .condvar
                .wait(b_guard)
                .unwrap_or_else(|e| e.into_inner());
        };

        match outcome {
            Ok(()) => {
                drop(b_guard);
                Ok(())
            }
            Err(e) => {
                debug_assert!(b_guard.transfers > 0 && b_guard.waiters > 0);
                b_guard.transfers -= 1;
                b_guard.waiters -= 1;
                release(&other.word, b_ptr, b_guard, 1);
                let relock_a = self.lock();
                compose(Err(e), relock_a)
            }
        }
    }

    /// Vetoes any `transfer` currently in flight toward `self`.
    pub(crate) fn veto_transfer(&self) -> Result<(), Error> {
        let current = self.word.load(Ordering::SeqCst);
        if current == LOCKED {
            return Ok(());
        }
        if current == UNLOCKED {
            return Err(Error::NotPermitted);
        }
        let (control_ptr, mut guard) = get(&self.word);
        let control = unsafe { ControlBlock::from_raw(control_ptr) };
        if !guard.held {
            release(&self.word, control_ptr, guard, 0);
            return Err(Error::NotPermitted);
        }
        guard.transfer_gen += 1;
        if guard.transfers > 0 {
            control.condvar.notify_all();
        }
        release(&self.word, control_ptr, guard, 0);
        Ok(())
    }

    /// Tears down the word. `Drop` is the only caller;
    /// it cannot surface an error, so misuse (destroying a held mutex) is a
    /// debug-mode panic and a logged, best-effort leak in release mode
    /// (see `DESIGN.md`).
    fn destroy(&mut self) {
        let current = *self.word.get_mut();
        if current == UNLOCKED {
            return;
        }
        if cfg!(debug_assertions) {
            panic!("skinny-mutex: dropped while busy (word = {current:#x})");
        }
        log::error!("skinny-mutex: dropped while busy (word = {current:#x}); leaking to avoid a use-after-free");
    }
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Waits (if necessary) until `guard.held` is false, then claims it, mirroring
/// both `lock_slow`'s acquire step and `cond_wait`'s reacquire step - the two
/// are identical by design.
fn wait_until_free<'a>(
    control: &'a ControlBlock,
    mut guard: StdMutexGuard<'a, Inner>,
) -> StdMutexGuard<'a, Inner> {
    if guard.held {
        guard.waiters += 1;
        while guard.held {
            guard = control
                .condvar
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
        debug_assert!(guard.waiters > 0, "waiters must track exactly the threads parked here");
        guard.waiters -= 1;
    }
    guard.held = true;
    guard
}

/// Unified dispatcher: promotes a bare word, or pegs and walks to an
/// existing control block, retrying internally until one succeeds.
fn get(word: &AtomicUsize) -> (*mut ControlBlock, StdMutexGuard<'static, Inner>) {
    loop {
        let current = word.load(Ordering::SeqCst);
        let attempt = if is_ptr(current) {
            peg_and_acquire(word, current)
        } else {
            promote(word, current)
        };
        if let Some(pair) = attempt {
            return pair;
        }
    }
}

/// Releases a block access that claimed `refs` standing references (0 for a
/// transient lookup that never became the holder or a waiter, 1 when
/// releasing the holder pseudo-reference). Always unlocks the inner mutex;
/// frees the block if the refcount and the primary chain both agree nothing
/// references it anymore.
fn release(
    word: &AtomicUsize,
    control_ptr: *mut ControlBlock,
    guard: StdMutexGuard<'static, Inner>,
    refs: isize,
) {
    let control = unsafe { ControlBlock::from_raw(control_ptr) };
    if refs == 0 {
        drop(guard);
        return;
    }
    let remaining = control.decref(refs);
    drop(guard);
    if remaining == 0
        && word
            .compare_exchange(
                control_ptr as usize,
                UNLOCKED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    {
        // A block is only ever freed here: the refcount reached zero *and*
        // this thread is the one that won the CAS detaching the primary
        // chain, so no other thread can newly reach `control_ptr`.
        debug_assert_eq!(remaining, 0);
        unsafe { ControlBlock::free(control_ptr) };
    }
}

/// Promotes a bare word (`0` or `1`) to a control block. Returns `None`
/// if another thread changed the word first, signalling the
/// caller to retry from scratch.
fn promote(
    word: &AtomicUsize,
    current: usize,
) -> Option<(*mut ControlBlock, StdMutexGuard<'static, Inner>)> {
    let held = current == LOCKED;
    let control_ptr = ControlBlock::new(held);
    let control = unsafe { ControlBlock::from_raw(control_ptr) };
    let guard = control.lock_inner();
    match word.compare_exchange(
        current,
        control_ptr as usize,
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(_) => Some((control_ptr, guard)),
        Err(_) => {
            drop(guard);
            unsafe { ControlBlock::free(control_ptr) };
            None
        }
    }
}

/// Pegs and walks to an existing control block. Returns `None` if the
/// word stopped being a pointer before the peg could be installed,
/// signalling the caller to retry from scratch.
fn peg_and_acquire(
    word: &AtomicUsize,
    current: usize,
) -> Option<(*mut ControlBlock, StdMutexGuard<'static, Inner>)> {
    // Phase A: install our peg in front of the current head.
    let peg_ptr = Peg::new(current);
    let mut observed = current;
    loop {
        match word.compare_exchange_weak(
            observed,
            peg_ptr as usize,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(now) => {
                if !is_ptr(now) {
                    unsafe { Peg::free(peg_ptr) };
                    return None;
                }
                observed = now;
                unsafe { (*peg_ptr).next.store(observed, Ordering::Release) };
            }
        }
    }

    // Phase B: walk forward from our own peg to the control block.
    let mut node = peg_ptr as usize;
    let control_ptr = loop {
        let next = unsafe { (*(node as *const Peg)).next.load(Ordering::Acquire) };
        match unsafe { tag_of(next as *const ()) } {
            Tag::Control => break next as *mut ControlBlock,
            Tag::Peg => node = next,
        }
    };
    // Every chain, primary or secondary, terminates in a live control block -
    // never in another peg forever, never in a dangling pointer.
    debug_assert!(unsafe { tag_of(control_ptr as *const ()) } == Tag::Control);
    let control = unsafe { ControlBlock::from_raw(control_ptr) };
    let guard = control.lock_inner();

    // Phase C: retire our peg's place at the head of the primary chain.
    let prev_head = word.swap(control_ptr as usize, Ordering::SeqCst);
    control.incref(1);
    if prev_head == peg_ptr as usize {
        retire_chain(control, peg_ptr as usize, 2);
    } else {
        if prev_head == control_ptr as usize {
            control.decref(1);
        } else {
            retire_chain(control, prev_head, 1);
        }
        // Phase D: retire our own peg regardless of where the detached-chain
        // walk above stopped - we still hold `peg_ptr` locally even if no
        // other walk ever reaches it.
        retire_chain(control, peg_ptr as usize, 1);
    }

    Some((control_ptr, guard))
}

/// Walks a detached chain starting at `node`, decrementing `first_amount`
/// off the first node and 1 off every subsequent one, freeing and advancing
/// while each decrement reaches zero, stopping (leaving a surviving
/// secondary chain) the first time it doesn't. Used both to retire the
/// chain a peg's own CAS detached and, separately, to retire that peg's
/// own local reference - both are this same walk.
fn retire_chain(control: &ControlBlock, node: usize, first_amount: u8) {
    let mut node = node;
    let mut amount = first_amount;
    loop {
        match unsafe { tag_of(node as *const ()) } {
            Tag::Control => {
                control.decref(1);
                break;
            }
            Tag::Peg => {
                let peg_ptr = node as *mut Peg;
                let zero = unsafe { Peg::decrement(peg_ptr, amount) };
                if !zero {
                    break;
                }
                let next = unsafe { (*peg_ptr).next.load(Ordering::Acquire) };
                unsafe { Peg::free(peg_ptr) };
                node = next;
                amount = 1;
            }
        }
    }
}
