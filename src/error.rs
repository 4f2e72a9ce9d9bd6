//! The error taxonomy and the recovery-composition helper used wherever a
//! cleanup step can itself fail while an outer error is already being
//! propagated.

use std::fmt;

/// Every failure mode this crate can report, collapsed into one enum.
/// Per-operation result types (`LockError`, `TryLockError`, ...) are plain
/// aliases that only ever construct the subset of variants that operation
/// can actually return; see `mutex.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Allocation of a peg or control block failed.
    ///
    /// Rust's global allocator aborts the process on allocation failure
    /// rather than returning an error (`Box::new` has no fallible form on
    /// stable Rust), so this variant can never actually be observed in
    /// practice under the default allocator. It is kept in the taxonomy
    /// for parity with the ported interface and so a custom allocator that
    /// *does* report failure (via `#[global_allocator]` + a panic hook
    /// converted to this error at the FFI boundary) has somewhere to land.
    ResourceExhausted,
    /// `unlock`/`veto_transfer`/`cond_wait` issued against a mutex not
    /// currently held by the caller, or issued against an unheld mutex.
    NotPermitted,
    /// `try_lock` found the mutex held; `destroy` found the word still
    /// referenced.
    Busy,
    /// A `transfer` was aborted by a concurrent `veto_transfer`.
    Again,
    /// `cond_timedwait` passed its deadline before being signalled.
    TimedOut,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::ResourceExhausted => "resource exhausted",
            Error::NotPermitted => "operation not permitted",
            Error::Busy => "resource busy",
            Error::Again => "try again",
            Error::TimedOut => "timed out",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

/// Reduces a primary result and a cleanup result to one:
///
/// - success | success -> success
/// - success | err      -> err
/// - err     | success  -> err (the original error)
/// - err     | err       -> unrecoverable: the process is corrupted
///   (the block may now be leaked or double-freed), so this aborts rather
///   than silently discarding either error.
///
/// `primary` is the result of the operation the caller actually wanted;
/// `cleanup` is the result of a cleanup/release step run while unwinding
/// from `primary`'s failure (or just as part of normal teardown).
pub(crate) fn compose(primary: Result<(), Error>, cleanup: Result<(), Error>) -> Result<(), Error> {
    match (primary, cleanup) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(primary), Err(cleanup)) => {
            eprintln!(
                "skinny-mutex: unrecoverable double fault: primary error {primary}, \
                 cleanup error {cleanup}; aborting to avoid leaking or double-freeing \
                 a control block"
            );
            std::process::abort();
        }
    }
}
