//! Crate-wide error taxonomy.
//!
//! Mirrors the error taxonomy described for this core: invalid
//! configuration, resource exhaustion, identity conflict, and usage
//! errors are all surfaced as ordinary return values rather than
//! exceptions; nothing in this crate panics on a recoverable condition.

use std::fmt;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all recoverable failure cases produced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid job system configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("fibers are not supported on this platform")]
    FibersUnsupported,

    #[error("failed to create worker thread")]
    ThreadCreateFailed,

    #[error("job pool exhausted")]
    JobPoolExhausted,

    #[error("fiber pool exhausted")]
    FiberPoolExhausted,

    #[error("job counter would overflow")]
    CounterOverflow,

    #[error("resource type already registered with a manager")]
    TypeAlreadyRegistered,

    #[error("resource entry (type, id) already allocated")]
    DuplicateEntry,

    #[error("resource name already reserved")]
    DuplicateName,
}

/// A usage error: a precondition the caller violated (e.g. double-join,
/// waiting outside of a job, deleting a running fiber).
///
/// These are distinct from [`Error`] because they're logged and
/// ignored where feasible, or logged and aborted where continuing
/// would corrupt scheduler/registry state, rather than treated as
/// ordinary fallible operations. [`UsageError::log`] implements the
/// "logged and ignored" half; callers that must not continue call
/// [`UsageError::abort`] instead.
#[derive(Debug, Clone, Copy)]
pub struct UsageError(pub &'static str);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "usage error: {}", self.0)
    }
}

impl UsageError {
    /// Logs the violation at `error` level and returns, leaving state
    /// otherwise unchanged. Used for violations that are recoverable by
    /// simply ignoring the call (double-join, double-detach).
    pub fn log(self) {
        log::error!("{self}");
    }

    /// Logs the violation and aborts the process. Used for violations
    /// that would otherwise corrupt the scheduler or registry's
    /// internal state (e.g. deleting a running fiber).
    pub fn abort(self) -> ! {
        log::error!("{self}");
        std::process::abort();
    }
}
