//! Error types.
//!
//! Only [`Error::Allocation`] is ever handed back to a caller as an `Err`. The
//! remaining variants describe contract violations or corrupted stack state;
//! they exist so that the fatal diagnostics raised by the crate have one
//! consistent wording. Usage errors panic. [`Error::CapacityExceeded`] aborts.

use std::io;

use thiserror::Error;

/// Result type for fallible coroutine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised by coroutine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A stack could not be obtained from the allocator.
    ///
    /// No coroutine was constructed and there is nothing to clean up.
    #[error("failed to allocate a {size} byte coroutine stack")]
    Allocation {
        /// Requested stack size in bytes.
        size: usize,
        /// Underlying OS or allocator error.
        #[source]
        source: io::Error,
    },

    /// The bootstrap frame does not fit in the coroutine stack.
    #[error("bootstrap frame of {frame} bytes exceeds stack capacity of {capacity} bytes")]
    CapacityExceeded {
        /// Length of the relocated frame in bytes.
        frame: usize,
        /// Usable capacity of the stack in bytes.
        capacity: usize,
    },

    /// An ambient yield was issued while no coroutine was running on the
    /// calling thread.
    #[error("yield called while no coroutine is running on this thread")]
    NoActiveCoroutine,

    /// An ambient yield was issued with a value whose type is not the output
    /// type of the running coroutine.
    #[error("yield of `{found}` in a coroutine that yields `{expected}`")]
    TypeMismatch {
        /// Output type the running coroutine was made with.
        expected: &'static str,
        /// Type of the value passed to yield.
        found: &'static str,
    },

    /// An operation was called in a lifecycle state that does not permit it.
    #[error("{0}")]
    Misuse(&'static str),
}

impl Error {
    /// Raises this error as a fatal diagnostic.
    #[cold]
    #[track_caller]
    pub(crate) fn fatal(self) -> ! {
        log::error!("{}", self);
        panic!("{}", self);
    }

    /// Reports this error and aborts the process. Used where unwinding out of
    /// the failed operation cannot be allowed.
    #[cold]
    pub(crate) fn abort(self) -> ! {
        log::error!("{}, aborting", self);
        std::process::abort();
    }
}
