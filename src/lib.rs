//! Stackful coroutines for Rust.
//!
//! ## Overview
//!
//! This crate lets a procedure suspend itself from any depth of its call stack, hand a value back to whoever resumed it, and later continue exactly where it left off. Every coroutine runs on its own private stack, so ordinary function calls, locals and `Drop` work inside it just as they do on a thread's main stack.
//!
//! A coroutine's entry frame is first built on the caller's own stack and then relocated onto the private stack. The frame is measured between two stack pointer markers and copied byte for byte; from the first switch onwards everything the procedure does stays on its private stack.
//!
//! ## Example
//!
//! ```rust
//! use jumpstack::Coroutine;
//!
//! let mut range = Coroutine::new(|yielder, (start, end): (i32, i32)| {
//!     for i in start..end - 1 {
//!         yielder.suspend(i);
//!     }
//!     end - 1
//! })
//! .unwrap();
//!
//! range.start((5, 11));
//! for expected in 5..10 {
//!     assert_eq!(range.next(), (expected, true));
//! }
//!
//! // The return value is reported once as still running, then forever after
//! // as finished.
//! assert_eq!(range.next(), (10, true));
//! assert_eq!(range.next(), (10, false));
//! assert_eq!(range.next(), (10, false));
//! ```
//!
//! ## Yielding without a handle
//!
//! Code deep inside a coroutine doesn't need to be handed the [`Yielder`]. [`locator::suspend`] finds the coroutine running on the current thread and checks at run time that the value has the type that coroutine produces.
//!
//! ```rust
//! use jumpstack::{locator, Coroutine};
//!
//! fn emit(word: &'static str) {
//!     locator::suspend(word);
//! }
//!
//! let mut words = Coroutine::new(|_, ()| {
//!     emit("hello");
//!     emit("world");
//!     "done"
//! })
//! .unwrap();
//!
//! words.start(());
//! let seen: Vec<_> = words.iter().collect();
//! assert_eq!(seen, ["hello", "world", "done"]);
//! ```
//!
//! ## Ambient environment
//!
//! [`Coroutine::start`] captures the thread's [`ambient::Ambient`]. The coroutine body runs under that environment, and any it installs itself, no matter which code resumes it.
//!
//! ## Supported targets
//!
//! Only `x86_64` and `aarch64` on unix-like systems are supported. Relocating a frame by copying raw stack bytes is only sound with a single stack pointer register and a downward-growing stack, so any other target fails at build time.
//!
//! ## Features
//!
//! #### Panic propagation
//!
//! If a panic occurs in a coroutine then the panic will unwind through the coroutine stack and then continue to unwind out of the caller which last resumed it. Once this has happened, the coroutine is poisoned and can no longer be resumed.
//!
//! #### Linked backtraces
//!
//! Backtraces taken from within a coroutine will continue into the parent stack from the point where the coroutine was last resumed from. This uses the platform's standard unwinding metadata and works with debuggers and profilers.
//!
//! #### Cleanup on drop
//!
//! If a coroutine is dropped while it is suspended then its stack will be safely unwound using the same mechanism as panics, which will drop any local variables on the stack. [`Coroutine::destroy`] skips this and only frees the stack.
//!
//! ## Cargo features
//!
//! #### `unwind` (Enabled by default)
//!
//! This feature adds support for:
//! - unwinding panics in a coroutine back out to its caller.
//! - forcibly unwinding a suspended coroutine via `force_unwind` or when the coroutine is dropped.
//!
//! Without it a panic reaching the root of a coroutine aborts the process, and dropping a suspended coroutine panics.
//!
//! ## Configuration
//!
//! The default stack size is 1 MiB. It can be changed at build time by setting `JUMPSTACK_DEFAULT_STACK_SIZE` to a byte count, optionally suffixed with `K` or `M`.

#![warn(missing_docs)]

mod unwind;

pub mod ambient;
mod arch;
mod bootstrap;
mod coroutine;
mod error;
pub mod locator;
mod snapshot;
pub mod stack;
mod util;

pub use coroutine::{Coroutine, Iter, State, Yielder};
pub use error::{Error, Result};

#[cfg(test)]
mod tests;
