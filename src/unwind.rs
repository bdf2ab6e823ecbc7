//! This file contains the logic for propagating panics from a coroutine up to
//! its resumer.
//!
//! Panics are caught with `catch_unwind` at the root of the coroutine stack,
//! passed through the final context switch as a `Result` and then re-thrown
//! with `resume_unwind` in whoever called `next`.
//!
//! Without the `unwind` feature there is no way of carrying a panic across the
//! switch, so one reaching the root of a coroutine aborts the process.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::stack::StackPointer;
use crate::util::EncodedValue;

/// Entry point of a coroutine, entered by `jumpstack_init_trampoline` on the first
/// switch into a relocated bootstrap frame.
pub type InitialFunc<T> =
    unsafe extern "C" fn(arg: EncodedValue, parent_link: &mut StackPointer, obj: *mut T) -> !;

cfg_if::cfg_if! {
    if #[cfg(feature = "unwind")] {
        pub type CaughtPanic = Box<dyn Any + Send>;

        #[inline]
        pub fn catch_unwind_at_root<T, F: FnOnce() -> T>(f: F) -> Result<T, CaughtPanic> {
            panic::catch_unwind(AssertUnwindSafe(f))
        }

        #[inline]
        pub fn maybe_resume_unwind<T>(val: Result<T, CaughtPanic>) -> T {
            match val {
                Ok(val) => val,
                Err(e) => panic::resume_unwind(e),
            }
        }
    } else {
        pub type CaughtPanic = core::convert::Infallible;

        #[inline]
        pub fn catch_unwind_at_root<T, F: FnOnce() -> T>(f: F) -> Result<T, CaughtPanic> {
            let guard = scopeguard::guard((), |()| {
                // Nothing can carry the panic across the stack switch, force
                // an abort using a double-panic.
                panic!("cannot propagate coroutine panic without the \"unwind\" feature");
            });
            let result = f();
            core::mem::forget(guard);
            Ok(result)
        }

        #[inline]
        pub fn maybe_resume_unwind<T>(val: Result<T, CaughtPanic>) -> T {
            match val {
                Ok(val) => val,
                Err(e) => match e {},
            }
        }
    }
}

/// Panic payload thrown inside a suspended coroutine to unwind its stack back
/// to the root. Carries the stack pointer of the coroutine so that the resumer
/// can recognise its own forced unwind when it comes back out.
#[repr(transparent)]
pub struct ForcedUnwind(pub StackPointer);

/// Value received by a coroutine each time it is resumed: either a plain
/// resume or a request to unwind.
pub type ResumeInput = Result<(), ForcedUnwind>;

#[inline]
pub fn maybe_force_unwind(val: ResumeInput) {
    if let Err(e) = val {
        panic::resume_unwind(Box::new(e));
    }
}

impl ForcedUnwind {
    /// Returns whether `payload` is the forced unwind started for the stack at
    /// `stack_ptr`.
    pub fn matches(payload: &(dyn Any + Send), stack_ptr: StackPointer) -> bool {
        payload
            .downcast_ref::<ForcedUnwind>()
            .map_or(false, |forced| forced.0 == stack_ptr)
    }
}
