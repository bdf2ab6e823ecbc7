//! Handle-free yielding.
//!
//! [`Yielder::suspend`] needs the coroutine's [`Yielder`] to be threaded down
//! to wherever the suspension happens. Sometimes that is inconvenient, for
//! example deep inside a callback whose signature can't change. [`suspend`]
//! finds the coroutine currently running on this thread instead.
//!
//! Each thread keeps a stack of the coroutines it is currently running. An
//! entry is pushed when a coroutine is resumed and popped when control comes
//! back to its resumer, so nested coroutines always see the innermost one.
//!
//! The value's type can't be checked at compile time on this path. Every call
//! compares it against the output type the running coroutine was made with.

use core::any::{self, TypeId};
use core::cell::{Cell, RefCell};

use crate::coroutine::Yielder;
use crate::error::Error;
use crate::stack::StackPointer;

/// A coroutine that is running on this thread.
#[derive(Clone, Copy)]
struct Active {
    parent_link: *const Cell<StackPointer>,
    output: TypeId,
    output_name: &'static str,
}

thread_local! {
    static ACTIVE: RefCell<Vec<Active>> = const { RefCell::new(Vec::new()) };
}

/// Marks the coroutine behind `yielder` as running on this thread until the
/// returned guard is dropped.
pub(crate) fn enter<Output: 'static>(
    yielder: *const Yielder<Output>,
) -> scopeguard::ScopeGuard<usize, impl FnOnce(usize)> {
    let depth = ACTIVE.with(|a| {
        let mut a = a.borrow_mut();
        a.push(Active {
            parent_link: yielder.cast(),
            output: TypeId::of::<Output>(),
            output_name: any::type_name::<Output>(),
        });
        a.len()
    });
    scopeguard::guard(depth, |depth| {
        ACTIVE.with(|a| {
            let mut a = a.borrow_mut();
            debug_assert_eq!(a.len(), depth, "unbalanced coroutine locator stack");
            a.truncate(depth - 1);
        })
    })
}

/// Finds the yielder of the innermost running coroutine, checking that it
/// yields values of type `T`.
fn locate<T: 'static>() -> Result<&'static Yielder<T>, Error> {
    let top = ACTIVE
        .with(|a| a.borrow().last().copied())
        .ok_or(Error::NoActiveCoroutine)?;
    if top.output != TypeId::of::<T>() {
        return Err(Error::TypeMismatch {
            expected: top.output_name,
            found: any::type_name::<T>(),
        });
    }

    // The parent link lives at the base of the running coroutine's stack,
    // which outlives any code running on that stack.
    Ok(unsafe { &*(top.parent_link as *const Yielder<T>) })
}

/// Returns whether `link` is the parent link of the innermost coroutine running
/// on this thread.
pub(crate) fn is_innermost(link: *const Cell<StackPointer>) -> bool {
    ACTIVE.with(|a| a.borrow().last().is_some_and(|top| top.parent_link == link))
}

/// Suspends the coroutine currently running on this thread, handing `val` to
/// whoever called [`Coroutine::next`](crate::Coroutine::next).
///
/// This is the ambient equivalent of [`Yielder::suspend`].
///
/// # Panics
///
/// Panics if no coroutine is running on this thread, or if `T` is not the
/// output type of the running coroutine. Both checks happen before any state
/// is touched.
#[track_caller]
pub fn suspend<T: 'static>(val: T) {
    match locate::<T>() {
        Ok(yielder) => yielder.suspend(val),
        Err(e) => e.fatal(),
    }
}

/// Returns whether a coroutine is running on this thread.
pub fn is_active() -> bool {
    ACTIVE.with(|a| !a.borrow().is_empty())
}

/// Returns the number of coroutines nested on this thread's call stack.
pub fn depth() -> usize {
    ACTIVE.with(|a| a.borrow().len())
}
