//! Stack storage for coroutines.
//!
//! Every coroutine owns exactly one stack, obtained from a [`StackAllocator`]
//! when the coroutine is made and handed back to the same allocator when it is
//! destroyed. Stacks are never resized.
//!
//! In most cases the default mmap-backed allocator is sufficient. A
//! [`HeapAllocator`] is provided for stacks carved out of the global
//! allocator. It has no guard page, so it is `unsafe` to create. Custom
//! allocators can implement [`StackAllocator`].

use core::num::NonZeroUsize;

use crate::error::Result;

mod heap;
mod unix;

pub use self::heap::{HeapAllocator, HeapStack};
pub use self::unix::{DefaultStack, MmapAllocator};

include!(concat!(env!("OUT_DIR"), "/config.rs"));

/// Type to represent a stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// Minimum size of a stack, excluding guard pages.
///
/// mmap-backed stacks are rounded up to it, heap stacks below it are rejected.
pub const MIN_STACK_SIZE: usize = 4096;

/// Allocator used by coroutines that don't name one explicitly.
pub type DefaultAllocator = MmapAllocator;

/// Returns the current value of the stack pointer register.
#[inline(always)]
pub fn current_stack_pointer() -> usize {
    crate::arch::current_stack_pointer()
}

/// A trait for objects that hold ownership of a stack.
///
/// # Safety
///
/// The memory between [`limit`](Stack::limit) and [`base`](Stack::base) must be
/// readable and writable for the lifetime of the object. Overflowing the stack
/// must either fault (guard page) or be reported by [`intact`](Stack::intact).
pub unsafe trait Stack {
    /// Returns the base address of the stack. This is the highest address since
    /// stacks grow downwards on all supported architectures.
    ///
    /// Must be aligned to [`STACK_ALIGNMENT`].
    fn base(&self) -> StackPointer;

    /// Returns the limit address of the stack. This is the lowest usable
    /// address.
    ///
    /// Must be aligned to [`STACK_ALIGNMENT`].
    fn limit(&self) -> StackPointer;

    /// Returns the usable size of the stack in bytes.
    fn size(&self) -> usize {
        self.base().get() - self.limit().get()
    }

    /// Returns `false` if the stack has been written past its limit.
    ///
    /// Stacks protected by a guard page can never observe this and keep the
    /// default.
    fn intact(&self) -> bool {
        true
    }
}

/// Source of coroutine stacks.
///
/// The allocator that produced a stack is kept by the coroutine and is the one
/// that releases it.
pub trait StackAllocator {
    /// Stack type produced by this allocator.
    type Stack: Stack;

    /// Allocates a stack with at least `size` usable bytes whose base and limit
    /// are aligned to `align`.
    ///
    /// `align` is never smaller than [`STACK_ALIGNMENT`].
    fn allocate(&self, size: usize, align: usize) -> Result<Self::Stack>;

    /// Returns a stack to this allocator.
    fn release(&self, stack: Self::Stack) {
        drop(stack);
    }
}

/// A reference to an allocator can be used as an allocator, which lets several
/// coroutines share one.
impl<A: StackAllocator> StackAllocator for &A {
    type Stack = A::Stack;

    #[inline]
    fn allocate(&self, size: usize, align: usize) -> Result<Self::Stack> {
        (**self).allocate(size, align)
    }

    #[inline]
    fn release(&self, stack: Self::Stack) {
        (**self).release(stack)
    }
}

#[test]
fn assert_send_sync() {
    fn send<T: Send>() {}
    fn sync<T: Sync>() {}
    send::<DefaultStack>();
    sync::<DefaultStack>();
    send::<HeapStack>();
    sync::<HeapStack>();
}
