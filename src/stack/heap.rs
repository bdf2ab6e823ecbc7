use std::alloc::{self, Layout};
use std::io::Error as IoError;

use super::{Stack, StackAllocator, StackPointer, MIN_STACK_SIZE, STACK_ALIGNMENT};
use crate::error::{Error, Result};

/// Pattern written at the limit of a heap stack. Anything else found there
/// means the coroutine ran past the end of its stack.
const CANARY: u64 = 0x6a75_6d70_5f73_6b21;

/// Stack carved out of the global allocator.
///
/// Unlike [`DefaultStack`](super::DefaultStack) there is no guard page. Running
/// past the limit writes into whatever the global allocator placed below the
/// stack. The canary word at the limit (see [`Stack::intact`]) only catches
/// overflows that happen to overwrite it, after the fact. Heap stacks avoid
/// the system calls and page rounding of mmap, which makes them useful for
/// large numbers of shallow coroutines whose depth is known.
pub struct HeapStack {
    ptr: *mut u8,
    layout: Layout,
}

// The stack is plain owned memory.
unsafe impl Send for HeapStack {}
unsafe impl Sync for HeapStack {}

impl HeapStack {
    /// Allocates a stack of `size` bytes aligned to `align`.
    ///
    /// The size is rounded up to a multiple of the alignment. One canary word
    /// at the limit is reserved and not counted as usable space. Sizes below
    /// [`MIN_STACK_SIZE`] are rejected.
    ///
    /// # Safety
    ///
    /// Nothing stops code running on this stack from going past its limit.
    /// The caller must ensure that every coroutine using it stays within
    /// `size` bytes of call depth, including anything its procedure calls.
    pub unsafe fn new(size: usize, align: usize) -> Result<Self> {
        let fail = |source| Error::Allocation { size, source };

        if size < MIN_STACK_SIZE {
            return Err(fail(IoError::new(
                std::io::ErrorKind::InvalidInput,
                format!("heap stacks must be at least {MIN_STACK_SIZE} bytes"),
            )));
        }

        let align = align.max(STACK_ALIGNMENT);
        let layout = size
            .checked_add(align - 1)
            .map(|usable| usable & !(align - 1))
            .and_then(|usable| usable.checked_add(align))
            .and_then(|total| Layout::from_size_align(total, align).ok())
            .ok_or_else(|| fail(IoError::other("invalid stack layout")))?;

        let ptr = alloc::alloc(layout);
        if ptr.is_null() {
            return Err(fail(IoError::from(std::io::ErrorKind::OutOfMemory)));
        }
        (ptr as *mut u64).write(CANARY);

        log::debug!(
            "allocated {} byte heap stack at {:#x}",
            layout.size(),
            ptr as usize
        );
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapStack {
    fn drop(&mut self) {
        log::debug!("freeing heap stack at {:#x}", self.ptr as usize);
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

unsafe impl Stack for HeapStack {
    #[inline]
    fn base(&self) -> StackPointer {
        unsafe { StackPointer::new_unchecked(self.ptr as usize + self.layout.size()) }
    }

    // The first alignment unit holds the canary.
    #[inline]
    fn limit(&self) -> StackPointer {
        unsafe { StackPointer::new_unchecked(self.ptr as usize + self.layout.align()) }
    }

    #[inline]
    fn intact(&self) -> bool {
        unsafe { (self.ptr as *const u64).read() == CANARY }
    }
}

/// Allocator producing [`HeapStack`]s from the global allocator.
#[derive(Clone, Copy, Debug)]
pub struct HeapAllocator {
    _private: (),
}

impl HeapAllocator {
    /// Creates a heap stack allocator.
    ///
    /// # Safety
    ///
    /// Every stack handed out carries the obligation described on
    /// [`HeapStack::new`]: coroutines running on it must never need more than
    /// the size they were made with.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl StackAllocator for HeapAllocator {
    type Stack = HeapStack;

    fn allocate(&self, size: usize, align: usize) -> Result<HeapStack> {
        unsafe { HeapStack::new(size, align) }
    }
}
