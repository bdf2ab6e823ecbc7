use std::io::Error as IoError;
use std::ptr;

use super::{Stack, StackAllocator, StackPointer, MIN_STACK_SIZE};
use crate::error::{Error, Result};

fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Stack allocated with `mmap`, with a guard page below its limit.
pub struct DefaultStack {
    base: StackPointer,
    mmap_len: usize,
    page_size: usize,
}

impl DefaultStack {
    /// Creates a new stack which has at least the given capacity.
    pub fn new(size: usize) -> Result<Self> {
        let fail = |source| Error::Allocation { size, source };

        // Apply minimum stack size.
        let usable = size.max(MIN_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let mmap_len = usable
            .checked_add(page_size + page_size - 1)
            .ok_or_else(|| fail(IoError::other("stack size overflows the address space")))?
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            // Reserve some address space for the stack.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(fail(IoError::last_os_error()));
            }

            // Create the result here. If the mprotect call fails then this will
            // be dropped and the memory will be unmapped.
            let out = Self {
                base: StackPointer::new_unchecked(mmap as usize + mmap_len),
                mmap_len,
                page_size,
            };

            // Make everything except the guard page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(fail(IoError::last_os_error()));
            }

            log::debug!(
                "mapped {} byte stack at {:#x}..{:#x}",
                mmap_len,
                mmap as usize,
                out.base.get()
            );
            Ok(out)
        }
    }
}

impl Drop for DefaultStack {
    fn drop(&mut self) {
        unsafe {
            let mmap = self.base.get() - self.mmap_len;
            let ret = libc::munmap(mmap as _, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
        log::debug!("unmapped stack at {:#x}", self.base.get());
    }
}

unsafe impl Stack for DefaultStack {
    #[inline]
    fn base(&self) -> StackPointer {
        self.base
    }

    // The guard page is excluded: it is never usable.
    #[inline]
    fn limit(&self) -> StackPointer {
        unsafe { StackPointer::new_unchecked(self.base.get() - self.mmap_len + self.page_size) }
    }
}

/// Allocator producing guard-paged [`DefaultStack`]s straight from the OS.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapAllocator;

impl StackAllocator for MmapAllocator {
    type Stack = DefaultStack;

    fn allocate(&self, size: usize, align: usize) -> Result<DefaultStack> {
        // Page alignment covers every alignment a stack can ask for.
        debug_assert!(align <= page_size());
        DefaultStack::new(size)
    }
}
