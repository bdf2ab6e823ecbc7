//! Saved execution state of a suspended context.
//!
//! A suspended context keeps its callee-saved registers and its resume address
//! in a small fixed frame at the top of its own stack (see the layout diagrams
//! in the `arch` modules). A [`Snapshot`] is the stack pointer that locates
//! that frame, which is all that is needed to switch back into the context.

use core::fmt;

use crate::stack::StackPointer;

/// Execution state captured when a context was last suspended.
///
/// A snapshot is only valid while the stack it points into is alive and has
/// not been resumed since. An empty snapshot refers to a context that has
/// terminated and can no longer be resumed.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    sp: Option<StackPointer>,
}

impl Snapshot {
    /// A snapshot that cannot be resumed.
    pub const EMPTY: Self = Self { sp: None };

    /// Wraps a stack pointer produced by a context switch.
    #[inline]
    pub(crate) fn captured(sp: Option<StackPointer>) -> Self {
        Self { sp }
    }

    /// Returns the stack pointer at which the saved register frame lives.
    #[inline]
    pub fn stack_pointer(&self) -> Option<StackPointer> {
        self.sp
    }

    /// Takes the stack pointer out of this snapshot, leaving it empty.
    ///
    /// Used right before switching into the context so that a switch that
    /// never comes back leaves no stale snapshot behind.
    #[inline]
    pub(crate) fn take(&mut self) -> Option<StackPointer> {
        self.sp.take()
    }

    /// Redirects this snapshot to a copy of its frame at `sp`.
    ///
    /// This is the only mutation a snapshot supports, and it is only sound if
    /// the bytes of the frame were copied to `sp` verbatim and the frame holds
    /// no pointers into itself.
    #[inline]
    pub(crate) unsafe fn relocate(&mut self, sp: StackPointer) {
        debug_assert!(self.sp.is_some(), "relocating an empty snapshot");
        self.sp = Some(sp);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sp {
            Some(sp) => write!(f, "Snapshot({:#x})", sp.get()),
            None => f.write_str("Snapshot(empty)"),
        }
    }
}
