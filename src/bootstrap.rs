//! Bootstrapping a coroutine onto its private stack.
//!
//! The entry frame of a coroutine is not written directly into the private
//! stack. Instead it is built on the caller's stack between two stack pointer
//! markers, one taken just before the frame and one from inside it. The bytes
//! between the markers are then copied to the top of the private stack and the
//! snapshot taken inside the frame is redirected to the copy.
//!
//! The frame holds no pointers into itself, so the copy needs no fix-up: the
//! first switch into the relocated snapshot lands in the entry trampoline with
//! the same register state it would have had on the original stack.

use crate::arch;
use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::stack::{Stack, StackPointer};
use crate::unwind::InitialFunc;

/// Builds the entry frame for `func` and relocates it onto `stack`, returning a
/// snapshot that enters `func` with `obj` as its payload on the first switch.
///
/// Fails with [`Error::CapacityExceeded`] without touching `stack` if the frame
/// plus the space the first suspension needs does not fit.
///
/// # Safety
///
/// `obj` must stay valid until the first switch into the returned snapshot has
/// handed control back.
pub(crate) unsafe fn relocate<S: Stack, T>(
    stack: &S,
    func: InitialFunc<T>,
    obj: *mut T,
) -> Result<Snapshot> {
    let capacity = stack.size().saturating_sub(arch::FRAME_SLACK);
    let markers = arch::relocate_frame(func, obj, stack.base(), capacity);
    let frame = markers.before - markers.inside;

    let relocated = match StackPointer::new(markers.relocated) {
        Some(sp) => sp,
        None => return Err(Error::CapacityExceeded { frame, capacity }),
    };
    debug_assert_eq!(relocated.get(), stack.base().get() - frame);

    log::trace!(
        "relocated {} byte bootstrap frame from {:#x} to {:#x}",
        frame,
        markers.inside,
        relocated.get()
    );

    let mut snapshot = Snapshot::captured(StackPointer::new(markers.inside));
    snapshot.relocate(relocated);
    Ok(snapshot)
}
