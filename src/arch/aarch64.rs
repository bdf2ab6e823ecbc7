//! Low-level AArch64 support.
//!
//! This file mirrors the x86_64 implementation. Relevant differences are
//! highlighted in comments, but otherwise most comments have been removed to
//! avoid duplication. Refer to x86_64.rs for detailed comments about what is
//! happening in this file.
//!
//! ## Stack layout
//!
//! Here is what the layout of the stack looks like when a coroutine is
//! suspended.
//!
//! ```text
//! +--------------+  <- Stack base
//! | Initial func |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Saved PC     |
//! +--------------+
//! | Saved X29    |
//! +--------------+
//! | Saved X19    |  <- Snapshot stack pointer
//! +--------------+
//! ```
//!
//! And this is the layout of the resumer stack when a coroutine is running:
//!
//! ```text
//! |           |
//! ~    ...    ~
//! |           |
//! +-----------+
//! | Padding   |
//! +-----------+
//! | Saved X19 |
//! +-----------+
//! | Saved PC  |
//! +-----------+
//! | Saved X29 |
//! +-----------+
//! ```
//!
//! ## Bootstrap frame
//!
//! SP must stay 16-byte aligned at all times, so the frame is reserved in one
//! step and filled with stores rather than pushed word by word:
//!
//! ```text
//! +--------------+  <- Stack base            (marker before)
//! | Initial func |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Payload ptr  |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Initial PC   |  <- Points to jumpstack_init_trampoline
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Padding      |
//! +--------------+  <- Relocated stack pointer (marker inside)
//! ```

use core::arch::{asm, global_asm};

use crate::stack::StackPointer;
use crate::unwind::InitialFunc;
use crate::util::EncodedValue;

pub const STACK_ALIGNMENT: usize = 16;

/// Offset of the parent link below the stack base.
pub const PARENT_LINK_OFFSET: usize = 16;

/// Space the first suspension needs directly below the relocated frame for
/// its saved X19, X29 and PC plus padding.
pub const FRAME_SLACK: usize = 32;

global_asm!(
    ".balign 4",
    asm_function_begin!("jumpstack_init_trampoline"),
    ".cfi_startproc",
    cfi_signal_frame!(),
    // At this point our register state contains the following:
    // - SP points to the top of the resumer stack.
    // - LR contains the return address in the resumer.
    // - X19 and X29 contain their value from the resumer.
    // - X2 points to the top of the coroutine stack.
    // - X1 points to the base of our stack.
    // - X0 contains the argument passed from switch_and_link.
    //
    // Push the X19, X29 and PC values of the resumer onto its stack.
    "stp x29, lr, [sp, #-32]!",
    "str x19, [sp, #16]",
    // Write the resumer stack pointer to the parent link and adjust X1 to point
    // to the parent link.
    "mov x3, sp",
    "str x3, [x1, #-16]!",
    // Switch to the coroutine stack and pop the padding and initial PC.
    "add sp, x2, #32",
    // Set up the frame pointer to point at the parent link. This is needed for
    // the unwinding code below.
    "mov x29, x1",
    // 0x0f: DW_CFA_def_cfa_expression
    // 5: byte length of the following DWARF expression
    // 0x8d 0x00: DW_OP_breg29 (x29 + 0)
    // 0x06: DW_OP_deref
    // 0x23, 0x20: DW_OP_plus_uconst 32
    ".cfi_escape 0x0f, 5, 0x8d, 0x00, 0x06, 0x23, 0x20",
    ".cfi_offset x19, -16",
    ".cfi_offset lr, -24",
    ".cfi_offset x29, -32",
    // The 3rd argument of the initial function is the payload pointer stored
    // in the bootstrap frame.
    "ldr x2, [sp]",
    // As in the x86_64 code, hand-write the call operation so that it doesn't
    // push an entry into the CPU's return prediction stack.
    "adr lr, 2f",
    "ldr x3, [x1, #8]",
    "br x3",
    "2:",
    // This BRK is necessary because of our use of .cfi_signal_frame earlier.
    "brk #0",
    ".cfi_endproc",
    asm_function_end!("jumpstack_init_trampoline"),
);

extern "C" {
    fn jumpstack_init_trampoline(arg: EncodedValue, stack_base: StackPointer, stack_ptr: StackPointer);
}

/// Returns the current value of the stack pointer.
#[inline(always)]
pub fn current_stack_pointer() -> usize {
    let sp;
    unsafe {
        asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}

/// Outcome of building and moving a bootstrap frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameMarkers {
    /// Stack pointer on the current stack before the frame was built.
    pub before: usize,
    /// Stack pointer on the current stack once the frame was built.
    pub inside: usize,
    /// Address of the copied frame on the coroutine stack, or 0 if it did not
    /// fit and nothing was copied.
    pub relocated: usize,
}

/// Builds the bootstrap frame for `func` on the current stack, then copies it
/// to the top of the coroutine stack at `stack_base` if its length is below
/// `capacity`.
#[inline]
pub unsafe fn relocate_frame<T>(
    func: InitialFunc<T>,
    obj: *mut T,
    stack_base: StackPointer,
    capacity: usize,
) -> FrameMarkers {
    let (before, inside, relocated);

    asm!(
        "mov {before}, sp",

        // Reserve and fill the frame.
        "sub sp, sp, #64",
        "stp xzr, {func}, [sp, #48]",
        "stp {obj}, xzr, [sp, #32]",
        "stp {trampoline}, xzr, [sp, #16]",
        "stp xzr, xzr, [sp]",

        "mov {inside}, sp",

        // frame_length = before - inside
        "sub x9, {before}, {inside}",
        "cmp x9, {capacity}",
        "b.hs 2f",

        // Copy the frame 16 bytes at a time to the same offset below the base
        // of the coroutine stack. The frame length is a multiple of 16.
        "sub x10, {base}, x9",
        "mov {relocated}, x10",
        "mov x11, {inside}",
        "3:",
        "ldp x12, x13, [x11], #16",
        "stp x12, x13, [x10], #16",
        "subs x9, x9, #16",
        "b.ne 3b",

        "2:",
        "mov sp, {before}",

        func = in(reg) func as usize,
        obj = in(reg) obj as usize,
        trampoline = in(reg) jumpstack_init_trampoline as usize,
        base = in(reg) stack_base.get(),
        capacity = in(reg) capacity,
        before = out(reg) before,
        inside = out(reg) inside,
        relocated = inout(reg) 0usize => relocated,
        out("x9") _, out("x10") _, out("x11") _, out("x12") _, out("x13") _,
    );

    FrameMarkers {
        before,
        inside,
        relocated,
    }
}

#[inline]
pub unsafe fn switch_and_link(
    arg: EncodedValue,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    asm!(
        // Read the saved PC from the coroutine stack and call it.
        "ldr x3, [x2, #16]",
        "blr x3",

        // Upon returning, our register state contains the following:
        // - X2: Our stack pointer.
        // - X1: The top of the coroutine stack, or 0 if coming from
        //       switch_and_reset.
        // - X0: The argument passed from the coroutine.

        // Switch back to our stack and free the saved registers.
        "add sp, x2, #32",

        // Pass the argument in X0.
        inlateout("x0") arg => ret_val,

        // We get the coroutine stack pointer back in X1.
        lateout("x1") ret_sp,

        // We pass the stack base in X1.
        in("x1") stack_base.get() as u64,

        // We pass the target stack pointer in X2.
        in("x2") sp.get() as u64,

        // Mark all registers as clobbered. The clobber_abi() will automatically
        // mark X18 as clobbered if it is not reserved by the platform.
        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    asm!(
        // Save X19 and X29 while also reserving space on the stack for our
        // saved PC.
        "stp x19, x29, [sp, #-32]!",

        // Write our return address to its expected position on the stack.
        "adr lr, 2f",
        "str lr, [sp, #16]",

        // Get the resumer stack pointer from the parent link.
        "ldr x2, [x2]",

        // Save our stack pointer to X1.
        "mov x1, sp",

        // Restore X19, X29 and LR from the resumer stack.
        "ldr x19, [x2, #16]",
        "ldp x29, lr, [x2]",

        // Return into the resumer.
        "ret",

        // This gets called by switch_and_link(). At this point our register
        // state contains the following:
        // - SP points to the top of the resumer stack.
        // - LR contains the return address in the resumer.
        // - X19 and X29 contain their value from the resumer.
        // - X2 points to the top of the coroutine stack.
        // - X1 points to the base of our stack.
        // - X0 contains the argument passed from switch_and_link.
        "2:",

        // Push the X19, X29 and PC values of the resumer onto its stack.
        "stp x29, lr, [sp, #-32]!",
        "str x19, [sp, #16]",

        // Write the resumer stack pointer to the parent link.
        "mov x3, sp",
        "str x3, [x1, #-16]",

        // Load our X19 and X29 values from the coroutine stack.
        "ldp x19, x29, [x2]",

        // Switch to the coroutine stack while popping the saved registers and
        // padding.
        "add sp, x2, #32",

        // Pass the argument in X0.
        inlateout("x0") arg => ret_val,

        // The parent link can be in any register, X2 is arbitrarily chosen
        // here.
        in("x2") parent_link as u64,

        // See switch_and_link() for an explanation of the clobbers.
        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    ret_val
}

#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    // Most of this code is identical to switch_yield(), refer to the
    // comments there. Only the differences are commented.
    asm!(
        // Load the resumer's stack pointer.
        "ldr x2, [{parent_link}]",

        // Restore X19, X29 and LR from the resumer stack.
        "ldr x19, [x2, #16]",
        "ldp x29, lr, [x2]",

        // Return into the resumer.
        "ret",

        parent_link = in(reg) parent_link as u64,

        in("x0") arg,

        // Hard-code the returned stack pointer value to 0 to indicate that this
        // coroutine is done.
        in("x1") 0,

        options(noreturn),
    );
}
