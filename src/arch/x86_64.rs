//! This file contains the low level operations that deal with switching between
//! stacks.
//!
//! The core operations are:
//! - `relocate_frame` to build the entry frame of a coroutine on the current
//!   stack and move it onto the coroutine stack.
//! - `switch_and_link` to switch control into a coroutine.
//! - `switch_yield` to return control from a coroutine back to its resumer.
//! - `switch_and_reset` to return control for the last time.
//!
//! ## Linked stacks
//!
//! Stack linking allows a context switch to be automatically performed when the
//! initial function of a context returns or unwinds. This works by stashing a
//! copy of the resumer's stack pointer near the stack base and updating it
//! every time we switch into the coroutine using `switch_and_link`. This slot
//! is the *parent link*; it is the resumer-side snapshot of a running
//! coroutine.
//!
//! For unwinding and backtraces to work as expected (that is, to continue in
//! the resumer after unwinding past the initial function of a coroutine), we
//! need to use special DWARF CFI instructions to tell the unwinder how to find
//! the parent frame.
//!
//! ## Stack layout
//!
//! Here is what the layout of the stack looks like when a coroutine is
//! suspended.
//!
//! ```text
//! +--------------+  <- Stack base
//! | Initial func |  <- Only used once when resuming for the first time.
//! +--------------+
//! | Parent link  |  <- The Yielder is a pointer to this address. When the
//! +--------------+     coroutine is running, it points to the top of the
//! |              |     resumer stack which contains a saved RIP, RBP and RBX
//! ~     ...      ~     just like a suspended coroutine.
//! |              |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RIP    |  <- Snapshot stack pointer
//! +--------------+
//! ```
//!
//! And this is the layout of the resumer stack when a coroutine is running:
//!
//! ```text
//! |             |
//! ~     ...     ~
//! |             |
//! +-------------+
//! | Saved RBX   |
//! +-------------+
//! | Saved RIP   |  <- These 2 values form a valid entry in the frame pointer
//! +-------------+   | chain. The parent link itself is another entry in the
//! | Saved RBP   |  <- frame pointer chain since RBP points to it.
//! +-------------+  <- Parent link points here.
//! ```
//!
//! ## Bootstrap frame
//!
//! A new coroutine is entered through a frame that `relocate_frame` builds on
//! the *current* stack and then copies verbatim to the top of the coroutine
//! stack. The frame contains no pointers into itself, so the copy is valid at
//! its new address without any fix-up:
//!
//! ```text
//! +--------------+  <- Stack base            (marker before)
//! | Initial func |
//! +--------------+
//! | Parent link  |  <- Zero until the first switch_and_link().
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Payload ptr  |  <- Passed as the 3rd argument of the initial function.
//! +--------------+
//! | Initial RIP  |  <- Points to jumpstack_init_trampoline
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
/// its saved RBP, RBX and RIP, rounded up to `STACK_ALIGNMENT`.
pub const FRAME_SLACK: usize = 32;

// This is a pretty special function that has no real signature. Its use is to
// be the "base" function of all coroutines. This entrypoint is the resume
// address stored in the bootstrap frame by relocate_frame().
//
// We also use this function as a persistent frame on the stack to emit dwarf
// information to unwind into the caller. This allows us to unwind from the
// coroutine's stack back to the stack that the coroutine was resumed from.
global_asm!(
    ".balign 16",
    asm_function_begin!("jumpstack_init_trampoline"),
    ".cfi_startproc",
    // GDB has a hard-coded check that rejects backtraces where the frame
    // addresses do not monotonically increase. Marking this frame as a signal
    // frame works around this since signal frames may switch stacks.
    //
    // Note that as a consequence of this, the unwinder will use the instruction
    // *after* the return address to search for unwind information.
    cfi_signal_frame!(),
    // This gets called by switch_and_link() the first time a coroutine is
    // resumed, due to the bootstrap frame set up by relocate_frame().
    //
    // At this point our register state contains the following:
    // - RSP points to the top of the resumer stack.
    // - RBP holds its value from the resumer context.
    // - RDX points to the top of our stack.
    // - RSI points to the base of our stack.
    // - RDI contains the argument passed from switch_and_link.
    //
    // Save the RBP of the resumer to its stack. When combined with the return
    // address this forms a valid frame record (RBP & RIP) in the frame pointer
    // chain.
    "push rbp",
    // Fill in the parent link near the base of the stack.
    "mov [rsi - 16], rsp",
    // Adjust RSI to point to the parent link for the second parameter of the
    // initial function.
    "sub rsi, 16",
    // Switch to the coroutine stack, skipping the address of
    // jumpstack_init_trampoline() at the top of the stack.
    "lea rsp, [rdx + 8]",
    // Set up the frame pointer to point at the parent link. This is needed for
    // the unwinding code below.
    "mov rbp, rsi",
    // Tell the unwinder where to find the Canonical Frame Address of the
    // resumer: read the parent link through RBP, then skip over the 3 saved
    // values on the resumer stack.
    //
    // 0x0f: DW_CFA_def_cfa_expression
    // 5: byte length of the following DWARF expression
    // 0x76 0x00: DW_OP_breg6 (rbp + 0)
    // 0x06: DW_OP_deref
    // 0x23, 0x18: DW_OP_plus_uconst 24
    ".cfi_escape 0x0f, 5, 0x76, 0x00, 0x06, 0x23, 0x18",
    ".cfi_offset rbx, -8",
    ".cfi_offset rip, -16",
    ".cfi_offset rbp, -24",
    // The 3rd argument of the initial function is the payload pointer stored
    // in the bootstrap frame, now at the top of the stack.
    "mov rdx, [rsp]",
    // Rather than call the initial function with a CALL instruction, we
    // manually set up a return address and use JMP instead. This avoids a
    // misalignment of the CPU's return address predictor when a RET instruction
    // is later executed by switch_yield() or switch_and_reset().
    "lea rcx, [rip + 2f]",
    "push rcx",
    // The bootstrap frame holds the address of the initial function just above
    // the parent link.
    "jmp [rsi + 8]",
    // The initial function never returns. This label only exists so that the
    // pushed return address falls within this function, and the INT3 keeps the
    // address after it inside the function too.
    "2:",
    "int3",
    ".cfi_endproc",
    asm_function_end!("jumpstack_init_trampoline"),
);

// This trampoline uses a custom calling convention and should only be reached
// through a bootstrap frame.
extern "C" {
    fn jumpstack_init_trampoline(arg: EncodedValue, stack_base: StackPointer, stack_ptr: StackPointer);
}

/// Returns the current value of the stack pointer.
#[inline(always)]
pub fn current_stack_pointer() -> usize {
    let sp;
    unsafe {
        asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
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
///
/// Both the construction and the copy happen inside one asm block: once the
/// stack pointer is restored the frame bytes on the current stack are dead and
/// may be overwritten at any time.
#[inline]
pub unsafe fn relocate_frame<T>(
    func: InitialFunc<T>,
    obj: *mut T,
    stack_base: StackPointer,
    capacity: usize,
) -> FrameMarkers {
    let (before, inside, relocated);

    asm!(
        // Marker taken before the frame exists. Inline asm is entered with the
        // stack aligned for a call, so this is 16-byte aligned.
        "mov {before}, rsp",

        // Build the frame, highest address first.
        "push {func}",
        "push 0",
        "push 0",
        "push {obj}",
        "push {trampoline}",

        // Marker taken from inside the live frame.
        "mov {inside}, rsp",

        // frame_length = before - inside
        "mov rcx, {before}",
        "sub rcx, {inside}",

        // Refuse frames that don't fit, leaving the output at 0.
        "cmp rcx, {capacity}",
        "jae 2f",

        // Copy the frame byte for byte to the same offset below the base of
        // the coroutine stack.
        "mov rsi, {inside}",
        "mov rdi, {base}",
        "sub rdi, rcx",
        "mov {relocated}, rdi",
        "rep movsb",

        "2:",
        "mov rsp, {before}",

        func = in(reg) func as usize,
        obj = in(reg) obj as usize,
        trampoline = in(reg) jumpstack_init_trampoline as usize,
        base = in(reg) stack_base.get(),
        capacity = in(reg) capacity,
        before = out(reg) before,
        inside = out(reg) inside,
        relocated = inout(reg) 0usize => relocated,
        out("rcx") _, out("rsi") _, out("rdi") _,
    );

    FrameMarkers {
        before,
        inside,
        relocated,
    }
}

/// This function is used to transfer control to a coroutine along with an
/// argument. A pointer back to our context is stored at a fixed offset from
/// the base of the target stack.
///
/// When the coroutine switches back to us, we receive the argument it sent as
/// well as its new stack pointer. This is `None` if it used
/// `switch_and_reset` and can't be returned to.
#[inline]
pub unsafe fn switch_and_link(
    arg: EncodedValue,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    asm!(
        // Save RBX. Ideally this would be done by specifying them as a clobber
        // but that is not possible since RBX is an LLVM reserved register.
        //
        // RBP is also reserved but it is pushed onto the stack later after the
        // call so that a valid frame pointer record is created.
        "push rbx",

        // Push a return address onto our stack and then jump to the return
        // address at the top of the coroutine stack.
        //
        // From here on execution continues in jumpstack_init_trampoline or the
        // 2: label in switch_yield.
        "call [rdx]",

        // Upon returning, our register state contains the following:
        // - RSP: Our stack, with the return address and RBP popped.
        // - RSI: The top of the coroutine stack, or 0 if coming from
        //        switch_and_reset.
        // - RDI: The argument passed from the coroutine.

        // Restore RBX.
        "pop rbx",

        // The RDI register is specifically chosen to hold the argument since
        // the ABI uses it for the first argument of a function call.
        inlateout("rdi") arg => ret_val,

        // The returned stack pointer can be in any register, RSI is arbitrarily
        // chosen here. This must match the register used in switch_yield() and
        // switch_and_reset().
        lateout("rsi") ret_sp,

        // Pass the stack base in RSI so that on the first switch it is passed
        // as the second argument of the initial function.
        in("rsi") stack_base.get() as u64,

        // The target stack pointer can be in any register, RDX is arbitrarily
        // chosen here. This needs to match with the register expected by
        // switch_yield().
        in("rdx") sp.get() as u64,

        // Mark all registers as clobbered. Most of the work is done by
        // clobber_abi, we just add the remaining callee-saved registers here.
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

/// This function performs the inverse of `switch_and_link` by returning
/// control to the resumer.
///
/// This function does not return a stack pointer value for the resumer when it
/// switches back to us. Instead, the stack pointer value for the resumer is
/// available in the parent link on the stack.
// This function must always be inlined because it is very sensitive to the
// CPU's return address predictor.
#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    asm!(
        // Save RBP and RBX. Ideally this would be done by specifying them as
        // clobbers but that is not possible since they are LLVM reserved
        // registers.
        "push rbp",
        "push rbx",

        // Push a return address on the stack. This is the address that will be
        // called by switch_and_link() the next time this context is resumed.
        "lea rax, [rip + 2f]",
        "push rax",

        // Save our stack pointer to RSI, which is then returned out of
        // switch_and_link().
        "mov rsi, rsp",

        // Load the resumer's stack pointer.
        "mov rsp, [rdx]",

        // Restore the resumer's RBP register which is at the top of the stack.
        "pop rbp",

        // Return into the resumer. This returns control to switch_and_link()
        // after the call instruction.
        "ret",

        // This gets called by switch_and_link(). At this point our register
        // state contains the following:
        // - RSP points to the top of the resumer stack.
        // - RBP holds its value from the resumer context.
        // - RDX points to the top of our stack, including the return address.
        // - RSI points to the base of our stack.
        // - RDI contains the argument passed from switch_and_link.
        "2:",

        // Save the RBP of the resumer to its stack to form a frame record.
        "push rbp",

        // Update the parent link near the base of the stack.
        "mov [rsi - 16], rsp",

        // Switch back to our stack, skipping the return address.
        "lea rsp, [rdx + 8]",

        // Restore RBP and RBX.
        "pop rbx",
        "pop rbp",

        // RDI is used by switch_and_link to pass the argument in/out.
        inlateout("rdi") arg => ret_val,

        // The parent link can be in any register, RDX is arbitrarily chosen
        // here.
        in("rdx") parent_link as u64,

        // See switch_and_link() for an explanation of the clobbers.
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    ret_val
}

/// Variant of `switch_yield` used when returning from the initial function in a
/// context.
///
/// This works by returning a stack pointer value of 0 which prevents the
/// current context from being resumed. There must not be any object left on the
/// stack with pending destructors when this is called.
///
/// Since the stack is still available at this point, `arg` can safely point to
/// memory on the stack until the resumer frees or reuses the stack.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    // Most of this code is identical to switch_yield(), refer to the
    // comments there. Only the differences are commented.
    asm!(
        // Load the resumer's stack pointer.
        "mov rsp, [{parent_link}]",

        // Restore the resumer's RBP register which is at the top of the stack.
        "pop rbp",

        // Return into the resumer. The top of its stack contains a return
        // address generated by the CALL instruction in switch_and_link().
        "ret",

        parent_link = in(reg) parent_link as u64,

        in("rdi") arg,

        // Hard-code the returned stack pointer value to 0 to indicate that this
        // coroutine is done.
        in("rsi") 0,

        options(noreturn),
    );
}
