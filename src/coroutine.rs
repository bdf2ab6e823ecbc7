use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop};
use core::ops::Range;

use crate::ambient::{self, Ambient};
use crate::arch::{self, PARENT_LINK_OFFSET, STACK_ALIGNMENT};
use crate::bootstrap;
use crate::error::{Error, Result};
use crate::locator;
use crate::snapshot::Snapshot;
use crate::stack::{DefaultAllocator, Stack, StackAllocator, StackPointer, DEFAULT_STACK_SIZE};
use crate::unwind::{self, CaughtPanic, ResumeInput};
use crate::util::{self, EncodedValue};

/// Procedure run by a coroutine.
type Procedure<'a, Arg, Output> = Box<dyn FnOnce(&Yielder<Output>, Arg) -> Output + 'a>;

/// Lifecycle of a [`Coroutine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// A stack has been allocated and a procedure bound, but nothing has run.
    Made,
    /// The procedure is parked on its own stack, waiting for the next
    /// [`Coroutine::next`].
    Suspended,
    /// The procedure returned. Its return value has been observed once.
    Finished,
    /// The procedure was unwound, either by a panic or by
    /// [`Coroutine::force_unwind`]. It can't be resumed.
    Poisoned,
    /// The stack has been released. The handle can be re-made with
    /// [`Coroutine::remake`].
    Destroyed,
}

/// Outcome of switching into a coroutine.
enum Resumed<Output> {
    Yield(Output),
    Return(core::result::Result<Output, CaughtPanic>),
}

/// A stackful coroutine running a procedure that takes an `Arg` and produces
/// a sequence of `Output` values.
///
/// A coroutine goes through the following steps:
/// - It is made with [`new`](Coroutine::new) or one of its variants, which
///   allocates its stack.
/// - It is started exactly once with [`start`](Coroutine::start), which moves
///   the procedure and its argument onto that stack.
/// - It is driven with [`next`](Coroutine::next). Each call runs the procedure
///   until it yields or returns.
/// - It is destroyed, either explicitly with [`destroy`](Coroutine::destroy)
///   or by dropping it.
///
/// The procedure yields either through the [`Yielder`] it is given or, without
/// a handle, through [`locator::suspend`](crate::locator::suspend).
///
/// # Lifetime
///
/// The `'a` lifetime here refers to the lifetime of the procedure and ensures
/// that the coroutine doesn't outlive anything the procedure borrows.
///
/// # Dropping a coroutine
///
/// Dropping a suspended coroutine unwinds its stack with
/// [`force_unwind`](Coroutine::force_unwind) so that everything still alive on
/// it is dropped, then releases the stack. [`destroy`](Coroutine::destroy)
/// releases the stack *without* unwinding it.
///
/// # `Send`
///
/// Values on a suspended coroutine's stack are not tracked by the type system,
/// and the locator and ambient environment are per-thread. `Coroutine` is
/// therefore never `Send`.
///
/// ```compile_fail
/// fn send<T: Send>() {}
/// send::<jumpstack::Coroutine<(), ()>>();
/// ```
pub struct Coroutine<'a, Arg, Output: 'static, A: StackAllocator = DefaultAllocator> {
    // Allocator that produced the stack, and the size it was asked for.
    allocator: A,
    size: usize,

    // Private stack of the coroutine. None once destroyed.
    stack: Option<A::Stack>,

    // Procedure bound at make time. Moved onto the private stack by start().
    func: Option<Procedure<'a, Arg, Output>>,

    // Coroutine-side snapshot. The resumer-side snapshot is the parent link
    // near the base of the stack.
    snapshot: Snapshot,

    state: State,

    // Most recent value produced by the coroutine.
    last: Option<Output>,

    // Environment of whoever called start().
    ambient: Ambient,

    marker: PhantomData<*mut ()>,
}

impl<'a, Arg, Output: 'static> Coroutine<'a, Arg, Output> {
    /// Makes a coroutine that will run `f` on a stack of the default size.
    ///
    /// The default size is fixed at build time, see
    /// [`DEFAULT_STACK_SIZE`](crate::stack::DEFAULT_STACK_SIZE).
    pub fn new<F>(f: F) -> Result<Self>
    where
        F: FnOnce(&Yielder<Output>, Arg) -> Output + 'a,
    {
        Self::with_size(DEFAULT_STACK_SIZE, f)
    }

    /// Makes a coroutine that will run `f` on a stack of at least `size`
    /// bytes.
    pub fn with_size<F>(size: usize, f: F) -> Result<Self>
    where
        F: FnOnce(&Yielder<Output>, Arg) -> Output + 'a,
    {
        Self::with_allocator(DefaultAllocator::default(), size, f)
    }
}

impl<'a, Arg, Output: 'static, A: StackAllocator> Coroutine<'a, Arg, Output, A> {
    /// Makes a coroutine that will run `f` on a stack of `size` bytes obtained
    /// from `allocator`.
    ///
    /// Nothing runs until [`start`](Coroutine::start) is called. If the stack
    /// can't be allocated no coroutine is produced and the error is returned.
    pub fn with_allocator<F>(allocator: A, size: usize, f: F) -> Result<Self>
    where
        F: FnOnce(&Yielder<Output>, Arg) -> Output + 'a,
    {
        let stack = allocator.allocate(size, STACK_ALIGNMENT)?;
        log::debug!(
            "made coroutine with {} byte stack at {:#x}",
            stack.size(),
            stack.base().get()
        );

        Ok(Self {
            allocator,
            size,
            stack: Some(stack),
            func: Some(Box::new(f)),
            snapshot: Snapshot::EMPTY,
            state: State::Made,
            last: None,
            ambient: Ambient::default(),
            marker: PhantomData,
        })
    }

    /// Starts the coroutine with `arg`.
    ///
    /// This bootstraps the coroutine onto its private stack and leaves it
    /// suspended right before its procedure. The procedure itself first runs
    /// on the following [`next`](Coroutine::next).
    ///
    /// The ambient environment current at this point is captured. The
    /// procedure starts under it and keeps any environment it installs itself
    /// across suspensions.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine has already been started or was destroyed.
    ///
    /// Aborts the process if the bootstrap frame does not fit in the stack.
    #[track_caller]
    pub fn start(&mut self, arg: Arg) {
        match self.state {
            State::Made => {}
            State::Destroyed => Error::Misuse("start called on a destroyed coroutine").fatal(),
            _ => Error::Misuse("start called on a coroutine that was already started").fatal(),
        }
        let (stack, func) = match (&self.stack, self.func.take()) {
            (Some(stack), Some(func)) => (stack, func),
            _ => unreachable!("made coroutine without a stack or procedure"),
        };
        self.ambient = ambient::current();

        // This is the initial function of the coroutine, entered through the
        // relocated bootstrap frame. The payload still lives in the frame of
        // start() on the resumer stack.
        unsafe extern "C" fn coroutine_func<Arg, Output, F>(
            _input: EncodedValue,
            parent_link: &mut StackPointer,
            payload: *mut (F, Arg),
        ) -> !
        where
            F: FnOnce(&Yielder<Output>, Arg) -> Output,
        {
            // The yielder is a #[repr(transparent)] wrapper around the parent
            // link on the stack.
            let yielder = &*(parent_link as *mut StackPointer as *const Yielder<Output>);

            // Move the payload onto this stack before handing control back.
            debug_assert_eq!(payload as usize % mem::align_of::<(F, Arg)>(), 0);
            let (f, arg) = payload.read();

            let result = unwind::catch_unwind_at_root(move || {
                // Park until the first next(). A forced unwind can arrive here
                // if the coroutine is dropped before that.
                let input = arch::switch_yield(0, yielder.link.as_ptr());
                unwind::maybe_force_unwind(util::decode_val::<ResumeInput>(input));
                f(yielder, arg)
            });

            // Return the result, or any caught panic, to the resumer.
            let mut result = ManuallyDrop::new(result);
            arch::switch_and_reset(util::encode_val(&mut result), yielder.link.as_ptr());
        }

        let mut payload = ManuallyDrop::new((func, arg));
        unsafe {
            let snapshot = match bootstrap::relocate(
                stack,
                coroutine_func::<Arg, Output, Procedure<'a, Arg, Output>>,
                &mut *payload,
            ) {
                Ok(snapshot) => snapshot,
                Err(e) => e.abort(),
            };

            // Enter the relocated frame once. The coroutine takes ownership of
            // the payload and parks.
            let sp = match snapshot.stack_pointer() {
                Some(sp) => sp,
                None => unreachable!("relocated snapshot is always resumable"),
            };
            let (_, sp) = arch::switch_and_link(0, sp, stack.base());
            debug_assert!(sp.is_some(), "coroutine finished while parking");
            self.snapshot = Snapshot::captured(sp);
        }
        check_intact(stack);

        self.state = State::Suspended;
    }

    /// Switches into the coroutine, passing `input` to its suspension point.
    unsafe fn resume_inner(&mut self, input: ResumeInput) -> Resumed<Output> {
        let stack = match &self.stack {
            Some(stack) => stack,
            None => unreachable!("suspended coroutine without a stack"),
        };
        let base = stack.base();

        // Pre-emptively empty the snapshot in case switch_and_link unwinds.
        let sp = match self.snapshot.take() {
            Some(sp) => sp,
            None => unreachable!("suspended coroutine with an empty snapshot"),
        };
        log::trace!("resuming coroutine at {:#x}", sp.get());

        let parent_link = (base.get() - PARENT_LINK_OFFSET) as *const Yielder<Output>;
        let _active = locator::enter(parent_link);

        // The coroutine runs under its own environment. Whatever it has
        // installed when control comes back is kept for the next resume.
        let resumer = ambient::replace(mem::take(&mut self.ambient));
        let saved = &mut self.ambient;
        let mut input = ManuallyDrop::new(input);
        let (result, sp) = {
            let _restore = scopeguard::guard(resumer, |resumer| {
                *saved = ambient::replace(resumer);
            });
            arch::switch_and_link(util::encode_val(&mut input), sp, base)
        };
        self.snapshot = Snapshot::captured(sp);
        check_intact(stack);

        // Decode the returned value depending on whether the coroutine
        // terminated.
        if sp.is_some() {
            Resumed::Yield(util::decode_val(result))
        } else {
            log::trace!("coroutine at {:#x} terminated", base.get());
            Resumed::Return(util::decode_val(result))
        }
    }

    /// Releases the coroutine's stack through the allocator it came from.
    ///
    /// This does not unwind a coroutine that is suspended mid-procedure:
    /// anything still alive on its stack is leaked, and making sure that is
    /// acceptable is the caller's responsibility. Use
    /// [`force_unwind`](Coroutine::force_unwind) first, or simply drop the
    /// coroutine, to run the pending drops instead.
    ///
    /// The handle is left [`Destroyed`](State::Destroyed) and can be reused
    /// with [`remake`](Coroutine::remake). Destroying a destroyed coroutine
    /// does nothing.
    pub fn destroy(&mut self) {
        let stack = match self.stack.take() {
            Some(stack) => stack,
            None => return,
        };
        if self.state == State::Suspended {
            log::debug!(
                "abandoning suspended coroutine at {:#x} without unwinding",
                stack.base().get()
            );
        }
        log::debug!("destroying coroutine with stack at {:#x}", stack.base().get());

        self.allocator.release(stack);
        self.func = None;
        self.snapshot = Snapshot::EMPTY;
        self.last = None;
        self.ambient = Ambient::default();
        self.state = State::Destroyed;
    }

    /// Makes a destroyed coroutine again with a new procedure, using the same
    /// allocator and stack size as before.
    ///
    /// On allocation failure the handle stays destroyed.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine has not been destroyed.
    #[track_caller]
    pub fn remake<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&Yielder<Output>, Arg) -> Output + 'a,
    {
        if self.state != State::Destroyed {
            Error::Misuse("remake called on a coroutine that was not destroyed").fatal();
        }

        let stack = self.allocator.allocate(self.size, STACK_ALIGNMENT)?;
        log::debug!("remade coroutine with stack at {:#x}", stack.base().get());
        self.stack = Some(stack);
        self.func = Some(Box::new(f));
        self.state = State::Made;
        Ok(())
    }

    /// Unwinds the coroutine stack, dropping any live objects that are
    /// currently on it. This is automatically called when the coroutine is
    /// dropped.
    ///
    /// Only a suspended coroutine has anything to unwind; in any other state
    /// this is a no-op. Afterwards the coroutine is
    /// [`Poisoned`](State::Poisoned).
    ///
    /// Unwinding a suspended coroutine requires the `unwind` feature to be
    /// enabled and for the crate to be compiled with `-C panic=unwind`.
    ///
    /// # Panics
    ///
    /// This function panics if the coroutine could not be fully unwound. This
    /// can happen for one of two reasons:
    /// - The `ForcedUnwind` panic that is used internally was caught and not
    ///   rethrown.
    /// - This crate was compiled without the `unwind` feature.
    ///
    /// A different panic raised while dropping the coroutine's objects is
    /// propagated to the caller.
    pub fn force_unwind(&mut self) {
        if self.state == State::Suspended {
            self.force_unwind_slow();
        }
    }

    /// Slow path of `force_unwind` when the coroutine is known to be
    /// suspended.
    #[cold]
    fn force_unwind_slow(&mut self) {
        #[cfg(feature = "unwind")]
        {
            let stack_ptr = match self.snapshot.stack_pointer() {
                Some(sp) => sp,
                None => return,
            };
            let forced_unwind = unwind::ForcedUnwind(stack_ptr);
            self.state = State::Poisoned;
            self.last = None;

            match unsafe { self.resume_inner(Err(forced_unwind)) } {
                Resumed::Yield(_) | Resumed::Return(Ok(_)) => {
                    Error::Misuse("the ForcedUnwind panic was caught and not rethrown").fatal()
                }
                Resumed::Return(Err(e)) => {
                    if unwind::ForcedUnwind::matches(&*e, stack_ptr) {
                        log::debug!("unwound coroutine at {:#x}", stack_ptr.get());
                        return;
                    }
                    std::panic::resume_unwind(e);
                }
            }
        }

        #[cfg(not(feature = "unwind"))]
        Error::Misuse("can't unwind a suspended coroutine without the \"unwind\" feature").fatal();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns whether [`start`](Coroutine::start) has been called since the
    /// coroutine was last made.
    pub fn started(&self) -> bool {
        matches!(
            self.state,
            State::Suspended | State::Finished | State::Poisoned
        )
    }

    /// Returns whether the coroutine can no longer be resumed, either because
    /// its procedure returned or because it was unwound.
    pub fn done(&self) -> bool {
        matches!(self.state, State::Finished | State::Poisoned)
    }

    /// Most recent value yielded or returned by the coroutine.
    pub fn last(&self) -> Option<&Output> {
        self.last.as_ref()
    }

    /// Address range of the coroutine's usable stack, from its limit up to its
    /// base. `None` once the coroutine has been destroyed.
    pub fn stack_bounds(&self) -> Option<Range<usize>> {
        self.stack
            .as_ref()
            .map(|stack| stack.limit().get()..stack.base().get())
    }
}

impl<'a, Arg, Output: Clone + 'static, A: StackAllocator> Coroutine<'a, Arg, Output, A> {
    /// Resumes the coroutine until its procedure yields or returns.
    ///
    /// Returns the value produced together with whether the coroutine is still
    /// running. A procedure's return counts as one last yield: the return
    /// value is first reported with `true`, and every call after that reports
    /// it again with `false`. This makes `next` safe to call in a loop that
    /// only checks the flag.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine has not been started, has been destroyed, or
    /// was unwound. If the procedure panics, the coroutine is poisoned and the
    /// panic is propagated to this caller.
    #[track_caller]
    pub fn next(&mut self) -> (Output, bool) {
        match self.state {
            State::Suspended => {}
            State::Finished => match &self.last {
                Some(val) => return (val.clone(), false),
                None => unreachable!("finished coroutine without a final value"),
            },
            State::Made => Error::Misuse("next called before start").fatal(),
            State::Poisoned => Error::Misuse("next called on an unwound coroutine").fatal(),
            State::Destroyed => Error::Misuse("next called on a destroyed coroutine").fatal(),
        }

        match unsafe { self.resume_inner(Ok(())) } {
            Resumed::Yield(val) => {
                self.last = Some(val.clone());
                (val, true)
            }
            Resumed::Return(Ok(val)) => {
                self.state = State::Finished;
                self.last = Some(val.clone());
                (val, true)
            }
            Resumed::Return(Err(e)) => {
                self.state = State::Poisoned;
                self.last = None;
                unwind::maybe_resume_unwind(Err(e))
            }
        }
    }

    /// Returns an iterator over the values produced by the coroutine, ending
    /// after its return value.
    ///
    /// The iterator is empty unless the coroutine has been started and is
    /// still running.
    pub fn iter(&mut self) -> Iter<'_, 'a, Arg, Output, A> {
        Iter { coroutine: self }
    }
}

impl<Arg, Output: 'static, A: StackAllocator> Drop for Coroutine<'_, Arg, Output, A> {
    fn drop(&mut self) {
        // Release the stack even if unwinding it panics.
        let mut this = scopeguard::guard(self, |this| this.destroy());
        this.force_unwind();
    }
}

impl<Arg, Output: 'static, A: StackAllocator> fmt::Debug for Coroutine<'_, Arg, Output, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("state", &self.state)
            .field("snapshot", &self.snapshot)
            .field("stack_bounds", &self.stack_bounds())
            .finish_non_exhaustive()
    }
}

/// Iterator over the values produced by a [`Coroutine`], created by
/// [`Coroutine::iter`].
pub struct Iter<'c, 'a, Arg, Output: 'static, A: StackAllocator> {
    coroutine: &'c mut Coroutine<'a, Arg, Output, A>,
}

impl<Arg, Output: Clone + 'static, A: StackAllocator> Iterator for Iter<'_, '_, Arg, Output, A> {
    type Item = Output;

    fn next(&mut self) -> Option<Output> {
        if self.coroutine.state != State::Suspended {
            return None;
        }
        Some(self.coroutine.next().0)
    }
}

/// Aborts if the coroutine has written past the end of its stack.
fn check_intact<S: Stack>(stack: &S) {
    if !stack.intact() {
        log::error!(
            "coroutine stack at {:#x} overflowed its limit, aborting",
            stack.base().get()
        );
        std::process::abort();
    }
}

/// `Yielder` is an interface provided to a coroutine which allows it to suspend
/// itself and hand values out to its resumer.
///
/// A `Yielder` can only be used by reference and cannot be moved to another
/// thread.
#[repr(transparent)]
pub struct Yielder<Output> {
    // Internally the Yielder is just the parent link on the stack which is
    // updated every time next() is called.
    link: Cell<StackPointer>,
    marker: PhantomData<fn(Output)>,
}

impl<Output> Yielder<Output> {
    /// Suspends the execution of a currently running coroutine.
    ///
    /// This function will switch control back to the caller of
    /// [`Coroutine::next`], which receives `val`. It returns once
    /// [`Coroutine::next`] is called again.
    ///
    /// # Panics
    ///
    /// Panics if this yielder's coroutine is not the innermost one running on
    /// this thread, which happens when an outer coroutine's yielder is used
    /// from inside a nested coroutine.
    #[track_caller]
    pub fn suspend(&self, val: Output) {
        if !locator::is_innermost(&self.link) {
            Error::Misuse("yield through a coroutine that is not the innermost one running")
                .fatal();
        }
        unsafe {
            let mut val = ManuallyDrop::new(val);
            let result = arch::switch_yield(util::encode_val(&mut val), self.link.as_ptr());
            unwind::maybe_force_unwind(util::decode_val(result))
        }
    }
}
