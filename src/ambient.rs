//! Per-thread ambient environment.
//!
//! Code often relies on implicit context, such as a diagnostic label or a
//! shared service handle, that is looked up from the current thread rather
//! than passed explicitly. A coroutine can be resumed by a different caller
//! than the one that started it. Without help it would then observe whatever
//! environment that resumer happens to have installed.
//!
//! [`Coroutine::start`](crate::Coroutine::start) captures the [`Ambient`] that
//! is current at that point and the coroutine body first runs under it. From
//! then on the coroutine keeps its own environment: whatever it has installed
//! when it suspends is installed again when it is resumed. The resumer's own
//! environment is put back as soon as control returns to it.

use core::any::Any;
use core::cell::RefCell;
use core::fmt;
use std::rc::Rc;

thread_local! {
    static CURRENT: RefCell<Ambient> = RefCell::new(Ambient::default());
}

/// Implicit environment associated with a thread or a coroutine.
///
/// Cloning is cheap: the contents are reference-counted.
#[derive(Clone, Default)]
pub struct Ambient {
    label: Option<Rc<str>>,
    value: Option<Rc<dyn Any>>,
}

impl Ambient {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this environment with the given diagnostic label.
    pub fn with_label(mut self, label: impl Into<Rc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Returns a copy of this environment carrying `value`.
    pub fn with_value<T: Any>(mut self, value: T) -> Self {
        self.value = Some(Rc::new(value));
        self
    }

    /// Diagnostic label of this environment, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Value carried by this environment, if there is one of type `T`.
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.as_deref()?.downcast_ref()
    }
}

impl fmt::Debug for Ambient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ambient")
            .field("label", &self.label)
            .field("value", &self.value.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Returns the environment currently installed on this thread.
pub fn current() -> Ambient {
    CURRENT.with(|c| c.borrow().clone())
}

/// Installs `ambient` on this thread and returns the one it replaces.
pub fn replace(ambient: Ambient) -> Ambient {
    CURRENT.with(|c| c.replace(ambient))
}

/// Runs `f` with `ambient` installed, restoring the previous environment
/// afterwards even if `f` panics.
pub fn scope<R>(ambient: Ambient, f: impl FnOnce() -> R) -> R {
    let previous = replace(ambient);
    let _restore = scopeguard::guard(previous, |previous| {
        replace(previous);
    });
    f()
}
