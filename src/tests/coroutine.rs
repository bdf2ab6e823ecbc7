use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use proptest::prelude::*;

use crate::ambient::{self, Ambient};
use crate::stack::{current_stack_pointer, HeapAllocator};
use crate::{Coroutine, State, Yielder};

struct SetOnDrop(Rc<Cell<bool>>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[test]
fn smoke() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let mut coroutine = Coroutine::<(), ()>::new(move |_, ()| {
        hit2.set(true);
    })
    .unwrap();
    assert_eq!(coroutine.state(), State::Made);
    assert!(!coroutine.started());
    assert!(!coroutine.done());

    // Starting only bootstraps the coroutine, no user code runs.
    coroutine.start(());
    assert!(!hit.get());
    assert!(coroutine.started());
    assert!(!coroutine.done());

    assert_eq!(coroutine.next(), ((), true));
    assert!(hit.get());
    assert!(coroutine.started());
    assert!(coroutine.done());
    assert_eq!(coroutine.next(), ((), false));
}

#[test]
fn half_open_range() {
    let mut range = Coroutine::new(|yielder, (start, end): (i32, i32)| {
        for i in start..end - 1 {
            yielder.suspend(i);
        }
        end - 1
    })
    .unwrap();
    range.start((5, 11));
    for i in 5..10 {
        assert_eq!(range.next(), (i, true));
    }
    assert_eq!(range.next(), (10, true));
    for _ in 0..3 {
        assert_eq!(range.next(), (10, false));
    }
    assert_eq!(range.state(), State::Finished);
    assert_eq!(range.last(), Some(&10));
}

proptest! {
    #[test]
    fn round_trip(values in proptest::collection::vec(any::<u64>(), 0..32), last in any::<u64>(), extra in 1usize..4) {
        let expected = values.clone();
        let mut coroutine = Coroutine::new(move |yielder, ()| {
            for v in values {
                yielder.suspend(v);
            }
            last
        })
        .unwrap();
        coroutine.start(());
        for v in expected {
            prop_assert_eq!(coroutine.next(), (v, true));
        }
        prop_assert_eq!(coroutine.next(), (last, true));
        for _ in 0..extra {
            prop_assert_eq!(coroutine.next(), (last, false));
        }
    }
}

#[test]
fn argument_fidelity() {
    let mut scalar = Coroutine::new(|_, x: i64| x).unwrap();
    scalar.start(-7);
    assert_eq!(scalar.next(), (-7, true));

    #[derive(Clone, Debug, PartialEq)]
    struct Order {
        id: u32,
        items: Vec<String>,
        weight: f64,
    }
    let order = Order {
        id: 42,
        items: vec!["bolt".to_string(), "nut".to_string()],
        weight: 1.25,
    };
    let mut structured = Coroutine::new(|_, order: Order| order).unwrap();
    structured.start(order.clone());
    assert_eq!(structured.next(), (order, true));

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Unit;
    let mut zst = Coroutine::new(|_, unit: Unit| unit).unwrap();
    zst.start(Unit);
    assert_eq!(zst.next(), (Unit, true));
}

#[test]
fn stateful() {
    #[repr(align(128))]
    struct Aligned(u8);
    let state = [41, 42, 43, 44, 45];
    let aligned = Aligned(100);
    let mut coroutine = Coroutine::new(move |y, ()| {
        assert_eq!(&aligned as *const _ as usize % 128, 0);
        for i in state {
            y.suspend(i);
        }
        aligned.0
    })
    .unwrap();
    coroutine.start(());
    for i in state {
        assert_eq!(coroutine.next(), (i, true));
    }
    assert_eq!(coroutine.next(), (100, true));
}

#[test]
fn locals_survive_suspension() {
    let mut coroutine = Coroutine::new(|yielder, seed: u64| {
        let local = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ 0xdead_beef;
        let buffer = [local; 64];
        let here = &local as *const u64 as usize;
        yielder.suspend((local, here));
        assert_eq!(buffer.iter().fold(0, |acc, &b| acc ^ b), 0);
        yielder.suspend((local, &local as *const u64 as usize));
        (buffer[63], here)
    })
    .unwrap();
    coroutine.start(3);
    let bounds = coroutine.stack_bounds().unwrap();

    let (first, _) = coroutine.next();
    assert!(bounds.contains(&first.1));
    assert_eq!(coroutine.next(), (first, true));
    assert_eq!(coroutine.next(), (first, true));
}

#[test]
fn runs_on_private_stack() {
    let mut coroutine = Coroutine::new(|y, ()| {
        y.suspend(current_stack_pointer());
        current_stack_pointer()
    })
    .unwrap();
    coroutine.start(());
    let bounds = coroutine.stack_bounds().unwrap();
    assert!(!bounds.contains(&current_stack_pointer()));
    assert!(bounds.contains(&coroutine.next().0));
    assert!(bounds.contains(&coroutine.next().0));
}

// Use ~500KB of stack.
#[test]
fn stack_growth() {
    let mut coroutine = Coroutine::new(|_, ()| {
        fn recurse(i: u32, p: &mut [u8; 10000]) -> u32 {
            unsafe {
                // Ensure the stack allocation isn't optimized away.
                ptr::read_volatile(&p);
            }
            if i > 0 {
                recurse(i - 1, &mut [0; 10000]) + 1
            } else {
                0
            }
        }

        recurse(50, &mut [0; 10000])
    })
    .unwrap();
    coroutine.start(());
    assert_eq!(coroutine.next(), (50, true));
}

#[test]
fn interleaved_coroutines_are_isolated() {
    let mut a = Coroutine::new(|y, n: u32| {
        for i in 0..n {
            y.suspend(100 + i);
        }
        1
    })
    .unwrap();
    let mut b = Coroutine::new(|y, n: u32| {
        for i in 0..n {
            y.suspend(200 + i);
        }
        2
    })
    .unwrap();
    a.start(3);
    b.start(2);

    assert_eq!(a.next(), (100, true));
    assert_eq!(b.next(), (200, true));
    assert_eq!(a.next(), (101, true));
    assert_eq!(b.next(), (201, true));
    assert_eq!(b.next(), (2, true));
    assert_eq!(a.next(), (102, true));
    assert_eq!(b.next(), (2, false));
    assert_eq!(a.next(), (1, true));
    assert_eq!(a.next(), (1, false));
}

#[test]
fn iter_collects_sequence() {
    let mut coroutine = Coroutine::new(|y, n: usize| {
        for i in 0..n {
            y.suspend(i * i);
        }
        n
    })
    .unwrap();
    assert_eq!(coroutine.iter().count(), 0);

    coroutine.start(4);
    let seen: Vec<_> = coroutine.iter().collect();
    assert_eq!(seen, [0, 1, 4, 9, 4]);
    assert_eq!(coroutine.iter().next(), None);
    assert_eq!(coroutine.next(), (4, false));
}

#[test]
fn procedure_runs_under_launcher_ambient() {
    let mut coroutine = Coroutine::new(|y, ()| {
        let label = || ambient::current().label().map(str::to_owned);
        y.suspend(label());
        y.suspend(label());
        label()
    })
    .unwrap();
    ambient::scope(Ambient::new().with_label("launcher"), || coroutine.start(()));

    let launcher = Some("launcher".to_string());
    assert_eq!(coroutine.next(), (launcher.clone(), true));
    ambient::scope(Ambient::new().with_label("resumer"), || {
        assert_eq!(coroutine.next(), (launcher.clone(), true));
        assert_eq!(ambient::current().label(), Some("resumer"));
    });
    assert_eq!(coroutine.next(), (launcher, true));
    assert_eq!(ambient::current().label(), None);
}

#[test]
fn procedure_ambient_survives_suspension() {
    let mut coroutine = Coroutine::new(|y, ()| {
        let label = || ambient::current().label().map(str::to_owned);
        let inside = ambient::scope(Ambient::new().with_label("inner"), || {
            y.suspend(label());
            label()
        });
        y.suspend(inside);
        label()
    })
    .unwrap();
    ambient::scope(Ambient::new().with_label("launcher"), || coroutine.start(()));

    let inner = Some("inner".to_string());
    assert_eq!(coroutine.next(), (inner.clone(), true));
    assert_eq!(ambient::current().label(), None);
    ambient::scope(Ambient::new().with_label("resumer"), || {
        assert_eq!(coroutine.next(), (inner, true));
        assert_eq!(ambient::current().label(), Some("resumer"));
    });
    // Leaving the scope inside the procedure restores the launcher's.
    assert_eq!(coroutine.next(), (Some("launcher".to_string()), true));
    assert_eq!(ambient::current().label(), None);
}

#[cfg(feature = "unwind")]
#[test]
#[should_panic(expected = "yield through a coroutine that is not the innermost one running")]
fn yield_through_outer_yielder() {
    let mut outer = Coroutine::new(|outer_yielder: &Yielder<u32>, ()| {
        let mut inner = Coroutine::new(|_, ()| {
            outer_yielder.suspend(1);
            2u32
        })
        .unwrap();
        inner.start(());
        inner.next().0
    })
    .unwrap();
    outer.start(());
    outer.next();
}

#[test]
#[should_panic(expected = "start called on a coroutine that was already started")]
fn start_twice() {
    let mut coroutine = Coroutine::new(|_, x: u8| x).unwrap();
    coroutine.start(1);
    coroutine.start(2);
}

#[test]
#[should_panic(expected = "next called before start")]
fn next_before_start() {
    let mut coroutine = Coroutine::new(|_, x: u8| x).unwrap();
    coroutine.next();
}

#[test]
#[should_panic(expected = "next called on a destroyed coroutine")]
fn next_after_destroy() {
    let mut coroutine = Coroutine::new(|_, x: u8| x).unwrap();
    coroutine.start(1);
    coroutine.destroy();
    coroutine.next();
}

#[test]
fn small_heap_stack() {
    // Shallow procedure, well within the 16 KiB it is given.
    let alloc = unsafe { HeapAllocator::new() };
    let mut coroutine = Coroutine::with_allocator(alloc, 16 * 1024, |y, n: u32| {
        y.suspend(n);
        n * 2
    })
    .unwrap();
    coroutine.start(21);
    assert_eq!(coroutine.next(), (21, true));
    assert_eq!(coroutine.next(), (42, true));
}

#[test]
fn destroy_does_not_unwind() {
    let dropped = Rc::new(Cell::new(false));
    let guard = SetOnDrop(dropped.clone());
    let mut coroutine = Coroutine::new(move |y, ()| {
        let _guard = guard;
        y.suspend(1);
        2
    })
    .unwrap();
    coroutine.start(());
    assert_eq!(coroutine.next(), (1, true));

    coroutine.destroy();
    assert!(!dropped.get());
    assert_eq!(coroutine.state(), State::Destroyed);
    assert_eq!(coroutine.stack_bounds(), None);

    // Dropping a destroyed handle has nothing left to unwind.
    drop(coroutine);
    assert!(!dropped.get());
}

#[test]
fn destroy_never_started() {
    let dropped = Rc::new(Cell::new(false));
    let guard = SetOnDrop(dropped.clone());
    let mut coroutine = Coroutine::new(move |_, ()| drop(guard)).unwrap();
    coroutine.destroy();

    // The procedure never reached the private stack, so it is simply dropped.
    assert!(dropped.get());
    assert_eq!(coroutine.state(), State::Destroyed);
    coroutine.destroy();
}

#[test]
#[should_panic(expected = "remake called on a coroutine that was not destroyed")]
fn remake_requires_destroy() {
    let mut coroutine = Coroutine::new(|_, x: u8| x).unwrap();
    let _ = coroutine.remake(|_, x: u8| x + 1);
}

#[cfg(feature = "unwind")]
#[test]
#[should_panic(expected = "foobar")]
fn panics_propagated() {
    let a = Rc::new(Cell::new(false));
    let b = SetOnDrop(a.clone());
    let mut coroutine = Coroutine::<(), ()>::new(move |_, ()| {
        let _b = &b;
        panic!("foobar");
    })
    .unwrap();
    coroutine.start(());
    let result = panic::catch_unwind(AssertUnwindSafe(|| coroutine.next()));
    assert!(result.is_err());
    assert!(a.get());
    assert_eq!(coroutine.state(), State::Poisoned);
    assert!(coroutine.done());
    panic::resume_unwind(result.unwrap_err());
}

#[cfg(feature = "unwind")]
#[test]
#[should_panic(expected = "next called on an unwound coroutine")]
fn next_after_panic() {
    let mut coroutine = Coroutine::<(), ()>::new(|_, ()| panic!("foobar")).unwrap();
    coroutine.start(());
    let _ = panic::catch_unwind(AssertUnwindSafe(|| coroutine.next()));
    coroutine.next();
}

#[cfg(feature = "unwind")]
#[test]
#[should_panic = "foobar"]
fn panic_on_other_thread() {
    // The thread stack is created after the main test stack, which covers the
    // coroutine stack sitting on either side of the resumer's stack.
    let result = std::thread::spawn(move || {
        let mut coroutine = Coroutine::<(), ()>::new(move |_, ()| {
            panic!("foobar");
        })
        .unwrap();
        coroutine.start(());
        coroutine.next();
        unreachable!();
    })
    .join();
    panic::resume_unwind(result.unwrap_err());
}

#[test]
fn force_unwind() {
    struct SetOnDrop<'a>(&'a mut bool);
    impl<'a> Drop for SetOnDrop<'a> {
        fn drop(&mut self) {
            *self.0 = true;
        }
    }

    // Never started: the procedure is dropped along with the handle.
    let mut a = false;
    let mut b = false;
    let a_drop = SetOnDrop(&mut a);
    let b_drop = SetOnDrop(&mut b);
    let mut coroutine = Coroutine::<(), ()>::new(move |y, ()| {
        drop(a_drop);
        y.suspend(());
        drop(b_drop);
    })
    .unwrap();
    coroutine.force_unwind();
    assert!(!coroutine.started());
    assert!(!coroutine.done());
    drop(coroutine);
    assert!(a);
    assert!(b);

    #[cfg(feature = "unwind")]
    {
        // Started but never resumed: the procedure is parked on its own stack.
        let mut a = false;
        let mut b = false;
        let a_drop = SetOnDrop(&mut a);
        let b_drop = SetOnDrop(&mut b);
        let mut coroutine = Coroutine::<(), ()>::new(move |y, ()| {
            drop(a_drop);
            y.suspend(());
            drop(b_drop);
        })
        .unwrap();
        coroutine.start(());
        coroutine.force_unwind();
        assert!(coroutine.started());
        assert!(coroutine.done());
        drop(coroutine);
        assert!(a);
        assert!(b);

        // Suspended mid-procedure.
        let mut a = false;
        let mut b = false;
        let a_drop = SetOnDrop(&mut a);
        let b_drop = SetOnDrop(&mut b);
        let mut coroutine = Coroutine::<(), ()>::new(move |y, ()| {
            drop(a_drop);
            y.suspend(());
            drop(b_drop);
        })
        .unwrap();
        coroutine.start(());
        coroutine.next();
        assert!(coroutine.started());
        assert!(!coroutine.done());
        coroutine.force_unwind();
        assert!(coroutine.started());
        assert!(coroutine.done());
        assert_eq!(coroutine.state(), State::Poisoned);
        drop(coroutine);
        assert!(a);
        assert!(b);
    }

    let mut a = false;
    let mut b = false;
    let a_drop = SetOnDrop(&mut a);
    let b_drop = SetOnDrop(&mut b);
    let mut coroutine = Coroutine::<(), ()>::new(move |y, ()| {
        drop(a_drop);
        y.suspend(());
        drop(b_drop);
    })
    .unwrap();
    coroutine.start(());
    coroutine.next();
    coroutine.next();
    assert!(coroutine.started());
    assert!(coroutine.done());
    coroutine.force_unwind();
    assert!(coroutine.started());
    assert!(coroutine.done());
    drop(coroutine);
    assert!(a);
    assert!(b);
}

#[cfg(feature = "unwind")]
#[test]
fn drop_unwinds_suspended() {
    let dropped = Rc::new(Cell::new(false));
    let guard = SetOnDrop(dropped.clone());
    let mut coroutine = Coroutine::new(move |y, ()| {
        let _guard = guard;
        loop {
            y.suspend(0u8);
        }
    })
    .unwrap();
    coroutine.start(());
    coroutine.next();
    coroutine.next();
    assert!(!dropped.get());
    drop(coroutine);
    assert!(dropped.get());
}

// Linked backtraces continue from the coroutine into whoever resumed it.
#[test]
fn backtrace_traces_to_host() {
    #[inline(never)] // try to get this to show up in backtraces
    fn look_for_me() {
        run_test();
    }
    fn assert_contains_host() {
        let trace = backtrace::Backtrace::new();
        println!("{:?}", trace);
        assert!(trace
            .frames()
            .iter()
            .flat_map(|f| f.symbols())
            .filter_map(|s| Some(s.name()?.to_string()))
            .any(|s| s.contains("look_for_me")));
    }

    fn run_test() {
        assert_contains_host();
        let mut coroutine = Coroutine::<(), ()>::new(move |y, ()| {
            assert_contains_host();
            y.suspend(());
            assert_contains_host();
        })
        .unwrap();
        coroutine.start(());
        assert_eq!(coroutine.next(), ((), true));
        assert_eq!(coroutine.next(), ((), true));
    }

    look_for_me();
}
