use criterion::measurement::Measurement;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use jumpstack::stack::HeapAllocator;
use jumpstack::{locator, Coroutine};

fn coroutine_switch<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    let mut counter = Coroutine::new(|yielder, mut n: usize| loop {
        n = n.wrapping_add(1);
        yielder.suspend(n);
    })
    .unwrap();
    counter.start(0);

    c.bench_function(name, |b| b.iter(|| black_box(counter.next())));

    // Abandon the coroutine so that this benchmark works even when the unwind
    // feature is disabled.
    counter.destroy();
}

fn ambient_switch<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    let mut counter = Coroutine::<usize, usize>::new(|_, mut n| loop {
        n = n.wrapping_add(1);
        locator::suspend(n);
    })
    .unwrap();
    counter.start(0);

    c.bench_function(name, |b| b.iter(|| black_box(counter.next())));

    counter.destroy();
}

fn coroutine_lifecycle<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    // The identity procedure stays far below 16 KiB of stack.
    let alloc = unsafe { HeapAllocator::new() };
    c.bench_function(name, |b| {
        b.iter(|| {
            let mut identity =
                Coroutine::with_allocator(alloc, 16 * 1024, |_, input: usize| input).unwrap();
            identity.start(black_box(0));
            identity.next()
        })
    });
}

fn coroutine_switch_time(c: &mut Criterion) {
    coroutine_switch("coroutine_switch_time", c);
}
fn ambient_switch_time(c: &mut Criterion) {
    ambient_switch("ambient_switch_time", c);
}
fn coroutine_lifecycle_time(c: &mut Criterion) {
    coroutine_lifecycle("coroutine_lifecycle_time", c);
}

criterion_group!(
    name = time;
    config = Criterion::default();
    targets = coroutine_switch_time, ambient_switch_time, coroutine_lifecycle_time
);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use criterion_cycles_per_byte::CyclesPerByte;

        fn coroutine_switch_cycles(c: &mut Criterion<CyclesPerByte>) {
            coroutine_switch("coroutine_switch_cycles", c);
        }
        fn ambient_switch_cycles(c: &mut Criterion<CyclesPerByte>) {
            ambient_switch("ambient_switch_cycles", c);
        }
        fn coroutine_lifecycle_cycles(c: &mut Criterion<CyclesPerByte>) {
            coroutine_lifecycle("coroutine_lifecycle_cycles", c);
        }

        criterion_group!(
            name = cycles;
            config = Criterion::default().with_measurement(CyclesPerByte);
            targets = coroutine_switch_cycles, ambient_switch_cycles, coroutine_lifecycle_cycles
        );

        criterion_main!(cycles, time);
    } else {
        criterion_main!(time);
    }
}
