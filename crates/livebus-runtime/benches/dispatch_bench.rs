use std::cell::Cell;
use std::hint::black_box;
use std::rc::Rc;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use livebus_core::lifecycle::{LifecycleEvent, LifecycleRegistry, State};
use livebus_core::main_context::MainContext;
use livebus_runtime::{EventChannel, Observer};

fn fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/fan_out");
    for observers in [1usize, 16, 256] {
        let channel = EventChannel::<u64>::new(Arc::new(MainContext::new()), "bench").unwrap();
        let sum = Rc::new(Cell::new(0u64));
        let handles: Vec<_> = (0..observers)
            .map(|_| {
                let sum = Rc::clone(&sum);
                let observer = Observer::new(move |v: &u64| sum.set(sum.get().wrapping_add(*v)));
                channel.observe_forever(&observer).unwrap();
                observer
            })
            .collect();

        group.throughput(Throughput::Elements(observers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(observers), &observers, |b, _| {
            let mut next = 0u64;
            b.iter(|| {
                next += 1;
                channel.post(black_box(next));
            });
        });
        black_box(sum.get());
        drop(handles);
    }
    group.finish();
}

fn lifecycle_gated(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/lifecycle");
    let channel = EventChannel::<u64>::new(Arc::new(MainContext::new()), "bench").unwrap();
    let owner = Rc::new(LifecycleRegistry::in_state(State::Resumed));
    let owners: Vec<_> = (0..64)
        .map(|_| {
            let observer = Observer::new(|v: &u64| {
                black_box(v);
            });
            channel.observe(&owner, &observer).unwrap();
            observer
        })
        .collect();

    group.bench_function("stop_start_catch_up_64", |b| {
        let mut next = 0u64;
        b.iter(|| {
            owner.handle_event(LifecycleEvent::Stop).unwrap();
            next += 1;
            channel.post(next);
            owner.handle_event(LifecycleEvent::Start).unwrap();
        });
    });
    drop(owners);
    group.finish();
}

fn reentrant_posts(c: &mut Criterion) {
    let channel = EventChannel::<u32>::new(Arc::new(MainContext::new()), "bench").unwrap();
    let observer = {
        let channel = channel.clone();
        Observer::new(move |v: &u32| {
            if *v % 1_000 != 0 {
                channel.post(*v + 1);
            }
        })
    };
    channel.observe_forever(&observer).unwrap();

    c.bench_function("dispatch/reentrant_chain_1000", |b| {
        let mut start = 1u32;
        b.iter(|| {
            channel.post(black_box(start));
            start = start.wrapping_add(1_000);
            if start == 0 {
                start = 1;
            }
        });
    });
    // Break the channel -> observer -> channel cycle.
    channel.remove_observer(&observer);
}

criterion_group!(benches, fan_out, lifecycle_gated, reentrant_posts);
criterion_main!(benches);
