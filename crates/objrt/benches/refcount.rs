// Reference counting benchmarks
//
// This benchmark suite measures:
// - Allocation and teardown
// - Retain/release pairs, single-threaded and contended
// - Weak loads
// - Autorelease pool drains

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use objrt::{AutoreleasePool, Class, Object, WeakRef, autorelease, release, retain};
use std::hint::black_box;
use std::thread;

fn bench_alloc(c: &mut Criterion) {
    let plain = Class::new_root("BenchAllocPlain").unwrap();
    let sized = Class::allocate(None, "BenchAllocSized", 64).unwrap();
    sized.add_ivar("child", "@").unwrap();
    sized.register().unwrap();

    c.bench_function("alloc_release_plain", |b| {
        b.iter(|| black_box(Object::new(&plain).unwrap()))
    });
    c.bench_function("alloc_release_sized", |b| {
        b.iter(|| black_box(Object::new(&sized).unwrap()))
    });
}

fn bench_retain_release(c: &mut Criterion) {
    let class = Class::new_root("BenchRetain").unwrap();
    let obj = Object::new(&class).unwrap();
    let ptr = obj.as_ptr();

    c.bench_function("retain_release_pair", |b| {
        b.iter(|| unsafe {
            release(black_box(retain(black_box(ptr))));
        })
    });
    c.bench_function("clone_drop", |b| b.iter(|| black_box(obj.clone())));
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_retain_release");
    let class = Class::new_root("BenchContended").unwrap();
    let obj = Object::new(&class).unwrap();
    const PAIRS: usize = 1000;

    for threads in [1usize, 2, 4, 8] {
        group.throughput(Throughput::Elements((threads * PAIRS) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                thread::scope(|scope| {
                    for _ in 0..threads {
                        scope.spawn(|| {
                            for _ in 0..PAIRS {
                                black_box(obj.clone());
                            }
                        });
                    }
                });
            })
        });
    }

    group.finish();
}

fn bench_weak(c: &mut Criterion) {
    let class = Class::new_root("BenchWeak").unwrap();
    let obj = Object::new(&class).unwrap();
    let weak = WeakRef::new(&obj);

    c.bench_function("weak_load", |b| b.iter(|| black_box(weak.load())));
    c.bench_function("weak_new_drop", |b| b.iter(|| black_box(WeakRef::new(&obj))));
}

fn bench_autorelease(c: &mut Criterion) {
    let mut group = c.benchmark_group("autorelease_drain");
    let class = Class::new_root("BenchAutorelease").unwrap();

    for count in [1usize, 16, 256] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let _pool = AutoreleasePool::new();
                for _ in 0..count {
                    black_box(autorelease(Object::new(&class).unwrap()).unwrap());
                }
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc,
    bench_retain_release,
    bench_contended,
    bench_weak,
    bench_autorelease,
);

criterion_main!(benches);
