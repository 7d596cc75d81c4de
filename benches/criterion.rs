// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use spinfan::{
    CpuPinningPolicy, NumaLayout, Reducer, ThreadCount, ThreadPool, ThreadPoolBuilder,
};
use std::hint::black_box;

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const VALUE_SIZES: &[usize] = &[1, 16, 256];

fn fan_in(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_in");
    for &num_threads in NUM_THREADS {
        let mut pool = make_pool(num_threads, 1);
        group.bench_function(BenchmarkId::new("spinfan", num_threads), |bencher| {
            bencher.iter(|| pool.execute(|worker| worker.fan_in()).unwrap())
        });
    }
    group.finish();
}

fn all_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("all_reduce");
    for &num_threads in NUM_THREADS {
        let mut pool = make_pool(num_threads, 1);
        group.bench_function(BenchmarkId::new("spinfan", num_threads), |bencher| {
            bencher.iter(|| {
                pool.execute(|worker| {
                    black_box(worker.all_reduce(worker.rank() as u64).unwrap());
                })
                .unwrap()
            })
        });
    }
    group.finish();
}

fn fan_in_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_in_reduce");
    for &value_size in VALUE_SIZES {
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("serial@{num_threads}"), value_size),
                &value_size,
                |bencher, &value_size| serial::reduce(bencher, num_threads, value_size),
            );
            let mut pool = make_pool(num_threads, value_size);
            let inputs = make_inputs(num_threads, value_size);
            let reducer = VectorSum { len: value_size };
            group.bench_function(
                BenchmarkId::new(format!("spinfan@{num_threads}"), value_size),
                |bencher| {
                    bencher.iter(|| {
                        pool.execute(|worker| {
                            let value = &inputs[worker.rank()];
                            black_box(worker.fan_in_reduce(&reducer, value).unwrap());
                        })
                        .unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

fn scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    for &value_size in VALUE_SIZES {
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("serial@{num_threads}"), value_size),
                &value_size,
                |bencher, &value_size| serial::scan(bencher, num_threads, value_size),
            );
            let mut pool = make_pool(num_threads, value_size);
            let inputs = make_inputs(num_threads, value_size);
            let reducer = VectorSum { len: value_size };
            group.bench_function(
                BenchmarkId::new(format!("large@{num_threads}"), value_size),
                |bencher| {
                    bencher.iter(|| {
                        pool.execute(|worker| {
                            let value = &inputs[worker.rank()];
                            black_box(worker.scan_large(&reducer, value).unwrap());
                        })
                        .unwrap()
                    })
                },
            );
            group.bench_function(
                BenchmarkId::new(format!("small@{num_threads}"), value_size),
                |bencher| {
                    bencher.iter(|| {
                        pool.execute(|worker| {
                            let value = &inputs[worker.rank()];
                            black_box(worker.scan_small(&reducer, value).unwrap());
                        })
                        .unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

fn make_pool(num_threads: usize, value_size: usize) -> ThreadPool {
    let mut pool = ThreadPoolBuilder {
        num_threads: ThreadCount::try_from(num_threads).unwrap(),
        numa: NumaLayout::Flat,
        asynchronous: true,
        cpu_pinning: CpuPinningPolicy::IfSupported,
    }
    .build()
    .unwrap();
    pool.resize_scratch(2 * value_size * std::mem::size_of::<u64>(), 0)
        .unwrap();
    pool
}

fn make_inputs(num_threads: usize, value_size: usize) -> Vec<Vec<u64>> {
    (0..num_threads)
        .map(|rank| (0..value_size as u64).map(|i| i + rank as u64).collect())
        .collect()
}

/// Element-wise sum of vectors.
struct VectorSum {
    len: usize,
}

impl Reducer for VectorSum {
    type Value = u64;

    fn value_count(&self) -> usize {
        self.len
    }

    fn init(&self, value: &mut [u64]) {
        value.fill(0);
    }

    fn join(&self, dst: &mut [u64], src: &[u64]) {
        for (d, s) in dst.iter_mut().zip(src) {
            *d += s;
        }
    }
}

/// Baseline benchmarks combining the same values on the current thread (without
/// any multi-threading involved).
mod serial {
    use super::make_inputs;
    use criterion::Bencher;
    use std::hint::black_box;

    pub fn reduce(bencher: &mut Bencher, num_threads: usize, value_size: usize) {
        let inputs = make_inputs(num_threads, value_size);
        bencher.iter(|| {
            let mut total = vec![0u64; value_size];
            for input in black_box(&inputs) {
                for (t, x) in total.iter_mut().zip(input) {
                    *t += x;
                }
            }
            total
        });
    }

    pub fn scan(bencher: &mut Bencher, num_threads: usize, value_size: usize) {
        let inputs = make_inputs(num_threads, value_size);
        bencher.iter(|| {
            let mut running = vec![0u64; value_size];
            let mut exclusive = Vec::with_capacity(num_threads);
            for input in black_box(&inputs) {
                exclusive.push(running.clone());
                for (r, x) in running.iter_mut().zip(input) {
                    *r += x;
                }
            }
            (exclusive, running)
        });
    }
}

criterion_group!(benches, fan_in, all_reduce, fan_in_reduce, scan);
criterion_main!(benches);
