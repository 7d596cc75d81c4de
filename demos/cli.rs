// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run collectives on a thread pool.

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use spinfan::{
    CpuPinningPolicy, NumaLayout, Reducer, ThreadCount, ThreadPool, ThreadPoolBuilder, Worker,
};
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut thread_pool = ThreadPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        numa: match (cli.numa_count, cli.cores_per_numa) {
            (Some(numa_count), Some(cores_per_numa)) => NumaLayout::Domains {
                numa_count,
                cores_per_numa,
            },
            _ => NumaLayout::Flat,
        },
        asynchronous: !cli.synchronous,
        cpu_pinning: if cli.pin {
            CpuPinningPolicy::Always
        } else {
            CpuPinningPolicy::IfSupported
        },
    }
    .build()?;

    let value_size = cli.value_size.get();
    thread_pool.resize_scratch(2 * value_size * std::mem::size_of::<u64>(), 0)?;
    thread_pool.print_configuration(&mut std::io::stdout(), cli.detail)?;

    let num_threads = thread_pool.num_threads().get();
    let inputs = random_inputs(num_threads, value_size);
    let reducer = VectorSum { len: value_size };

    let start = Instant::now();
    let outputs = match cli.scenario {
        Scenario::Barrier => {
            run(&mut thread_pool, cli.rounds, true, |worker| {
                worker.fan_in();
                Vec::new()
            })?;
            None
        }
        Scenario::AllReduce => {
            let outputs = run(&mut thread_pool, cli.rounds, false, |worker| {
                let total = worker.all_reduce(inputs[worker.rank()][0]).unwrap();
                vec![total]
            })?;
            Some(outputs)
        }
        Scenario::FanInReduce => {
            run(&mut thread_pool, cli.rounds, true, |worker| {
                let value = &inputs[worker.rank()];
                worker.fan_in_reduce(&reducer, value).unwrap();
                Vec::new()
            })?;
            let root = thread_pool.root_reduce_value::<u64>(value_size)?;
            println!("root value = {:?}", summarize(&root));
            None
        }
        Scenario::ScanLarge => Some(run(&mut thread_pool, cli.rounds, false, |worker| {
            let value = &inputs[worker.rank()];
            worker.scan_large(&reducer, value).unwrap().exclusive
        })?),
        Scenario::ScanSmall => Some(run(&mut thread_pool, cli.rounds, false, |worker| {
            let value = &inputs[worker.rank()];
            worker.scan_small(&reducer, value).unwrap().exclusive
        })?),
    };
    let elapsed = start.elapsed();

    if let Some(outputs) = outputs {
        for (rank, output) in outputs.iter().enumerate() {
            println!("thread #{rank}: {:?}", summarize(output));
        }
    }
    println!(
        "{} round(s) of {:?} in {elapsed:?} ({:?} per round)",
        cli.rounds,
        cli.scenario,
        elapsed / cli.rounds.max(1)
    );

    thread_pool.finalize()?;
    Ok(())
}

/// Runs the given collective `rounds` times, and returns the output of each
/// thread in the last round.
///
/// Collectives that must end a task get one dispatch per round, the others run
/// all the rounds within a single task.
fn run(
    thread_pool: &mut ThreadPool,
    rounds: u32,
    ends_task: bool,
    collective: impl Fn(Worker<'_>) -> Vec<u64> + Sync,
) -> Result<Vec<Vec<u64>>, spinfan::Error> {
    let (dispatches, rounds_per_task) = if ends_task { (rounds, 1) } else { (1, rounds) };
    let num_threads = thread_pool.num_threads().get();
    let outputs: Vec<Mutex<Vec<u64>>> = (0..num_threads).map(|_| Mutex::new(Vec::new())).collect();
    for _ in 0..dispatches {
        thread_pool.execute(|worker| {
            let mut output = Vec::new();
            for _ in 0..rounds_per_task {
                output = black_box(collective(worker));
            }
            *outputs[worker.rank()].lock().unwrap() = output;
        })?;
    }
    Ok(outputs
        .into_iter()
        .map(|output| output.into_inner().unwrap())
        .collect())
}

/// Creates `num_threads` random vectors of `value_size` items, fixed by a
/// constant seed for reproducibility.
fn random_inputs(num_threads: usize, value_size: usize) -> Vec<Vec<u64>> {
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    (0..num_threads)
        .map(|_| (0..value_size).map(|_| rng.random_range(0..1000)).collect())
        .collect()
}

fn summarize(values: &[u64]) -> &[u64] {
    &values[..values.len().min(4)]
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

/// CLI tool to run collectives on a thread pool.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Number of NUMA domains to assign the threads to.
    #[arg(long, requires = "cores_per_numa")]
    numa_count: Option<NonZeroUsize>,

    /// Number of threads per NUMA domain.
    #[arg(long, requires = "numa_count")]
    cores_per_numa: Option<NonZeroUsize>,

    /// Whether the main thread acts as the root worker.
    #[arg(long, default_value_t = false)]
    synchronous: bool,

    /// Whether to fail if worker threads can't be pinned to CPUs.
    #[arg(long, default_value_t = false)]
    pin: bool,

    /// Collective to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of `u64` items contributed by each thread.
    #[arg(long, default_value = "1")]
    value_size: NonZeroUsize,

    /// Number of times to run the collective.
    #[arg(long, default_value_t = 1000)]
    rounds: u32,

    /// Whether to print the configuration of each thread.
    #[arg(long, default_value_t = false)]
    detail: bool,
}

/// Collective to run.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    /// Barrier on the root thread.
    Barrier,
    /// Sum of one scalar per thread, on all threads.
    AllReduce,
    /// Combination of one vector per thread, on the root thread.
    FanInReduce,
    /// Prefix sums through the fan-in tree.
    ScanLarge,
    /// Prefix sums computed by the root thread.
    ScanSmall,
}
