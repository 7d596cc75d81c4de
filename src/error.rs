// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors reported by the thread pool and its collectives.

use std::io;

/// Error returned by thread pool operations and collectives.
///
/// Precondition violations are detected before any worker enters the spinning
/// protocol, so that a bad call fails instead of deadlocking the pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An orchestrator-only operation was called from a pool worker.
    #[error("{operation} must be called from the orchestrating thread, not from a pool worker")]
    NotProcess {
        /// Name of the rejected operation.
        operation: &'static str,
    },
    /// The requested pool is larger than the fan-in encoding supports.
    #[error("requested {requested} threads, but a pool holds at most {max} threads")]
    TooManyThreads {
        /// Number of threads requested.
        requested: usize,
        /// Maximum supported number of threads.
        max: usize,
    },
    /// The requested threads don't fit in the requested NUMA layout.
    #[error(
        "{threads} threads don't fit in {numa_count} NUMA domain(s) of {cores_per_numa} core(s)"
    )]
    TopologyMismatch {
        /// Number of threads requested.
        threads: usize,
        /// Number of NUMA domains requested.
        numa_count: usize,
        /// Number of cores per NUMA domain requested.
        cores_per_numa: usize,
    },
    /// Querying the available parallelism failed.
    #[error("failed to query the available parallelism")]
    AvailableParallelism(#[source] io::Error),
    /// Spawning a worker thread failed.
    #[error("failed to spawn worker thread #{rank}")]
    Spawn {
        /// Rank of the worker that couldn't be spawned.
        rank: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Pinning a worker thread to its CPU failed, with
    /// [`CpuPinningPolicy::Always`](crate::CpuPinningPolicy::Always).
    #[error("failed to pin worker thread #{rank} to CPU #{rank}")]
    CpuPinning {
        /// Rank of the worker that couldn't be pinned.
        rank: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The operation requires a quiescent pool, but a dispatched task hasn't
    /// been fenced yet.
    #[error("cannot {operation} while a dispatched task is in flight")]
    InFlight {
        /// Name of the rejected operation.
        operation: &'static str,
    },
    /// Work was dispatched to a sleeping pool.
    #[error("the thread pool is asleep, call wake() first")]
    Asleep,
    /// The reduce scratch zone is too small for the collective's values.
    #[error("collective needs {required} bytes of reduce scratch, but only {available} are allocated")]
    ScratchTooSmall {
        /// Number of bytes that the collective needs.
        required: usize,
        /// Number of bytes currently allocated.
        available: usize,
    },
    /// A value passed to a collective doesn't have the reducer's value count.
    #[error("reducer expects {expected} value(s) per thread, got {actual}")]
    ValueCount {
        /// Value count declared by the reducer.
        expected: usize,
        /// Length of the value passed by the caller.
        actual: usize,
    },
    /// The value type is over-aligned for the scratch memory.
    #[error("scratch memory is {max}-byte aligned, values need {align}-byte alignment")]
    Misaligned {
        /// Alignment of the value type.
        align: usize,
        /// Alignment of the scratch memory.
        max: usize,
    },
    /// Some worker threads panicked while running the last dispatched task.
    #[error("{count} worker thread(s) panicked")]
    WorkerPanicked {
        /// Number of workers that panicked.
        count: usize,
    },
}
