// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size pool of spinning worker threads.

use super::scratch::ScratchLayout;
use super::state::WorkerState;
use super::topology::MAX_THREAD_COUNT;
use super::util::{SleepGate, TaskSlot};
use super::worker::{Worker, WorkerRecord};
use crate::error::Error;
use crate::macros::{log_debug, log_error, log_warn};
use bytemuck::Pod;
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::cell::Cell;
use std::convert::TryFrom;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread::JoinHandle;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

impl ThreadCount {
    fn resolve(&self) -> Result<NonZeroUsize, Error> {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().map_err(Error::AvailableParallelism)
            }
            ThreadCount::Count(count) => Ok(*count),
        }
    }
}

/// Assignment of the threads to NUMA domains.
///
/// The pool doesn't discover the machine's topology: the layout only
/// determines the [`numa_rank()`](Worker::numa_rank) and
/// [`numa_core_rank()`](Worker::numa_core_rank) reported to tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumaLayout {
    /// All the threads belong to a single domain.
    Flat,
    /// Consecutive ranks fill one domain after the other.
    Domains {
        /// Number of NUMA domains.
        numa_count: NonZeroUsize,
        /// Number of threads per NUMA domain.
        cores_per_numa: NonZeroUsize,
    },
}

impl NumaLayout {
    /// Returns the number of domains and the number of threads per domain.
    fn resolve(&self, num_threads: usize) -> Result<(usize, usize), Error> {
        match *self {
            NumaLayout::Flat => Ok((1, num_threads)),
            NumaLayout::Domains {
                numa_count,
                cores_per_numa,
            } => {
                let (numa_count, cores_per_numa) = (numa_count.get(), cores_per_numa.get());
                match numa_count.checked_mul(cores_per_numa) {
                    Some(capacity) if capacity >= num_threads => Ok((numa_count, cores_per_numa)),
                    _ => Err(Error::TopologyMismatch {
                        threads: num_threads,
                        numa_count,
                        cores_per_numa,
                    }),
                }
            }
        }
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. Building a thread pool fails if a
    /// thread can't be pinned, and panics if CPU pinning isn't supported on
    /// this platform (or not implemented).
    Always,
}

/// A builder for [`ThreadPool`].
#[derive(Clone, Copy, Debug)]
pub struct ThreadPoolBuilder {
    /// Number of worker threads in the pool.
    pub num_threads: ThreadCount,
    /// Assignment of the worker threads to NUMA domains.
    pub numa: NumaLayout,
    /// Whether the orchestrating thread stays free while tasks run. If
    /// `false`, the orchestrating thread acts as the root worker (the highest
    /// rank) whenever it dispatches a task, and one less thread is spawned.
    pub asynchronous: bool,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use spinfan::{CpuPinningPolicy, NumaLayout, ThreadCount, ThreadPoolBuilder};
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     numa: NumaLayout::Flat,
    ///     asynchronous: true,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build()?;
    ///
    /// thread_pool.resize_scratch(64, 0)?;
    /// thread_pool.execute(|worker| {
    ///     let total = worker.all_reduce(1u64).unwrap();
    ///     assert_eq!(total, worker.pool_size() as u64);
    /// })?;
    /// # Ok::<(), spinfan::Error>(())
    /// ```
    pub fn build(&self) -> Result<ThreadPool, Error> {
        ThreadPool::new(self)
    }
}

thread_local! {
    /// Rank of the pool worker running on this thread, if any.
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Marks the current thread as a pool worker until dropped.
struct ActingWorker {
    previous: Option<usize>,
}

impl ActingWorker {
    fn enter(rank: usize) -> Self {
        let previous = CURRENT_WORKER.with(|current| current.replace(Some(rank)));
        Self { previous }
    }
}

impl Drop for ActingWorker {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|current| current.set(self.previous));
    }
}

fn verify_is_process(operation: &'static str) -> Result<(), Error> {
    if ThreadPool::is_process() {
        Ok(())
    } else {
        Err(Error::NotProcess { operation })
    }
}

/// A task owned by the pool until it is fenced.
type OwnedTask = Box<dyn Fn(Worker<'_>) + Send + Sync + 'static>;

/// State shared between the orchestrator and the worker threads.
struct PoolShared {
    /// Worker records, indexed by rank.
    workers: Box<[WorkerRecord]>,
    /// Task to run when a worker becomes active.
    task: RwLock<TaskSlot>,
    /// Number of workers whose task panicked since the last fence.
    num_panicking_threads: CachePadded<AtomicUsize>,
    /// Blocks idle workers while the pool is asleep.
    sleep_gate: SleepGate,
}

impl PoolShared {
    /// Runs the current task as the worker of the given rank, and marks the
    /// worker inactive afterwards.
    fn run_task(&self, rank: usize) {
        let _acting = ActingWorker::enter(rank);
        {
            let guard = self.task.read().unwrap();
            // SAFETY: The orchestrator keeps the task alive and doesn't replace it
            // until all the workers are inactive again, which only happens after this
            // guard is dropped.
            match unsafe { guard.task() } {
                Some(task) => {
                    let worker = Worker::new(&self.workers, rank);
                    if panic::catch_unwind(AssertUnwindSafe(|| task(worker))).is_err() {
                        log_error!("[thread #{rank}] Task panicked");
                        self.num_panicking_threads.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => log_error!("[thread #{rank}] Activated without any task"),
            }
        }
        self.workers[rank].state().store(WorkerState::Inactive);
    }
}

/// Main function run by the worker thread of the given rank.
fn worker_main(shared: &PoolShared, rank: usize) {
    let state = shared.workers[rank].state();
    loop {
        match state.spin_while(WorkerState::Inactive) {
            WorkerState::Active => shared.run_task(rank),
            WorkerState::Terminating => break,
            // A peer left a collective early, reported at the next fence.
            _other => {
                log_error!("[thread #{rank}] Woken up in state {_other:?} without a task");
                shared.num_panicking_threads.fetch_add(1, Ordering::Relaxed);
                state.store(WorkerState::Inactive);
            }
        }
    }
    log_debug!("[thread #{rank}] Terminating");
}

#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(rank: usize, cpu_pinning: CpuPinningPolicy) -> Result<(), Error> {
    let pin = || -> nix::Result<()> {
        let mut cpu_set = CpuSet::new();
        cpu_set.set(rank)?;
        sched_setaffinity(Pid::from_raw(0), &cpu_set)
    };
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => match pin() {
            Ok(()) => log_debug!("Pinned thread #{rank} to CPU #{rank}"),
            Err(_e) => log_warn!("Failed to set CPU affinity for thread #{rank}: {_e}"),
        },
        CpuPinningPolicy::Always => match pin() {
            Ok(()) => log_debug!("Pinned thread #{rank} to CPU #{rank}"),
            Err(e) => {
                return Err(Error::CpuPinning {
                    rank,
                    source: e.into(),
                })
            }
        },
    }
    Ok(())
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_rank: usize, _cpu_pinning: CpuPinningPolicy) -> Result<(), Error> {
    Ok(())
}

/// What the workers were last asked to do.
enum Dispatch {
    /// All the workers are inactive.
    Idle,
    /// A task was started and hasn't been fenced yet.
    Started(OwnedTask),
    /// The workers are blocked until [`ThreadPool::wake()`] is called.
    Asleep(OwnedTask),
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// A fixed-size pool of threads that spin-wait for tasks, and synchronize
/// through [collectives](Worker) while running them.
///
/// Only the orchestrating thread, i.e. any thread that isn't running a task
/// of a pool (see [`is_process()`](Self::is_process)), may dispatch tasks,
/// resize the scratch memory or finalize the pool.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<WorkerThreadHandle>,
    num_threads: NonZeroUsize,
    numa_count: usize,
    cores_per_numa: usize,
    asynchronous: bool,
    scratch_layout: ScratchLayout,
    dispatch: Dispatch,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Result<Self, Error> {
        verify_is_process("build a thread pool")?;

        let num_threads = builder.num_threads.resolve()?;
        if num_threads.get() > MAX_THREAD_COUNT {
            return Err(Error::TooManyThreads {
                requested: num_threads.get(),
                max: MAX_THREAD_COUNT,
            });
        }
        let (numa_count, cores_per_numa) = builder.numa.resolve(num_threads.get())?;

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match builder.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let workers = (0..num_threads.get())
            .map(|rank| {
                WorkerRecord::new(
                    rank,
                    num_threads.get(),
                    rank / cores_per_numa,
                    rank % cores_per_numa,
                )
            })
            .collect();
        let mut pool = ThreadPool {
            shared: Arc::new(PoolShared {
                workers,
                task: RwLock::new(TaskSlot::new()),
                num_panicking_threads: CachePadded::new(AtomicUsize::new(0)),
                sleep_gate: SleepGate::new(),
            }),
            threads: Vec::new(),
            num_threads,
            numa_count,
            cores_per_numa,
            asynchronous: builder.asynchronous,
            scratch_layout: ScratchLayout::default(),
            dispatch: Dispatch::Idle,
        };

        // If anything fails from now on, dropping the pool terminates the threads
        // spawned so far.
        let num_spawned = if pool.asynchronous {
            num_threads.get()
        } else {
            num_threads.get() - 1
        };
        let (pinned_sender, pinned_receiver) = mpsc::channel();
        for rank in 0..num_spawned {
            let shared = Arc::clone(&pool.shared);
            let pinned_sender = pinned_sender.clone();
            let cpu_pinning = builder.cpu_pinning;
            let handle = std::thread::Builder::new()
                .name(format!("spinfan-worker-{rank}"))
                .spawn(move || {
                    let pinned = pin_current_thread(rank, cpu_pinning);
                    let ready = pinned.is_ok();
                    // The builder may have given up already.
                    let _ = pinned_sender.send(pinned);
                    drop(pinned_sender);
                    if ready {
                        worker_main(&shared, rank);
                    }
                })
                .map_err(|source| Error::Spawn { rank, source })?;
            pool.threads.push(WorkerThreadHandle { handle });
        }
        drop(pinned_sender);
        for pinned in pinned_receiver.iter() {
            pinned?;
        }
        log_debug!("[main thread] Spawned {num_spawned} threads");

        Ok(pool)
    }

    /// Returns the number of threads taking part in each task, including the
    /// orchestrating thread for a non-asynchronous pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_threads
    }

    /// Returns the number of NUMA domains that the threads are assigned to.
    pub fn numa_count(&self) -> usize {
        self.numa_count
    }

    /// Returns the number of threads per NUMA domain.
    pub fn cores_per_numa(&self) -> usize {
        self.cores_per_numa
    }

    /// Returns the current sizes of each worker's scratch zones.
    pub fn scratch_layout(&self) -> ScratchLayout {
        self.scratch_layout
    }

    /// Returns true on any thread that isn't currently running a task of a
    /// thread pool.
    pub fn is_process() -> bool {
        CURRENT_WORKER.with(|current| current.get().is_none())
    }

    /// Returns true if a task was [started](Self::start) and hasn't been
    /// [fenced](Self::fence) yet.
    pub fn in_parallel(&self) -> bool {
        matches!(self.dispatch, Dispatch::Started(_))
    }

    /// Returns true if the pool was put to [sleep](Self::sleep).
    pub fn is_asleep(&self) -> bool {
        matches!(self.dispatch, Dispatch::Asleep(_))
    }

    /// Dispatches the given task to all the threads of the pool, and returns
    /// without waiting for its completion, except that a non-asynchronous pool
    /// first runs the root's share on the calling thread.
    ///
    /// A previously started task is fenced first.
    pub fn start<F>(&mut self, task: F) -> Result<(), Error>
    where
        F: Fn(Worker<'_>) + Send + Sync + 'static,
    {
        verify_is_process("start a task")?;
        self.fence()?;

        let task: OwnedTask = Box::new(task);
        self.shared.task.write().unwrap().install(&*task);
        self.dispatch = Dispatch::Started(task);
        log_debug!("[main thread] Starting a task");
        self.activate(true);
        Ok(())
    }

    /// Runs the given task on all the threads of the pool, and waits for its
    /// completion.
    pub fn execute<F>(&mut self, task: F) -> Result<(), Error>
    where
        F: Fn(Worker<'_>) + Sync,
    {
        verify_is_process("execute a task")?;
        self.fence()?;

        self.shared.task.write().unwrap().install(&task);
        self.activate(true);
        // The task must not be dropped before this returns.
        self.wait_for_workers()
    }

    /// Runs the given task on each thread of the pool, one after the other in
    /// rank order, and waits for the last one.
    ///
    /// The task must not call any collective, as the other threads don't run
    /// concurrently.
    pub fn execute_serial<F>(&mut self, task: F) -> Result<(), Error>
    where
        F: Fn(Worker<'_>) + Sync,
    {
        verify_is_process("execute a serial task")?;
        self.fence()?;

        self.shared.task.write().unwrap().install(&task);
        for (rank, record) in self.shared.workers.iter().enumerate() {
            record.state().store(WorkerState::Active);
            if self.runs_inline(rank) {
                self.shared.run_task(rank);
            } else {
                record.state().spin_until(WorkerState::Inactive);
            }
        }
        self.wait_for_workers()
    }

    /// Waits until all the threads have completed the last started task.
    ///
    /// Returns [`Error::WorkerPanicked`] if the task panicked on any thread.
    pub fn fence(&mut self) -> Result<(), Error> {
        verify_is_process("fence")?;
        match self.dispatch {
            Dispatch::Idle => Ok(()),
            Dispatch::Started(_) => self.wait_for_workers(),
            Dispatch::Asleep(_) => Err(Error::Asleep),
        }
    }

    /// Ensures that each worker's reduce zone holds at least `reduce_size`
    /// bytes and its thread zone at least `thread_size` bytes. Sizes are
    /// rounded up to a multiple of [`SCRATCH_ALIGN`](crate::SCRATCH_ALIGN),
    /// and zones never shrink, except that `(0, 0)` releases all the scratch
    /// memory.
    ///
    /// Each worker allocates its own zones on its own thread, so that memory
    /// pages are first touched by the thread that uses them. Fresh zones are
    /// zeroed.
    pub fn resize_scratch(&mut self, reduce_size: usize, thread_size: usize) -> Result<(), Error> {
        const OPERATION: &str = "resize scratch memory";
        verify_is_process(OPERATION)?;
        match self.dispatch {
            Dispatch::Idle => (),
            Dispatch::Started(_) => return Err(Error::InFlight { operation: OPERATION }),
            Dispatch::Asleep(_) => return Err(Error::Asleep),
        }

        let request = ScratchLayout::new(reduce_size, thread_size);
        let Some(layout) = self.scratch_layout.grow_to(request) else {
            return Ok(());
        };
        log_debug!(
            "[main thread] Resizing scratch memory from {:?} to {layout:?}",
            self.scratch_layout
        );
        // SAFETY: Serial execution means that no other thread runs while each
        // worker replaces its own buffer, and this task calls no collective.
        self.execute_serial(move |worker| unsafe { worker.reallocate_scratch(layout) })?;
        self.scratch_layout = layout;
        Ok(())
    }

    /// Reads the first `count` values of type `T` from the root's reduce
    /// zone, i.e. the combined value left by the last
    /// [`fan_in_reduce()`](Worker::fan_in_reduce).
    pub fn root_reduce_value<T: Pod>(&self, count: usize) -> Result<Vec<T>, Error> {
        const OPERATION: &str = "read the root reduce value";
        verify_is_process(OPERATION)?;
        if !matches!(self.dispatch, Dispatch::Idle) {
            return Err(Error::InFlight { operation: OPERATION });
        }

        let root = &self.shared.workers[self.num_threads.get() - 1];
        // SAFETY: No task is running, and buffers are only replaced by tasks,
        // which need a mutable reference to the pool.
        let slots = unsafe { root.reduce_slots::<T>(count, 1) }?;
        // SAFETY: Same as above.
        Ok(unsafe { slots.get(0) }.to_vec())
    }

    /// Moves the idle threads into a blocking wait, so that they stop spinning.
    ///
    /// Returns `false` if the pool was already asleep. A started task is
    /// fenced first. Tasks can't be dispatched until [`wake()`](Self::wake)
    /// is called.
    pub fn sleep(&mut self) -> Result<bool, Error> {
        verify_is_process("put the thread pool to sleep")?;
        match self.dispatch {
            Dispatch::Idle => (),
            Dispatch::Started(_) => self.wait_for_workers()?,
            Dispatch::Asleep(_) => return Ok(false),
        }

        self.shared.sleep_gate.close();
        let shared = Arc::clone(&self.shared);
        let task: OwnedTask = Box::new(move |worker: Worker<'_>| {
            shared.sleep_gate.wait();
            worker.fan_in();
        });
        self.shared.task.write().unwrap().install(&*task);
        self.dispatch = Dispatch::Asleep(task);
        // The orchestrator can't block here: it runs its share in `wake()`.
        self.activate(false);
        log_debug!("[main thread] Thread pool is asleep");
        Ok(true)
    }

    /// Wakes up the threads after [`sleep()`](Self::sleep), and waits until
    /// they are back to spinning.
    ///
    /// Returns `false` if the pool wasn't asleep.
    pub fn wake(&mut self) -> Result<bool, Error> {
        verify_is_process("wake the thread pool up")?;
        self.wake_inner()
    }

    fn wake_inner(&mut self) -> Result<bool, Error> {
        if !self.is_asleep() {
            return Ok(false);
        }
        self.shared.sleep_gate.open();
        if !self.asynchronous {
            let root = self.num_threads.get() - 1;
            self.shared.workers[root]
                .state()
                .store(WorkerState::Active);
            self.shared.run_task(root);
        }
        self.wait_for_workers()?;
        log_debug!("[main thread] Thread pool is awake");
        Ok(true)
    }

    /// Waits for all the threads to complete their current task, wakes up a
    /// sleeping pool, and joins all the threads.
    ///
    /// This also happens when the pool is dropped, except that errors are
    /// only logged.
    pub fn finalize(mut self) -> Result<(), Error> {
        verify_is_process("finalize the thread pool")?;
        self.shutdown()
    }

    /// Writes a description of the pool's configuration. With `detail`, this
    /// also describes each thread.
    pub fn print_configuration(&self, out: &mut impl io::Write, detail: bool) -> io::Result<()> {
        writeln!(
            out,
            "spinfan::ThreadPool: {} thread(s), {} NUMA domain(s) x {} core(s), {}",
            self.num_threads,
            self.numa_count,
            self.cores_per_numa,
            if self.asynchronous {
                "asynchronous"
            } else {
                "synchronous"
            }
        )?;
        writeln!(
            out,
            "  scratch: {} reduce byte(s) + {} thread byte(s) per thread",
            self.scratch_layout.reduce_size, self.scratch_layout.thread_size
        )?;
        if detail {
            for (rank, record) in self.shared.workers.iter().enumerate() {
                let fan = record.fan();
                // SAFETY: Buffers are only replaced by tasks, which need a
                // mutable reference to the pool.
                let scratch = unsafe { record.scratch() };
                writeln!(
                    out,
                    "  thread #{rank}: numa {} core {}, rev_rank {}, parent {:?}, children {:?} (subtree of {}), state {:?}, scratch {:#x} ({} + {} bytes){}",
                    record.numa_rank(),
                    record.numa_core_rank(),
                    fan.rev_rank(),
                    fan.parent(),
                    fan.children().collect::<Vec<_>>(),
                    fan.subtree().len(),
                    record.state().load(),
                    scratch.base_address(),
                    scratch.layout().reduce_size,
                    scratch.layout().thread_size,
                    if self.runs_inline(rank) {
                        " (orchestrator)"
                    } else {
                        ""
                    }
                )?;
            }
        }
        Ok(())
    }

    /// Whether the given rank runs on the orchestrating thread.
    fn runs_inline(&self, rank: usize) -> bool {
        !self.asynchronous && rank + 1 == self.num_threads.get()
    }

    /// Activates the workers in increasing rank order. For a non-asynchronous
    /// pool, the root's share then runs on the calling thread if requested.
    fn activate(&self, run_inline: bool) {
        for (rank, record) in self.shared.workers.iter().enumerate() {
            if !self.runs_inline(rank) {
                record.state().store(WorkerState::Active);
            }
        }
        if !self.asynchronous && run_inline {
            let root = self.num_threads.get() - 1;
            self.shared.workers[root]
                .state()
                .store(WorkerState::Active);
            self.shared.run_task(root);
        }
    }

    /// Waits until every worker is inactive, and releases the task.
    fn wait_for_workers(&mut self) -> Result<(), Error> {
        for record in self.shared.workers.iter() {
            record.state().spin_until(WorkerState::Inactive);
        }
        self.shared.task.write().unwrap().clear();
        self.dispatch = Dispatch::Idle;

        let count = self.shared.num_panicking_threads.swap(0, Ordering::Relaxed);
        if count != 0 {
            log_error!("[main thread] {count} worker thread(s) panicked");
            return Err(Error::WorkerPanicked { count });
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        let result = match self.dispatch {
            Dispatch::Idle => Ok(()),
            Dispatch::Started(_) => self.wait_for_workers(),
            Dispatch::Asleep(_) => self.wake_inner().map(|_| ()),
        };

        for record in self.shared.workers.iter() {
            record.state().store(WorkerState::Terminating);
        }

        if !self.threads.is_empty() {
            log_debug!("[main thread] Joining threads in the pool...");
            #[allow(clippy::unused_enumerate_index)]
            for (_i, t) in self.threads.drain(..).enumerate() {
                let result = t.handle.join();
                match result {
                    Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                    Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
                }
            }
            log_debug!("[main thread] Joined threads.");
        }
        result
    }
}

impl Drop for ThreadPool {
    /// Joins all the threads in the pool.
    fn drop(&mut self) {
        if let Err(_e) = self.shutdown() {
            log_error!("[main thread] Failed to finalize the thread pool: {_e}");
        }
    }
}
