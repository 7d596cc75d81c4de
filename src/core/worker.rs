// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-worker records, and the handle through which tasks take part in
//! collectives.

use super::scratch::{ScratchBuffer, ScratchLayout, ValueSlots};
use super::state::{StateCell, WorkerState};
use super::topology::FanIn;
use crate::error::Error;
use bytemuck::Pod;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared record of one worker, at a fixed position in the pool's arena.
pub(crate) struct WorkerRecord {
    fan: FanIn,
    numa_rank: usize,
    numa_core_rank: usize,
    state: StateCell,
    scratch: UnsafeCell<ScratchBuffer>,
    thread_scratch_borrowed: AtomicBool,
}

// SAFETY: The scratch buffer is only replaced by its owner while the pool is
// quiescent (see `replace_scratch()`), and its contents are only accessed
// through the unsafe `ValueSlots` and `Zone` accessors, synchronized by the
// state transitions of the collectives.
unsafe impl Sync for WorkerRecord {}

impl WorkerRecord {
    pub(crate) fn new(
        rank: usize,
        pool_size: usize,
        numa_rank: usize,
        numa_core_rank: usize,
    ) -> Self {
        Self {
            fan: FanIn::new(rank, pool_size),
            numa_rank,
            numa_core_rank,
            state: StateCell::new(WorkerState::Inactive),
            scratch: UnsafeCell::new(ScratchBuffer::empty()),
            thread_scratch_borrowed: AtomicBool::new(false),
        }
    }

    pub(crate) fn fan(&self) -> &FanIn {
        &self.fan
    }

    pub(crate) fn rank(&self) -> usize {
        self.fan.rank()
    }

    pub(crate) fn numa_rank(&self) -> usize {
        self.numa_rank
    }

    pub(crate) fn numa_core_rank(&self) -> usize {
        self.numa_core_rank
    }

    pub(crate) fn state(&self) -> &StateCell {
        &self.state
    }

    /// Returns the scratch buffer of this worker.
    ///
    /// # Safety
    ///
    /// The buffer must not be replaced during the output lifetime.
    pub(crate) unsafe fn scratch(&self) -> &ScratchBuffer {
        // SAFETY: The caller guarantees that no `replace_scratch()` overlaps.
        unsafe { &*self.scratch.get() }
    }

    /// Swaps in a new scratch buffer, dropping the previous one.
    ///
    /// # Safety
    ///
    /// No other reference to the current buffer or its contents may be live,
    /// and no other thread may access this worker's scratch concurrently.
    pub(crate) unsafe fn replace_scratch(&self, buffer: ScratchBuffer) {
        // SAFETY: The caller guarantees exclusive access.
        unsafe { *self.scratch.get() = buffer };
    }

    /// Typed view of this worker's reduce zone.
    ///
    /// # Safety
    ///
    /// The scratch buffer must not be replaced during the output lifetime.
    pub(crate) unsafe fn reduce_slots<T: Pod>(
        &self,
        count: usize,
        num_slots: usize,
    ) -> Result<ValueSlots<'_, T>, Error> {
        // SAFETY: Forwarded to the caller.
        unsafe { self.scratch() }
            .reduce_zone()
            .slots(count, num_slots)
    }
}

/// Handle to the worker thread running a task.
///
/// Every thread of the pool receives its own handle when a task is
/// dispatched. The handle identifies the thread within the pool and gives
/// access to the collectives, which all the threads must call in the same
/// order.
///
/// A handle can't leave the thread it was handed to.
#[derive(Clone, Copy)]
pub struct Worker<'a> {
    record: &'a WorkerRecord,
    pool: &'a [WorkerRecord],
    _not_send: PhantomData<*const ()>,
}

impl<'a> Worker<'a> {
    pub(crate) fn new(pool: &'a [WorkerRecord], rank: usize) -> Self {
        Self {
            record: &pool[rank],
            pool,
            _not_send: PhantomData,
        }
    }

    /// Rank of this thread, in `0..pool_size()`.
    pub fn rank(&self) -> usize {
        self.record.rank()
    }

    /// Number of threads in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Reverse rank of this thread, i.e. `pool_size() - rank() - 1`.
    pub fn rev_rank(&self) -> usize {
        self.record.fan().rev_rank()
    }

    /// Number of children of this thread in the fan-in tree.
    pub fn fan_size(&self) -> usize {
        self.record.fan().fan_size()
    }

    /// Whether this thread is the root of the fan-in tree, i.e. has the
    /// highest rank.
    pub fn is_root(&self) -> bool {
        self.record.fan().is_root()
    }

    /// Index of the NUMA domain of this thread.
    pub fn numa_rank(&self) -> usize {
        self.record.numa_rank()
    }

    /// Index of this thread within its NUMA domain.
    pub fn numa_core_rank(&self) -> usize {
        self.record.numa_core_rank()
    }

    /// Runs the given function on the thread zone of this worker's scratch
    /// memory, which no other thread ever touches.
    ///
    /// # Panics
    ///
    /// Panics if called again from within `f`.
    pub fn with_thread_scratch<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let borrowed = &self.record.thread_scratch_borrowed;
        assert!(
            !borrowed.swap(true, Ordering::Relaxed),
            "the thread scratch of worker #{} is already borrowed",
            self.rank()
        );

        struct Release<'b>(&'b AtomicBool);
        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Relaxed);
            }
        }
        let _release = Release(borrowed);

        // SAFETY:
        // - The scratch buffer isn't replaced while a task runs.
        // - Only the owning thread holds this handle, and the flag above rules out
        //   overlapping borrows on this thread.
        let bytes = unsafe { self.record.scratch().thread_zone().bytes_mut() };
        f(bytes)
    }

    pub(crate) fn fan(&self) -> &'a FanIn {
        self.record.fan()
    }

    pub(crate) fn state(&self) -> &'a StateCell {
        self.record.state()
    }

    pub(crate) fn peer(&self, rank: usize) -> &'a WorkerRecord {
        &self.pool[rank]
    }

    /// Typed view of this thread's reduce zone, checking that it fits.
    pub(crate) fn own_slots<T: Pod>(
        &self,
        count: usize,
        num_slots: usize,
    ) -> Result<ValueSlots<'a, T>, Error> {
        // SAFETY: The scratch buffer isn't replaced while a task runs.
        unsafe { self.record.reduce_slots(count, num_slots) }
    }

    /// Typed view of another thread's reduce zone.
    ///
    /// # Panics
    ///
    /// Panics if the peer's zone doesn't fit, which can't happen once this
    /// thread's own zone was checked since all workers share one layout.
    pub(crate) fn peer_slots<T: Pod>(
        &self,
        rank: usize,
        count: usize,
        num_slots: usize,
    ) -> ValueSlots<'a, T> {
        // SAFETY: The scratch buffer isn't replaced while a task runs.
        match unsafe { self.peer(rank).reduce_slots(count, num_slots) } {
            Ok(slots) => slots,
            Err(e) => panic!("workers of a pool share one scratch layout: {e}"),
        }
    }

    /// Replaces this worker's scratch with a fresh allocation of the given
    /// layout, made on the calling thread.
    ///
    /// # Safety
    ///
    /// Must only be called from a task run by
    /// [`ThreadPool::execute_serial()`](crate::ThreadPool::execute_serial),
    /// so that no other thread touches any scratch concurrently.
    pub(crate) unsafe fn reallocate_scratch(&self, layout: ScratchLayout) {
        // Drop the old buffer first, to avoid holding both at once.
        // SAFETY: Forwarded to the caller.
        unsafe {
            self.record.replace_scratch(ScratchBuffer::empty());
            self.record.replace_scratch(ScratchBuffer::allocate(layout));
        }
    }
}

impl std::fmt::Debug for Worker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("rank", &self.rank())
            .field("pool_size", &self.pool_size())
            .field("numa_rank", &self.numa_rank())
            .field("numa_core_rank", &self.numa_core_rank())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_pool(pool_size: usize, layout: ScratchLayout) -> Box<[WorkerRecord]> {
        let pool: Box<[WorkerRecord]> = (0..pool_size)
            .map(|rank| WorkerRecord::new(rank, pool_size, rank / 4, rank % 4))
            .collect();
        for record in pool.iter() {
            unsafe { record.replace_scratch(ScratchBuffer::allocate(layout)) };
        }
        pool
    }

    #[test]
    fn test_worker_accessors() {
        let pool = make_pool(10, ScratchLayout::default());
        let worker = Worker::new(&pool, 6);
        assert_eq!(worker.rank(), 6);
        assert_eq!(worker.pool_size(), 10);
        assert_eq!(worker.rev_rank(), 3);
        assert_eq!(worker.fan_size(), 0);
        assert!(!worker.is_root());
        assert_eq!(worker.numa_rank(), 1);
        assert_eq!(worker.numa_core_rank(), 2);

        let root = Worker::new(&pool, 9);
        assert!(root.is_root());
        assert_eq!(root.fan_size(), 4);
    }

    #[test]
    fn test_records_start_inactive() {
        let pool = make_pool(3, ScratchLayout::default());
        for record in pool.iter() {
            assert_eq!(record.state().load(), WorkerState::Inactive);
        }
    }

    #[test]
    fn test_thread_scratch() {
        let pool = make_pool(2, ScratchLayout::new(64, 100));
        let worker = Worker::new(&pool, 0);
        let len = worker.with_thread_scratch(|bytes| {
            bytes.fill(7);
            bytes.len()
        });
        assert_eq!(len, 128);
        worker.with_thread_scratch(|bytes| assert!(bytes.iter().all(|&b| b == 7)));

        // The other worker's zones and this worker's reduce zone are untouched.
        Worker::new(&pool, 1).with_thread_scratch(|bytes| assert!(bytes.iter().all(|&b| b == 0)));
        let slots = worker.own_slots::<u8>(64, 1).unwrap();
        assert!(unsafe { slots.get(0) }.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "the thread scratch of worker #0 is already borrowed")]
    fn test_thread_scratch_reentrant() {
        let pool = make_pool(1, ScratchLayout::new(0, 64));
        let worker = Worker::new(&pool, 0);
        worker.with_thread_scratch(|_| worker.with_thread_scratch(|_| ()));
    }

    #[test]
    fn test_own_slots_too_small() {
        let pool = make_pool(1, ScratchLayout::new(64, 0));
        let worker = Worker::new(&pool, 0);
        assert!(worker.own_slots::<u64>(4, 2).is_ok());
        assert!(matches!(
            worker.own_slots::<u64>(5, 2),
            Err(Error::ScratchTooSmall {
                required: 80,
                available: 64
            })
        ));
    }

    #[test]
    fn test_reallocate_scratch() {
        let pool = make_pool(2, ScratchLayout::new(64, 0));
        let worker = Worker::new(&pool, 1);
        unsafe { worker.own_slots::<u64>(8, 1).unwrap().get_mut(0) }.fill(u64::MAX);

        unsafe { worker.reallocate_scratch(ScratchLayout::new(128, 64)) };
        let layout = unsafe { pool[1].scratch() }.layout();
        assert_eq!(layout, ScratchLayout::new(128, 64));
        // Fresh allocations are zeroed.
        let slots = worker.own_slots::<u64>(16, 1).unwrap();
        assert!(unsafe { slots.get(0) }.iter().all(|&x| x == 0));
        // Other workers keep their allocation.
        assert_eq!(
            unsafe { pool[0].scratch() }.layout(),
            ScratchLayout::new(64, 0)
        );
    }
}
