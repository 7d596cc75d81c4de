// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Plumbing between the orchestrator and the workers: the slot holding the
//! dispatched task, and the gate that idle workers block on while the pool
//! sleeps.

use super::worker::Worker;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};

/// A task as seen by the workers, borrowing from the dispatching stack frame.
pub type Task<'a> = dyn Fn(Worker<'_>) + Sync + 'a;

/// Slot holding the task of the current dispatch.
///
/// The task's lifetime is erased when it is installed, and only recovered by
/// the `unsafe` function [`task()`](Self::task). The pool clears the slot
/// once every worker is inactive again, before the dispatching call returns.
pub struct TaskSlot {
    task: Option<NonNull<Task<'static>>>,
}

impl TaskSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Installs the task of a new dispatch. The previous one must have been
    /// cleared.
    pub fn install(&mut self, task: &Task<'_>) {
        debug_assert!(self.task.is_none(), "the previous task wasn't cleared");
        // SAFETY: Only the lifetime of the trait object changes, and callers of
        // `task()` promise not to use it beyond the original borrow.
        let erased = unsafe {
            std::mem::transmute::<NonNull<Task<'_>>, NonNull<Task<'static>>>(NonNull::from(task))
        };
        self.task = Some(erased);
    }

    /// Empties the slot.
    pub fn clear(&mut self) {
        self.task = None;
    }

    /// Returns the installed task, if any.
    ///
    /// # Safety
    ///
    /// The task passed to [`install()`](Self::install) must outlive `'a`.
    pub unsafe fn task<'a>(&self) -> Option<&'a Task<'a>> {
        // SAFETY: The pointer comes from a reference to a live task, as
        // ensured by the caller. Shortening the lifetime is always sound.
        self.task
            .map(|task| unsafe { &*(task.as_ptr() as *const Task<'a>) })
    }
}

// SAFETY: The slot acts as a `&Task`, and tasks are `Sync`.
unsafe impl Send for TaskSlot {}
// SAFETY: Same as above.
unsafe impl Sync for TaskSlot {}

/// Gate that idle workers block on, instead of spinning, while the pool is
/// asleep.
pub struct SleepGate {
    asleep: Mutex<bool>,
    wake_up: Condvar,
}

impl SleepGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self {
            asleep: Mutex::new(false),
            wake_up: Condvar::new(),
        }
    }

    /// Makes subsequent calls to [`wait()`](Self::wait) block.
    pub fn close(&self) {
        *self.asleep.lock().unwrap() = true;
    }

    /// Releases all the blocked threads.
    pub fn open(&self) {
        *self.asleep.lock().unwrap() = false;
        self.wake_up.notify_all();
    }

    /// Blocks until the gate is open.
    pub fn wait(&self) {
        let asleep = self.asleep.lock().unwrap();
        drop(self.wake_up.wait_while(asleep, |asleep| *asleep).unwrap());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::worker::WorkerRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::RwLock;

    fn records(pool_size: usize) -> Vec<WorkerRecord> {
        (0..pool_size)
            .map(|rank| WorkerRecord::new(rank, pool_size, 0, rank))
            .collect()
    }

    #[test]
    fn test_task_slot_install_and_clear() {
        let records = records(1);
        let mut slot = TaskSlot::new();
        assert!(unsafe { slot.task() }.is_none());

        let calls = AtomicUsize::new(0);
        let task = |worker: Worker<'_>| {
            calls.fetch_add(worker.pool_size(), Ordering::Relaxed);
        };
        slot.install(&task);
        unsafe { slot.task() }.unwrap()(Worker::new(&records, 0));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        slot.clear();
        assert!(unsafe { slot.task() }.is_none());

        // A new dispatch may borrow from another frame.
        let offset = 10;
        let other = |worker: Worker<'_>| {
            calls.fetch_add(worker.rank() + offset, Ordering::Relaxed);
        };
        slot.install(&other);
        unsafe { slot.task() }.unwrap()(Worker::new(&records, 0));
        assert_eq!(calls.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn test_task_slot_read_by_workers() {
        const POOL_SIZE: usize = 4;

        let records = records(POOL_SIZE);
        let slot = RwLock::new(TaskSlot::new());
        let ranks = AtomicUsize::new(0);
        let task = |worker: Worker<'_>| {
            ranks.fetch_add(1 << worker.rank(), Ordering::Relaxed);
        };
        slot.write().unwrap().install(&task);

        std::thread::scope(|scope| {
            for rank in 0..POOL_SIZE {
                let (slot, records) = (&slot, &records);
                scope.spawn(move || {
                    let guard = slot.read().unwrap();
                    unsafe { guard.task() }.unwrap()(Worker::new(records, rank));
                });
            }
        });

        slot.write().unwrap().clear();
        assert_eq!(ranks.load(Ordering::Relaxed), 0b1111);
    }

    #[test]
    fn test_sleep_gate() {
        const NUM_THREADS: usize = 4;

        let gate = SleepGate::new();
        // An open gate doesn't block.
        gate.wait();

        gate.close();
        let woken = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..NUM_THREADS {
                scope.spawn(|| {
                    gate.wait();
                    woken.fetch_add(1, Ordering::Relaxed);
                });
            }
            assert_eq!(woken.load(Ordering::Relaxed), 0);
            gate.open();
        });
        assert_eq!(woken.load(Ordering::Relaxed), NUM_THREADS);
    }
}
