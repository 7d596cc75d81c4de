// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker states and the spin-wait primitive.

use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a worker thread.
///
/// Each tree edge follows a request/acknowledge protocol: a thread moves
/// itself out of [`Active`](Self::Active) to publish a value, and the consumer
/// of that value moves it back once the value may be overwritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// The thread has been notified by the pool to exit.
    Terminating,
    /// The thread exists and waits for work.
    Inactive,
    /// The thread is running a task.
    Active,
    /// The thread waits in a barrier or reduction.
    Rendezvous,
    /// The thread has copied its exclusive scan value.
    ScanCompleted,
    /// The thread's inclusive scan value is available.
    ScanAvailable,
    /// The thread's subtree reduction value is available.
    ReductionAvailable,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Terminating,
            1 => WorkerState::Inactive,
            2 => WorkerState::Active,
            3 => WorkerState::Rendezvous,
            4 => WorkerState::ScanCompleted,
            5 => WorkerState::ScanAvailable,
            6 => WorkerState::ReductionAvailable,
            _ => unreachable!("invalid worker state {value}"),
        }
    }
}

/// A [`WorkerState`] shared between threads, alone on its cache line.
pub struct StateCell {
    state: CachePadded<AtomicU8>,
}

impl StateCell {
    /// Creates a new cell in the given state.
    pub fn new(state: WorkerState) -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(state as u8)),
        }
    }

    /// Reads the current state, synchronizing with the
    /// [`store()`](Self::store) that wrote it.
    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets the state, publishing all the writes made by this thread so far to
    /// threads that observe the new state.
    pub fn store(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Spins until the state differs from `state`, and returns the new state.
    ///
    /// The loop busy-spins for a bounded number of iterations, and then yields
    /// the processor between polls. It never blocks in the kernel.
    pub fn spin_while(&self, state: WorkerState) -> WorkerState {
        let backoff = Backoff::new();
        loop {
            let current = self.load();
            if current != state {
                return current;
            }
            backoff.snooze();
        }
    }

    /// Spins until the state equals `state`.
    pub fn spin_until(&self, state: WorkerState) {
        let backoff = Backoff::new();
        while self.load() != state {
            backoff.snooze();
        }
    }
}
