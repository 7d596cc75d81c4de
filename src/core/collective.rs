// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Collective operations over the fan-in tree: barrier, reductions and prefix
//! scans.
//!
//! All the threads of a pool must call the same collectives in the same order,
//! with the same reducer and the same value count. Values are exchanged
//! through the reduce zone of each worker's scratch memory, which must be
//! large enough (see [`ThreadPool::resize_scratch()`](crate::ThreadPool::resize_scratch)).
//!
//! A thread that passes a value of the wrong length still takes part in the
//! collective with the identity element, and then returns
//! [`Error::ValueCount`].

use super::state::WorkerState;
use super::worker::Worker;
use crate::error::Error;
use crate::macros::log_trace;
use bytemuck::Pod;
use std::ops::Add;

/// Slot of the reduce zone holding the subtree reduction, and then the
/// exclusive scan value.
const PRIMARY: usize = 0;
/// Slot of the reduce zone holding the inclusive scan value.
const SCAN: usize = 1;

/// An associative operation on fixed-size arrays of plain values.
///
/// The operation doesn't need to be commutative: collectives always combine
/// values in rank order.
pub trait Reducer {
    /// Type of the values being combined.
    type Value: Pod + Send + Sync;

    /// Number of values that each thread contributes.
    fn value_count(&self) -> usize {
        1
    }

    /// Writes the identity element into `value`.
    fn init(&self, value: &mut [Self::Value]);

    /// Combines `src` into `dst`, where `src` always covers lower ranks than
    /// `dst`: the result written into `dst` is `src ⊕ dst`.
    fn join(&self, dst: &mut [Self::Value], src: &[Self::Value]);

    /// Post-processes the combined value of a [`fan_in_reduce()`](Worker::fan_in_reduce)
    /// on the root thread.
    fn finalize(&self, value: &mut [Self::Value]) {
        let _ = value;
    }
}

/// Output of a prefix scan on one thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scan<T> {
    /// Combination of the values of all the lower ranks, or the identity on
    /// rank 0.
    pub exclusive: Vec<T>,
    /// Combination of the values of all the ranks up to this one included.
    pub inclusive: Vec<T>,
}

impl Worker<'_> {
    /// Waits until all the children of this thread in the fan-in tree have
    /// left the [`Active`](WorkerState::Active) state.
    ///
    /// A child only leaves this state when its task returns, so this must be
    /// the last collective of the task. Once the root returns from it, all the
    /// threads of the pool have completed their task.
    pub fn fan_in(&self) {
        log_trace!("[rank {}] fan_in", self.rank());
        for child in self.fan().children() {
            self.peer(child).state().spin_while(WorkerState::Active);
        }
    }

    /// Sums one scalar value over all threads, and returns the sum on every
    /// thread.
    ///
    /// The root adds the values in rank order. This needs a reduce zone of at
    /// least `size_of::<T>()` bytes.
    pub fn all_reduce<T>(&self, value: T) -> Result<T, Error>
    where
        T: Pod + Send + Sync + Add<Output = T>,
    {
        let own = self.own_slots::<T>(1, 1)?;
        // SAFETY: The previous collective released this thread, so no other
        // thread accesses its reduce zone.
        let slot = unsafe { own.get_mut(PRIMARY) };
        slot[0] = value;

        self.fan_in();
        if !self.is_root() {
            log_trace!("[rank {}] all_reduce: waiting for the root", self.rank());
            self.state().store(WorkerState::Rendezvous);
            self.state().spin_while(WorkerState::Rendezvous);
        } else {
            let pool_size = self.pool_size();
            // SAFETY: Every other thread waits in the rendezvous, after its
            // write was published by its state transition.
            let mut sum = unsafe { self.peer_slots::<T>(0, 1, 1).get(PRIMARY) }[0];
            for rank in 1..pool_size {
                sum = sum + unsafe { self.peer_slots::<T>(rank, 1, 1).get(PRIMARY) }[0];
            }
            for rank in 0..pool_size {
                let slot = unsafe { self.peer_slots::<T>(rank, 1, 1).get_mut(PRIMARY) };
                slot[0] = sum;
            }
            self.release_all();
        }

        // SAFETY: The root's write happened before the release.
        Ok(unsafe { own.get(PRIMARY) }[0])
    }

    /// Combines the values of all threads with the given reducer, in rank
    /// order.
    ///
    /// The combined value is only available on the root, which returns it;
    /// other threads return [`None`]. Like [`fan_in()`](Self::fan_in), this
    /// must be the last collective of the task. The orchestrator can
    /// also read the combined value after the next fence, with
    /// [`ThreadPool::root_reduce_value()`](crate::ThreadPool::root_reduce_value).
    pub fn fan_in_reduce<R: Reducer>(
        &self,
        reducer: &R,
        value: &[R::Value],
    ) -> Result<Option<Vec<R::Value>>, Error> {
        let count = reducer.value_count();
        let own = self.own_slots::<R::Value>(count, 1)?;

        // SAFETY: No other thread reads this zone before this task returns.
        let reduced = unsafe { own.get_mut(PRIMARY) };
        let loaded = load_value(reducer, reduced, value);
        for child in self.fan().children() {
            self.peer(child).state().spin_while(WorkerState::Active);
            log_trace!("[rank {}] fan_in_reduce: joining #{child}", self.rank());
            // SAFETY: The child's task returned, after its last write.
            let child_value = unsafe { self.peer_slots::<R::Value>(child, count, 1).get(PRIMARY) };
            reducer.join(reduced, child_value);
        }

        if self.is_root() {
            reducer.finalize(reduced);
        }
        loaded?;
        Ok(self.is_root().then(|| reduced.to_vec()))
    }

    /// Computes the exclusive and inclusive prefix combinations of the values
    /// of all threads in rank order, through the fan-in tree.
    ///
    /// Each thread only touches its own children and one other thread, which
    /// makes this variant suitable for large values. This needs a reduce zone
    /// of at least `2 * value_count() * size_of::<R::Value>()` bytes.
    pub fn scan_large<R: Reducer>(
        &self,
        reducer: &R,
        value: &[R::Value],
    ) -> Result<Scan<R::Value>, Error> {
        let count = reducer.value_count();
        let own = self.own_slots::<R::Value>(count, 2)?;
        let fan = self.fan();
        let state = self.state();

        // Reduce the subtree into the primary slot, and make a copy in the scan
        // slot.
        let loaded = {
            // SAFETY: The previous collective released this thread, so no other
            // thread accesses its reduce zone.
            let reduced = unsafe { own.get_mut(PRIMARY) };
            let loaded = load_value(reducer, reduced, value);
            for child in fan.children() {
                self.peer(child).state().spin_while(WorkerState::Active);
                // SAFETY: The child published its subtree reduction, and doesn't
                // touch it until it is released.
                let child_value =
                    unsafe { self.peer_slots::<R::Value>(child, count, 2).get(PRIMARY) };
                reducer.join(reduced, child_value);
            }
            unsafe { own.get_mut(SCAN) }.copy_from_slice(reduced);
            loaded
        };

        if !fan.is_root() {
            log_trace!("[rank {}] scan_large: reduction available", self.rank());
            state.store(WorkerState::ReductionAvailable);

            if let Some(sibling) = fan.scan_sibling() {
                let sibling_state = self.peer(sibling).state();
                sibling_state.spin_while(WorkerState::Active);
                sibling_state.spin_while(WorkerState::ReductionAvailable);
                log_trace!("[rank {}] scan_large: joining #{sibling}", self.rank());
                // SAFETY:
                // - The parent only reads the primary slot of this thread.
                // - The sibling published its inclusive value, and keeps it until the
                //   root releases every thread.
                let prefix = unsafe { self.peer_slots::<R::Value>(sibling, count, 2).get(SCAN) };
                reducer.join(unsafe { own.get_mut(SCAN) }, prefix);
            }

            state.store(WorkerState::ScanAvailable);
            state.spin_while(WorkerState::ScanAvailable);
        }

        // Release the children top-down, once their inclusive value is final.
        for child in fan.children() {
            let child_state = self.peer(child).state();
            child_state.spin_while(WorkerState::ReductionAvailable);
            child_state.store(WorkerState::Rendezvous);
        }

        // The exclusive value is the inclusive value of the previous rank, which
        // is either a child or the scan sibling of this thread.
        {
            // SAFETY: The parent has read the primary slot of this thread before
            // releasing it.
            let exclusive = unsafe { own.get_mut(PRIMARY) };
            if fan.rev_rank() + 1 < self.pool_size() {
                let previous = self.rank() - 1;
                // SAFETY: The previous rank published its final inclusive value,
                // observed above either as a child or as the scan sibling.
                exclusive.copy_from_slice(unsafe {
                    self.peer_slots::<R::Value>(previous, count, 2).get(SCAN)
                });
            } else {
                reducer.init(exclusive);
            }
        }

        for child in fan.children() {
            self.peer(child).state().spin_while(WorkerState::Rendezvous);
        }
        // Releasing the tree top-down here would race: a thread released by its
        // parent could start its next collective and overwrite its scan slot
        // while the thread whose scan sibling it is, in another subtree, still
        // reads it. Instead the root waits for every thread and releases them
        // all at once.
        if !fan.is_root() {
            log_trace!("[rank {}] scan_large: completed", self.rank());
            state.store(WorkerState::ScanCompleted);
            state.spin_while(WorkerState::ScanCompleted);
        } else {
            self.release_all();
        }

        loaded?;
        // SAFETY: Only this thread writes to its zone until the next collective.
        Ok(unsafe { read_scan(own) })
    }

    /// Computes the exclusive and inclusive prefix combinations of the values
    /// of all threads in rank order, sequentially on the root.
    ///
    /// This only needs a barrier, at the cost of a serial pass over all the
    /// threads, which suits small values. This needs a reduce zone of at least
    /// `2 * value_count() * size_of::<R::Value>()` bytes.
    pub fn scan_small<R: Reducer>(
        &self,
        reducer: &R,
        value: &[R::Value],
    ) -> Result<Scan<R::Value>, Error> {
        let count = reducer.value_count();
        let own = self.own_slots::<R::Value>(count, 2)?;
        // SAFETY: The previous collective released this thread, so no other
        // thread accesses its reduce zone.
        let loaded = load_value(reducer, unsafe { own.get_mut(SCAN) }, value);

        self.fan_in();
        if !self.is_root() {
            log_trace!("[rank {}] scan_small: waiting for the root", self.rank());
            self.state().store(WorkerState::Rendezvous);
            self.state().spin_while(WorkerState::Rendezvous);
        } else {
            // SAFETY: Every other thread waits in the rendezvous, after its
            // write was published by its state transition.
            reducer.init(unsafe { self.peer_slots::<R::Value>(0, count, 2).get_mut(PRIMARY) });
            for rank in 1..self.pool_size() {
                let previous = unsafe { self.peer_slots::<R::Value>(rank - 1, count, 2).get(SCAN) };
                let slots = self.peer_slots::<R::Value>(rank, count, 2);
                let exclusive = unsafe { slots.get_mut(PRIMARY) };
                exclusive.copy_from_slice(previous);
                reducer.join(unsafe { slots.get_mut(SCAN) }, exclusive);
            }
            self.release_all();
        }

        loaded?;
        // SAFETY: The root's writes happened before the release.
        Ok(unsafe { read_scan(own) })
    }

    /// Releases every thread of the pool from a root-side rendezvous, in
    /// increasing rank order.
    fn release_all(&self) {
        log_trace!("[rank {}] releasing all threads", self.rank());
        for rank in 0..self.pool_size() {
            self.peer(rank).state().store(WorkerState::Active);
        }
    }
}

/// Copies the caller's value into its slot. A value of the wrong length is
/// replaced by the identity, so that this thread still completes the protocol
/// with its peers before reporting the error.
fn load_value<R: Reducer>(
    reducer: &R,
    slot: &mut [R::Value],
    value: &[R::Value],
) -> Result<(), Error> {
    if value.len() == slot.len() {
        slot.copy_from_slice(value);
        Ok(())
    } else {
        reducer.init(slot);
        Err(Error::ValueCount {
            expected: slot.len(),
            actual: value.len(),
        })
    }
}

/// # Safety
///
/// No thread may write to these slots during this call.
unsafe fn read_scan<T: Pod>(slots: super::scratch::ValueSlots<'_, T>) -> Scan<T> {
    // SAFETY: Forwarded to the caller.
    unsafe {
        Scan {
            exclusive: slots.get(PRIMARY).to_vec(),
            inclusive: slots.get(SCAN).to_vec(),
        }
    }
}
