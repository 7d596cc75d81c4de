// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fan-in topology: a binomial tree embedded in the thread ranks.

/// Maximum number of children of any thread in the fan-in tree.
pub const MAX_FAN_COUNT: usize = 16;

/// Maximum number of threads in a pool.
pub const MAX_THREAD_COUNT: usize = 1 << (MAX_FAN_COUNT - 2);

/// Position of a thread in the fan-in tree of a pool.
///
/// Threads are indexed by their reverse rank `pool_size - rank - 1`, so that
/// the highest rank is the root of the tree. The thread at reverse rank `rev`
/// has children at reverse ranks `rev + 2^i` for `i` in `0..fan_size`, where
/// `2^i` stays below the lowest set bit of `rev` (unbounded for the root) and
/// `rev + 2^i < pool_size`. The subtree of `rev` therefore covers the
/// contiguous reverse ranks `rev..min(rev + 2^fan_size, pool_size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FanIn {
    pool_size: usize,
    rev_rank: usize,
    fan_size: usize,
}

impl FanIn {
    /// Computes the position of the thread of the given rank.
    ///
    /// # Panics
    ///
    /// Panics if `rank >= pool_size`.
    pub fn new(rank: usize, pool_size: usize) -> Self {
        assert!(
            rank < pool_size,
            "rank {rank} is out of bounds for a pool of {pool_size} threads"
        );
        let rev_rank = pool_size - rank - 1;

        let mut fan_size = 0;
        let mut n = 1;
        while rev_rank & n == 0 && rev_rank + n < pool_size {
            fan_size += 1;
            n <<= 1;
        }

        Self {
            pool_size,
            rev_rank,
            fan_size,
        }
    }

    /// Rank of this thread.
    pub fn rank(&self) -> usize {
        self.rank_of(self.rev_rank)
    }

    /// Reverse rank of this thread.
    pub fn rev_rank(&self) -> usize {
        self.rev_rank
    }

    /// Number of children of this thread.
    pub fn fan_size(&self) -> usize {
        self.fan_size
    }

    /// Whether this thread is the root of the tree.
    pub fn is_root(&self) -> bool {
        self.rev_rank == 0
    }

    /// Converts a reverse rank into a rank.
    pub fn rank_of(&self, rev_rank: usize) -> usize {
        self.pool_size - rev_rank - 1
    }

    /// Ranks of the children of this thread, nearest first.
    pub fn children(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.fan_size).map(move |i| self.rank_of(self.rev_rank + (1 << i)))
    }

    /// Rank of the parent of this thread, or [`None`] for the root.
    pub fn parent(&self) -> Option<usize> {
        if self.is_root() {
            None
        } else {
            let lowest_bit = self.rev_rank & self.rev_rank.wrapping_neg();
            Some(self.rank_of(self.rev_rank - lowest_bit))
        }
    }

    /// Reverse ranks covered by the subtree rooted at this thread.
    pub fn subtree(&self) -> std::ops::Range<usize> {
        let end = self
            .rev_rank
            .saturating_add(1 << self.fan_size)
            .min(self.pool_size);
        self.rev_rank..end
    }

    /// Rank of the thread whose inclusive scan value must be prepended to
    /// this subtree's reduction to obtain this thread's inclusive scan value.
    ///
    /// This is the thread that immediately follows this subtree in reverse
    /// rank order, i.e. the last rank below the subtree. It exists whenever
    /// the subtree doesn't already reach the lowest rank.
    pub fn scan_sibling(&self) -> Option<usize> {
        if self.is_root() {
            return None;
        }
        let sibling = self.rev_rank + (1 << self.fan_size);
        if sibling < self.pool_size {
            Some(self.rank_of(sibling))
        } else {
            None
        }
    }
}
