// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: thread pool, fan-in topology, scratch memory and collectives.

mod collective;
mod scratch;
mod state;
mod thread_pool;
mod topology;
mod util;
mod worker;

pub use collective::{Reducer, Scan};
pub use scratch::{ScratchLayout, SCRATCH_ALIGN};
pub use thread_pool::{
    CpuPinningPolicy, NumaLayout, ThreadCount, ThreadPool, ThreadPoolBuilder,
};
pub use topology::{MAX_FAN_COUNT, MAX_THREAD_COUNT};
pub use worker::Worker;
