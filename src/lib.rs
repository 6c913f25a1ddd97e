//! Block-level memory management for VM garbage collectors.
//!
//! Memory is reserved once as a [`SuperRegion`](region::SuperRegion) and
//! carved into regions that the [`BlockAllocator`](block_allocator::BlockAllocator)
//! hands out as fixed-size blocks. On top of those blocks sit the
//! mark-sweep [`MarkedSpace`](marked_space::MarkedSpace), the bump-allocated
//! [`CopiedSpace`](copied_space::CopiedSpace) for backing stores, and the
//! [`WeakSet`](weak_set::WeakSet) and [`HandleSet`](handle_set::HandleSet)
//! side tables. [`Heap`](heap::Heap) wires everything together.

use std::time::Duration;

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod allocation_config;
pub mod block_allocator;
pub mod copied_block;
pub mod copied_space;
pub mod copy_visitor;
pub mod copy_work_list;
pub mod error;
pub mod globals;
pub mod handle_block;
pub mod handle_set;
pub mod heap;
pub mod heap_timer;
pub mod incremental_sweeper;
pub mod internal;
pub mod marked_allocator;
pub mod marked_block;
pub mod marked_space;
pub mod mmap;
pub mod region;
pub mod slot_visitor;
pub mod statistics;
pub mod value;
pub mod weak_block;
pub mod weak_impl;
pub mod weak_set;

pub use error::{HeapError, HeapResult};
pub use heap::{Heap, HeapOperation, SweepToggle};
pub use marked_block::{CellDestructor, DestructorPolicy};
pub use slot_visitor::{CellTracer, SlotVisitor};
pub use value::{CellPtr, Value};

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bytes of address space reserved up front for regions. Regions past
    /// this reservation are mapped individually.
    pub super_region_size: usize,
    /// Run a background thread that releases pooled empty regions.
    pub spawn_trim_thread: bool,
    /// How often the trim thread halves the pool of empty regions
    pub trim_interval: Duration,
    /// Bytes allocated before the first collection, and the minimum
    /// budget between two collections afterwards.
    pub min_bytes_per_cycle: usize,
    /// How fast heap threshold should grow
    pub heap_growth_factor: f64,
    /// Length of one incremental sweep slice
    pub sweep_time_slice: Duration,
    /// Duty cycle denominator: a slice runs every `slice / total` seconds.
    pub sweep_time_total: Duration,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            super_region_size: globals::DEFAULT_SUPER_REGION_SIZE,
            spawn_trim_thread: true,
            trim_interval: globals::TRIM_INTERVAL,
            min_bytes_per_cycle: 256 * globals::KB,
            heap_growth_factor: 1.5,
            sweep_time_slice: globals::SWEEP_TIME_SLICE,
            sweep_time_total: globals::SWEEP_TIME_TOTAL,
            verbose: false,
        }
    }
}

/// Report that the OS refused memory and abort.
#[cold]
pub fn out_of_memory(size: usize) -> ! {
    log::error!("out of memory while allocating {} bytes", size);
    std::process::abort()
}

#[cfg(test)]
mod tests;
