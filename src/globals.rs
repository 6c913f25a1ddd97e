use std::time::Duration;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Allocation granularity of marked blocks. Mark bits are kept per atom.
pub const ATOM_SIZE: usize = 16;

/// Every normal region is this large and aligned to this size.
pub const REGION_SIZE: usize = 64 * KB;

pub const MARKED_BLOCK_SIZE: usize = 16 * KB;
pub const ATOMS_PER_BLOCK: usize = MARKED_BLOCK_SIZE / ATOM_SIZE;
pub const COPIED_BLOCK_SIZE: usize = 32 * KB;
/// Shared by weak blocks and handle blocks.
pub const SMALL_BLOCK_SIZE: usize = 4 * KB;
pub const WORK_LIST_SEGMENT_SIZE: usize = 4 * KB;

pub const PRECISE_STEP: usize = ATOM_SIZE;
pub const PRECISE_CUTOFF: usize = 128;
pub const PRECISE_COUNT: usize = PRECISE_CUTOFF / PRECISE_STEP;
pub const IMPRECISE_STEP: usize = 2 * PRECISE_CUTOFF;
pub const IMPRECISE_CUTOFF: usize = MARKED_BLOCK_SIZE / 2;
pub const IMPRECISE_COUNT: usize = IMPRECISE_CUTOFF / IMPRECISE_STEP;

/// Copied-space requests larger than this get their own custom-size block.
pub const COPIED_MAX_ALLOCATION: usize = COPIED_BLOCK_SIZE / 2;
pub const MIN_COPIED_BLOCK_UTILIZATION: f64 = 0.9;
pub const MIN_HEAP_UTILIZATION: f64 = 0.8;

pub const SWEEP_TIME_SLICE: Duration = Duration::from_millis(10);
pub const SWEEP_TIME_TOTAL: Duration = Duration::from_millis(100);

pub const TRIM_INTERVAL: Duration = Duration::from_secs(1);
/// How long the trim worker backs off after it observed an allocation burst.
pub const TRIM_BACKOFF: Duration = Duration::from_millis(50);

pub const DEFAULT_SUPER_REGION_SIZE: usize = 256 * MB;

pub const fn round_up(x: usize, y: usize) -> usize {
    ((x) + (y - 1)) & !(y - 1)
}

pub const fn round_up_to_multiple_of(divisor: usize, x: usize) -> usize {
    ((x + divisor - 1) / divisor) * divisor
}
