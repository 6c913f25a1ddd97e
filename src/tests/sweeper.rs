use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use rand::{thread_rng, Rng};

use super::{counting_destructor, test_config};
use crate::{
    allocation_config::AllocationConfig,
    block_allocator::BlockAllocator,
    globals::*,
    heap_timer::{GcActivityCallback, HeapTimer},
    incremental_sweeper::IncrementalSweeper,
    marked_block::{DestructorPolicy, MarkedBlock},
    marked_space::MarkedSpace,
    Config,
};

/// Fill `blocks` blocks with 64-byte cells and leave them unmarked.
fn space_with_garbage(blocks: usize) -> (MarkedSpace, Arc<std::sync::atomic::AtomicUsize>) {
    let mut space = MarkedSpace::new(Arc::new(BlockAllocator::new(&test_config())));
    let (destructor, count) = counting_destructor();
    space.set_destructor(DestructorPolicy::Normal, destructor);
    let id = space.allocator_for(64, DestructorPolicy::Normal);
    let per_block = MARKED_BLOCK_SIZE / 64;
    for _ in 0..blocks * per_block {
        match space.try_allocate(id, 64).unwrap() {
            Some(_) => {}
            None => {
                space.allocate_with_new_block(id, 64).unwrap();
            }
        }
    }
    space.canonicalize_cell_liveness().unwrap();
    space.clear_marks().unwrap();
    space.reset_allocators();
    (space, count)
}

#[test]
pub fn test_incremental_sweep_visits_every_block_once() {
    let mut rng = thread_rng();
    let (mut space, count) = space_with_garbage(12);
    let blocks = space.block_snapshot();
    assert_eq!(blocks.len(), 12);

    let mut sweeper = IncrementalSweeper::new(&test_config());
    sweeper.start_sweeping(blocks.clone());
    assert!(sweeper.is_sweeping());
    assert!(sweeper.timer().is_scheduled());

    // Uneven slices: each firing sweeps a random number of blocks.
    while sweeper.is_sweeping() {
        for _ in 0..rng.gen_range(1..4) {
            sweeper.sweep_next_block(&mut space).unwrap();
        }
    }
    assert_eq!(sweeper.blocks_swept(), 12);
    assert_eq!(count.load(Ordering::Relaxed), 12 * (MARKED_BLOCK_SIZE / 64));
    // Every block was empty, so each was freed as it was swept.
    assert_eq!(space.block_count(), 0);
    assert!(!sweeper.sweep_next_block(&mut space).unwrap());
}

#[test]
pub fn test_incremental_sweep_skips_stale_blocks() {
    let (mut space, _) = space_with_garbage(4);
    let blocks = space.block_snapshot();
    space.free_block(blocks[1]);

    let mut sweeper = IncrementalSweeper::new(&test_config());
    sweeper.start_sweeping(blocks);
    sweeper.do_sweep(&mut space, Instant::now()).unwrap();
    assert!(!sweeper.is_sweeping());
    assert!(!sweeper.timer().is_scheduled());
    assert_eq!(sweeper.blocks_swept(), 3);
}

#[test]
pub fn test_incremental_sweep_time_slices() {
    let config = Config {
        sweep_time_slice: Duration::ZERO,
        ..test_config()
    };
    let (mut space, _) = space_with_garbage(3);
    let mut sweeper = IncrementalSweeper::new(&config);
    sweeper.start_sweeping(space.block_snapshot());

    // A zero-length slice sweeps one block per firing.
    let mut firings = 0;
    while sweeper.is_sweeping() {
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(sweeper.fire(&mut space, far_future).unwrap());
        firings += 1;
    }
    assert_eq!(firings, 3);
    assert!(!sweeper.fire(&mut space, Instant::now()).unwrap());
}

#[test]
pub fn test_sweeper_follows_the_callers_clock() {
    let config = Config {
        sweep_time_slice: Duration::ZERO,
        ..test_config()
    };
    let (mut space, _) = space_with_garbage(3);
    let mut sweeper = IncrementalSweeper::new(&config);
    sweeper.start_sweeping(space.block_snapshot());

    let base = Instant::now() + Duration::from_secs(3600);
    assert!(sweeper.fire(&mut space, base).unwrap());
    assert_eq!(sweeper.remaining(), 2);
    // The next slice is due relative to `base`, not to the wall clock.
    let next = sweeper.timer().next_fire().unwrap();
    assert!(next >= base);
    assert!(!sweeper.fire(&mut space, Instant::now()).unwrap());
    assert_eq!(sweeper.remaining(), 2);
    assert!(sweeper.fire(&mut space, next).unwrap());
    assert_eq!(sweeper.remaining(), 1);
}

#[test]
pub fn test_will_finish_sweeping_cancels() {
    let (mut space, count) = space_with_garbage(2);
    let mut sweeper = IncrementalSweeper::new(&test_config());
    sweeper.start_sweeping(space.block_snapshot());
    sweeper.will_finish_sweeping();
    sweeper.will_finish_sweeping();
    assert!(!sweeper.is_sweeping());
    assert!(!sweeper.timer().is_scheduled());
    assert_eq!(count.load(Ordering::Relaxed), 0);
    space.sweep().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 2 * (MARKED_BLOCK_SIZE / 64));
}

#[test]
pub fn test_sweeper_interval() {
    let sweeper = IncrementalSweeper::new(&Config::default());
    let interval = sweeper.interval();
    assert!(interval > Duration::from_millis(99) && interval < Duration::from_millis(101));
}

#[test]
pub fn test_heap_timer() {
    let mut timer = HeapTimer::new();
    let now = Instant::now();
    assert!(!timer.is_due(now));
    timer.schedule_at(now + Duration::from_millis(10));
    assert!(timer.is_scheduled());
    assert!(!timer.is_due(now));
    assert!(timer.is_due(now + Duration::from_millis(10)));
    timer.cancel();
    timer.cancel();
    assert!(!timer.is_due(now + Duration::from_secs(1)));
}

#[test]
pub fn test_activity_callback_only_moves_earlier() {
    let mut callback = GcActivityCallback::new();
    let gc_length = Duration::from_millis(10);
    callback.did_allocate(MB, gc_length, 1.0);
    let first = callback.delay().unwrap();
    assert!((first.as_secs_f64() - 1.0).abs() < 1e-6);
    let first_fire = callback.timer().next_fire().unwrap();

    // Less than the slop factor shorter: unchanged.
    callback.did_allocate(MB + MB / 2, gc_length, 1.0);
    assert_eq!(callback.delay(), Some(first));
    assert_eq!(callback.timer().next_fire(), Some(first_fire));

    callback.did_allocate(4 * MB, gc_length, 1.0);
    let second = callback.delay().unwrap();
    assert!(second < first);
    assert!(callback.timer().next_fire().unwrap() < first_fire);

    callback.will_collect();
    assert!(callback.delay().is_none());
    assert!(!callback.timer().is_scheduled());
}

#[test]
pub fn test_activity_callback_disabled() {
    let mut callback = GcActivityCallback::new();
    callback.set_enabled(false);
    callback.did_allocate(8 * MB, Duration::from_millis(5), 0.5);
    assert!(!callback.timer().is_scheduled());
    assert!(!callback.is_due(Instant::now() + Duration::from_secs(60)));
}

#[test]
pub fn test_allocation_budget() {
    let config = Config {
        min_bytes_per_cycle: 1000,
        heap_growth_factor: 2.0,
        ..test_config()
    };
    let mut budget = AllocationConfig::new(&config);
    budget.report_bytes_allocated(600);
    assert!(!budget.should_collect());
    budget.report_bytes_allocated(600);
    assert!(budget.should_collect());
    budget.report_bytes_freed(300);
    assert!(!budget.should_collect());

    let death_rate = budget.update_after_collection(450);
    assert!((death_rate - 0.5).abs() < 1e-9);
    assert_eq!(budget.bytes_allocated, 0);
    assert_eq!(budget.bytes_allocated_limit, 1000);
    assert_eq!(budget.total_bytes_allocated, 1200);

    budget.update_after_collection(5000);
    assert_eq!(budget.bytes_allocated_limit, 10000);
    assert_eq!(budget.proportional_limit(10), 1000);
}

#[test]
pub fn test_block_for_masks_to_block_start() {
    let (space, _) = space_with_garbage(1);
    let id = space.block_snapshot()[0];
    let block = space.block(id).unwrap();
    let start = block.start() as usize;
    let inner = unsafe { block.start().add(MARKED_BLOCK_SIZE - 1) };
    assert_eq!(MarkedBlock::block_for(inner), start);
    assert_eq!(space.block_id_for(inner), Some(id));
    assert!(!space.contains(inner));
}
