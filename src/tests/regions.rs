use std::time::{Duration, Instant};

use rand::{seq::SliceRandom, thread_rng, Rng};

use super::test_config;
use crate::{
    block_allocator::BlockAllocator,
    globals::*,
    internal::slab::Slab,
    marked_block::MarkedBlock,
    region::{BlockClass, DeadBlock, Region, SuperRegion},
    Config,
};

#[test]
pub fn test_region_accounting() {
    let super_region = SuperRegion::new(4 * REGION_SIZE);
    let mut regions = Slab::new();
    let id = regions.insert(Region::create(&super_region, BlockClass::Small).unwrap());
    let total = regions[id].total_blocks();
    assert_eq!(total, REGION_SIZE / SMALL_BLOCK_SIZE);
    assert!(regions[id].is_empty());

    let mut rng = thread_rng();
    let mut live: Vec<DeadBlock> = Vec::new();
    for _ in 0..2000 {
        let region = &mut regions[id];
        let allocate = !region.is_full() && (live.is_empty() || rng.gen_bool(0.55));
        if allocate {
            live.push(region.allocate(id));
        } else {
            let index = rng.gen_range(0..live.len());
            region.deallocate(live.swap_remove(index));
        }
        assert!(region.blocks_in_use() <= region.total_blocks());
        assert_eq!(region.blocks_in_use(), live.len());
        assert_eq!(region.is_full(), live.len() == total);
        assert_eq!(region.is_empty(), live.is_empty());
    }

    for block in live.drain(..) {
        regions[id].deallocate(block);
    }
    regions.remove(id).unwrap().destroy(&super_region);
    assert_eq!(super_region.chunks_in_use(), 0);
}

#[test]
pub fn test_region_round_trip() {
    let super_region = SuperRegion::new(4 * REGION_SIZE);
    let mut regions = Slab::new();
    for class in BlockClass::ALL {
        let id = regions.insert(Region::create(&super_region, class).unwrap());
        let total = regions[id].total_blocks();
        let mut blocks: Vec<DeadBlock> = (0..total).map(|_| regions[id].allocate(id)).collect();
        assert!(regions[id].is_full());

        // Blocks are disjoint and inside the region.
        let base = regions[id].base() as usize;
        for block in &blocks {
            let start = block.start() as usize;
            assert!(start >= base && start + block.size() <= base + REGION_SIZE);
            assert_eq!((start - base) % class.block_size(), 0);
        }

        blocks.shuffle(&mut thread_rng());
        for block in blocks {
            regions[id].deallocate(block);
        }
        assert!(regions[id].is_empty());
        assert_eq!(regions[id].total_blocks(), total);
        regions.remove(id).unwrap().destroy(&super_region);
    }
}

#[test]
pub fn test_region_reset_changes_class() {
    let super_region = SuperRegion::new(REGION_SIZE);
    let mut regions = Slab::new();
    let id = regions.insert(Region::create(&super_region, BlockClass::Copied).unwrap());
    assert_eq!(regions[id].total_blocks(), 2);
    regions[id].reset(BlockClass::Small);
    assert_eq!(regions[id].class(), Some(BlockClass::Small));
    assert_eq!(regions[id].total_blocks(), REGION_SIZE / SMALL_BLOCK_SIZE);
    regions.remove(id).unwrap().destroy(&super_region);
}

#[test]
pub fn test_super_region_exhaustion_falls_back_to_excess() {
    let config = Config {
        super_region_size: 2 * REGION_SIZE,
        ..test_config()
    };
    let allocator = BlockAllocator::new(&config);
    let per_region = BlockClass::Marked.blocks_per_region();
    let blocks: Vec<DeadBlock> = (0..3 * per_region)
        .map(|_| allocator.allocate::<MarkedBlock>())
        .collect();
    assert_eq!(allocator.regions_created(), 3);
    assert_eq!(allocator.excess_regions_created(), 1);
    assert_eq!(allocator.super_region().chunks_in_use(), 2);

    let excess = blocks.last().unwrap();
    assert!(!allocator.super_region().contains(excess.start()));
    assert_eq!(excess.start() as usize % MARKED_BLOCK_SIZE, 0);

    for block in blocks {
        allocator.deallocate(block);
    }
    assert_eq!(allocator.release_free_regions(), 3);
    assert_eq!(allocator.super_region().chunks_in_use(), 0);
}

#[test]
pub fn test_consecutive_allocation_creates_minimal_regions() {
    let config = Config {
        spawn_trim_thread: true,
        trim_interval: Duration::from_millis(5),
        ..test_config()
    };
    let allocator = BlockAllocator::new(&config);
    let blocks: Vec<DeadBlock> = (0..1000)
        .map(|_| allocator.allocate::<MarkedBlock>())
        .collect();
    let per_region = BlockClass::Marked.blocks_per_region();
    assert_eq!(allocator.regions_created(), (1000 + per_region - 1) / per_region);
    assert_eq!(allocator.blocks_in_use(BlockClass::Marked), 1000);

    // Give the worker a few ticks; nothing is empty, so nothing goes.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(allocator.regions_destroyed(), 0);
    assert_eq!(allocator.empty_region_count(), 0);

    for block in blocks {
        allocator.deallocate(block);
    }
}

#[test]
pub fn test_trim_halves_empty_pool() {
    let allocator = BlockAllocator::new(&test_config());
    assert!(!allocator.has_trim_worker());
    let per_region = BlockClass::Marked.blocks_per_region();
    let blocks: Vec<DeadBlock> = (0..16 * per_region)
        .map(|_| allocator.allocate::<MarkedBlock>())
        .collect();
    assert_eq!(allocator.regions_created(), 16);
    for block in blocks {
        allocator.deallocate(block);
    }
    assert_eq!(allocator.empty_region_count(), 16);
    assert_eq!(allocator.blocks_in_use(BlockClass::Marked), 0);

    let mut expected = 16;
    while expected > 0 {
        let released = allocator.trim();
        assert_eq!(released, expected - expected / 2);
        expected /= 2;
        assert_eq!(allocator.empty_region_count(), expected);
    }
    assert_eq!(allocator.regions_destroyed(), 16);
    assert_eq!(allocator.region_count(), 0);
}

#[test]
pub fn test_trim_worker_releases_regions() {
    let config = Config {
        spawn_trim_thread: true,
        trim_interval: Duration::from_millis(5),
        ..test_config()
    };
    let allocator = BlockAllocator::new(&config);
    let blocks: Vec<DeadBlock> = (0..32)
        .map(|_| allocator.allocate::<MarkedBlock>())
        .collect();
    let created = allocator.regions_created();
    for block in blocks {
        allocator.deallocate(block);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while allocator.regions_destroyed() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(allocator.regions_destroyed() > 0);
    assert!(allocator.empty_region_count() < created);
}

#[test]
pub fn test_empty_regions_are_shared_between_classes() {
    let allocator = BlockAllocator::new(&test_config());
    let block = allocator.allocate::<MarkedBlock>();
    allocator.deallocate(block);
    assert_eq!(allocator.empty_region_count(), 1);

    let copied = allocator.allocate_class(BlockClass::Copied);
    assert_eq!(copied.size(), COPIED_BLOCK_SIZE);
    assert_eq!(allocator.regions_created(), 1);
    assert_eq!(allocator.empty_region_count(), 0);
    assert_eq!(allocator.partial_region_count(BlockClass::Copied), 1);

    let second = allocator.allocate_class(BlockClass::Copied);
    assert_eq!(allocator.full_region_count(BlockClass::Copied), 1);
    allocator.deallocate(copied);
    assert_eq!(allocator.partial_region_count(BlockClass::Copied), 1);
    allocator.deallocate(second);
    assert_eq!(allocator.empty_region_count(), 1);
}

#[test]
pub fn test_custom_size_blocks() {
    let allocator = BlockAllocator::new(&test_config());
    let block = allocator.allocate_custom_size(100 * KB, MARKED_BLOCK_SIZE);
    assert!(block.size() >= 100 * KB);
    assert_eq!(block.start() as usize % MARKED_BLOCK_SIZE, 0);
    assert!(allocator.is_custom_size(&block));
    assert_eq!(allocator.custom_region_count(), 1);

    unsafe { std::ptr::write_bytes(block.start(), 0xAB, block.size()) };

    allocator.deallocate_custom_size(block);
    assert_eq!(allocator.custom_region_count(), 0);
    assert_eq!(allocator.regions_destroyed(), 1);
    assert_eq!(allocator.empty_region_count(), 0);
}
