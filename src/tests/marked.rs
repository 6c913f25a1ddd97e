use std::sync::{atomic::Ordering, Arc};

use ahash::AHashMap;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};

use super::{counting_destructor, test_config};
use crate::{
    block_allocator::BlockAllocator,
    error::HeapError,
    globals::*,
    marked_allocator::AllocatorId,
    marked_block::{BlockState, CellDestructor, DestructorPolicy, FreeList, MarkedBlock, SweepMode},
    marked_space::MarkedSpace,
    value::CellPtr,
};

fn new_block(
    allocator: &BlockAllocator,
    cell_size: usize,
    policy: DestructorPolicy,
    destructor: Option<Arc<dyn CellDestructor>>,
) -> MarkedBlock {
    MarkedBlock::new(
        allocator.allocate::<MarkedBlock>(),
        cell_size,
        policy,
        destructor,
        AllocatorId(0),
        false,
    )
}

/// Hand out every cell of a fresh free list.
fn allocate_all(block: &MarkedBlock, free_list: &mut FreeList) -> Vec<CellPtr> {
    let mut cells = Vec::new();
    while let Some(cell) = free_list.pop() {
        block.did_allocate(cell);
        cells.push(cell);
    }
    cells
}

fn cell(block: &MarkedBlock, index: usize) -> CellPtr {
    CellPtr::new(block.cell_at(index)).unwrap()
}

fn check_liveness(block: &MarkedBlock) {
    for index in 0..block.cell_count() {
        let cell = cell(block, index);
        match block.state() {
            BlockState::Allocated => assert!(block.is_live(cell)),
            BlockState::Marked => assert_eq!(
                block.is_live(cell),
                block.is_marked(cell) || block.is_newly_allocated(cell)
            ),
            BlockState::New | BlockState::FreeListed => {}
        }
    }
}

#[test]
pub fn test_block_state_machine() {
    let allocator = BlockAllocator::new(&test_config());
    let mut rng = thread_rng();
    for policy in [DestructorPolicy::None, DestructorPolicy::Normal] {
        let (destructor, _) = counting_destructor();
        let mut block = new_block(&allocator, 64, policy, Some(destructor));
        assert_eq!(block.state(), BlockState::New);

        for _ in 0..500 {
            let before = block.state();
            let result = match rng.gen_range(0..5) {
                0 => block.sweep(SweepMode::SweepToFreeList).map(|_| ()),
                1 => block.did_consume_free_list(),
                2 => block.sweep(SweepMode::SweepOnly).map(|_| ()),
                3 => block.clear_marks(),
                _ => {
                    if block.state() == BlockState::Marked {
                        let index = rng.gen_range(0..block.cell_count());
                        block.set_marked(cell(&block, index));
                    }
                    Ok(())
                }
            };
            let after = block.state();
            match result {
                Ok(()) => assert!(
                    matches!(
                        (before, after),
                        (BlockState::New, BlockState::FreeListed)
                            | (BlockState::FreeListed, BlockState::Allocated)
                            | (BlockState::Allocated, BlockState::Marked)
                            | (BlockState::Marked, BlockState::FreeListed)
                            | (BlockState::Marked, BlockState::Marked)
                    ) || before == after,
                    "illegal transition {:?} -> {:?}",
                    before,
                    after
                ),
                Err(HeapError::InvalidBlockState { state, .. }) => {
                    assert_eq!(state, before);
                    assert_eq!(after, before);
                }
                Err(err) => panic!("unexpected error {}", err),
            }
            check_liveness(&block);
        }
        allocator.deallocate(block.into_dead_block());
    }
}

#[test]
pub fn test_invalid_transitions_are_reported() {
    let allocator = BlockAllocator::new(&test_config());
    let mut block = new_block(&allocator, 32, DestructorPolicy::None, None);
    assert!(block.did_consume_free_list().is_err());
    assert!(block.clear_marks().is_err());

    let free_list = block.sweep(SweepMode::SweepToFreeList).unwrap();
    assert!(block.clear_marks().is_err());
    // Already free-listed: nothing more to hand out.
    assert!(block.sweep(SweepMode::SweepToFreeList).unwrap().is_empty());
    assert_eq!(free_list.len(), block.cell_count());

    block.did_consume_free_list().unwrap();
    assert!(matches!(
        block.sweep(SweepMode::SweepToFreeList),
        Err(HeapError::InvalidBlockState {
            state: BlockState::Allocated,
            ..
        })
    ));
    allocator.deallocate(block.into_dead_block());
}

#[test]
pub fn test_free_list_is_exhaustive() {
    let allocator = BlockAllocator::new(&test_config());
    let mut rng = thread_rng();
    for cell_size in [16, 48, 128, 512, 4096] {
        let mut block = new_block(&allocator, cell_size, DestructorPolicy::None, None);
        let mut free_list = block.sweep(SweepMode::SweepToFreeList).unwrap();
        assert_eq!(free_list.len(), block.cell_count());
        assert_eq!(free_list.bytes, block.cell_count() * block.cell_size());

        // Descending address order.
        let mut previous = usize::MAX;
        free_list.for_each(|cell| {
            assert!((cell as usize) < previous);
            previous = cell as usize;
        });

        allocate_all(&block, &mut free_list);
        block.did_consume_free_list().unwrap();
        block.clear_marks().unwrap();
        let mut marked = 0;
        for index in 0..block.cell_count() {
            if rng.gen_bool(0.4) {
                block.set_marked(cell(&block, index));
                marked += 1;
            }
        }
        let free_list = block.sweep(SweepMode::SweepToFreeList).unwrap();
        assert_eq!(free_list.len() + marked, block.cell_count());
        free_list.for_each(|ptr| assert!(!block.is_marked(CellPtr::new(ptr).unwrap())));
        allocator.deallocate(block.into_dead_block());
    }
}

#[test]
pub fn test_no_double_destruction() {
    let allocator = BlockAllocator::new(&test_config());
    let destroyed: Arc<Mutex<AHashMap<usize, usize>>> = Arc::new(Mutex::new(AHashMap::new()));
    let log = destroyed.clone();
    let destructor: Arc<dyn CellDestructor> = Arc::new(move |cell: CellPtr| {
        *log.lock().entry(cell.addr()).or_insert(0) += 1;
    });
    let mut block = new_block(&allocator, 256, DestructorPolicy::Normal, Some(destructor));
    let mut rng = thread_rng();

    let mut free_list = block.sweep(SweepMode::SweepToFreeList).unwrap();
    assert!(destroyed.lock().is_empty());
    let cells = allocate_all(&block, &mut free_list);
    block.did_consume_free_list().unwrap();

    block.clear_marks().unwrap();
    let survivors: Vec<CellPtr> = cells.iter().copied().filter(|_| rng.gen_bool(0.5)).collect();
    for &survivor in &survivors {
        block.set_marked(survivor);
    }
    block.sweep(SweepMode::SweepOnly).unwrap();
    assert_eq!(destroyed.lock().len(), cells.len() - survivors.len());

    // A second sweep without new allocation destroys nothing.
    block.sweep(SweepMode::SweepOnly).unwrap();
    assert_eq!(destroyed.lock().len(), cells.len() - survivors.len());

    // Everything dies next cycle; only the survivors are destroyed now.
    block.clear_marks().unwrap();
    let free_list = block.sweep(SweepMode::SweepToFreeList).unwrap();
    assert_eq!(free_list.len(), block.cell_count());
    let destroyed = destroyed.lock();
    assert_eq!(destroyed.len(), cells.len());
    assert!(destroyed.values().all(|&count| count == 1));
    drop(destroyed);
    allocator.deallocate(block.into_dead_block());
}

#[test]
pub fn test_unmarked_cell_is_destroyed() {
    let allocator = BlockAllocator::new(&test_config());
    let (destructor, count) = counting_destructor();
    let mut block = new_block(&allocator, 64, DestructorPolicy::Normal, Some(destructor));
    let mut free_list = block.sweep(SweepMode::SweepToFreeList).unwrap();
    let cell = free_list.pop().unwrap();
    block.did_allocate(cell);

    block.canonicalize_cell_liveness(&free_list).unwrap();
    assert_eq!(block.state(), BlockState::Marked);
    assert!(block.is_live(cell));

    block.clear_marks().unwrap();
    assert!(!block.is_live(cell));
    block.sweep(SweepMode::SweepOnly).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(block.marks_count(), 0);
    assert!(block.is_empty());
    allocator.deallocate(block.into_dead_block());
}

#[test]
pub fn test_canonicalize_keeps_free_cells_dead() {
    let allocator = BlockAllocator::new(&test_config());
    let mut block = new_block(&allocator, 32, DestructorPolicy::None, None);
    let mut free_list = block.sweep(SweepMode::SweepToFreeList).unwrap();
    let first = free_list.pop().unwrap();
    let second = free_list.pop().unwrap();
    block.did_allocate(first);
    block.did_allocate(second);
    block.canonicalize_cell_liveness(&free_list).unwrap();

    assert_eq!(block.live_cell_count(), 2);
    assert!(block.has_newly_allocated());
    let mut dead = 0;
    block.for_each_dead_cell(|cell| {
        assert!(block.is_zapped(cell));
        dead += 1;
    });
    assert_eq!(dead, block.cell_count() - 2);
    allocator.deallocate(block.into_dead_block());
}

#[test]
pub fn test_last_chance_to_finalize_block() {
    let allocator = BlockAllocator::new(&test_config());
    let (destructor, count) = counting_destructor();
    let mut block = new_block(&allocator, 128, DestructorPolicy::Normal, Some(destructor));
    let mut free_list = block.sweep(SweepMode::SweepToFreeList).unwrap();
    let cells = allocate_all(&block, &mut free_list);
    block.did_consume_free_list().unwrap();
    block.last_chance_to_finalize().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), cells.len());
    block.last_chance_to_finalize().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), cells.len());
    allocator.deallocate(block.into_dead_block());
}

#[test]
pub fn test_allocator_size_classes() {
    let space = MarkedSpace::new(Arc::new(BlockAllocator::new(&test_config())));
    for bytes in [1, 16, 17, 100, 128, 129, 1000, 4096, IMPRECISE_CUTOFF] {
        let id = space.allocator_for(bytes, DestructorPolicy::None);
        let allocator = space.allocator(id);
        assert!(!allocator.is_large());
        assert!(allocator.cell_size() >= bytes);
        assert_eq!(allocator.destructor_policy(), DestructorPolicy::None);
    }
    assert_eq!(space.allocator(space.allocator_for(16, DestructorPolicy::None)).cell_size(), 16);
    assert_eq!(space.allocator(space.allocator_for(129, DestructorPolicy::None)).cell_size(), 256);
    let large = space.allocator_for(IMPRECISE_CUTOFF + 1, DestructorPolicy::Normal);
    assert!(space.allocator(large).is_large());
    assert_eq!(space.allocator(large).destructor_policy(), DestructorPolicy::Normal);
}

fn allocate(space: &mut MarkedSpace, bytes: usize, policy: DestructorPolicy) -> CellPtr {
    let id = space.allocator_for(bytes, policy);
    match space.try_allocate(id, bytes).unwrap() {
        Some(cell) => cell,
        None => space.allocate_with_new_block(id, bytes).unwrap(),
    }
}

#[test]
pub fn test_marked_space_allocation_and_sweep() {
    let mut space = MarkedSpace::new(Arc::new(BlockAllocator::new(&test_config())));
    let (destructor, count) = counting_destructor();
    space.set_destructor(DestructorPolicy::Normal, destructor);

    let cells: Vec<CellPtr> = (0..2000)
        .map(|_| allocate(&mut space, 48, DestructorPolicy::Normal))
        .collect();
    let cell_size = space
        .allocator(space.allocator_for(48, DestructorPolicy::Normal))
        .cell_size();
    let per_block = MARKED_BLOCK_SIZE / cell_size;
    assert_eq!(space.block_count(), (2000 + per_block - 1) / per_block);
    assert!(space.take_adopted_bytes() >= 2000 * cell_size);
    for cell in &cells {
        assert!(space.contains(cell.as_ptr()));
        assert!(space.block_for_cell(*cell).is_some());
    }

    space.canonicalize_cell_liveness().unwrap();
    assert_eq!(space.object_count(), 2000);
    space.clear_marks().unwrap();
    for cell in cells.iter().step_by(2) {
        assert!(!space.test_and_set_marked(*cell));
        assert!(space.test_and_set_marked(*cell));
    }
    space.sweep().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 1000);
    assert_eq!(space.object_count(), 1000);
    assert_eq!(space.size(), 1000 * cell_size);
    for (index, cell) in cells.iter().enumerate() {
        assert_eq!(space.is_live(*cell), index % 2 == 0);
    }

    // Freed cells are handed out again before any new block.
    space.reset_allocators();
    let blocks = space.block_count();
    for _ in 0..1000 {
        allocate(&mut space, 48, DestructorPolicy::Normal);
    }
    assert_eq!(space.block_count(), blocks);
    assert_eq!(count.load(Ordering::Relaxed), 1000);
}

#[test]
pub fn test_marked_space_shrink() {
    let block_allocator = Arc::new(BlockAllocator::new(&test_config()));
    let mut space = MarkedSpace::new(block_allocator.clone());
    for _ in 0..3000 {
        allocate(&mut space, 64, DestructorPolicy::None);
    }
    let large = allocate(&mut space, 64 * KB, DestructorPolicy::None);
    assert!(space.block_for_cell(large).unwrap().is_large());
    assert_eq!(block_allocator.custom_region_count(), 1);

    let blocks = space.block_count();
    assert!(blocks > 2);
    space.canonicalize_cell_liveness().unwrap();
    space.clear_marks().unwrap();
    space.sweep().unwrap();
    assert_eq!(space.shrink(), blocks);
    assert_eq!(space.block_count(), 0);
    assert_eq!(block_allocator.custom_region_count(), 0);
    assert_eq!(block_allocator.blocks_in_use(crate::region::BlockClass::Marked), 0);
    assert!(!space.contains(large.as_ptr()));
}

#[test]
pub fn test_foreign_pointers_are_not_cells() {
    let mut space = MarkedSpace::new(Arc::new(BlockAllocator::new(&test_config())));
    let cell = allocate(&mut space, 32, DestructorPolicy::None);
    let mut local = 0u64;
    let foreign = CellPtr::new(&mut local as *mut u64 as *mut u8).unwrap();
    assert!(!space.contains(foreign.as_ptr()));
    assert!(space.test_and_set_marked(foreign));
    // Interior pointers do not name a cell.
    assert!(!space.contains(unsafe { cell.as_ptr().add(8) }));
}
