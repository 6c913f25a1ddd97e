use std::sync::Arc;

use ahash::AHashSet;
use rand::{thread_rng, Rng};

use super::test_config;
use crate::{
    block_allocator::BlockAllocator,
    copied_space::CopiedSpace,
    globals::SMALL_BLOCK_SIZE,
    error::HeapError,
    handle_block::{HandleBlock, HandleList, HandleNode},
    handle_set::{HandleSet, HandleSlot},
    marked_block::DestructorPolicy,
    marked_space::MarkedSpace,
    region::BlockClass,
    slot_visitor::SlotVisitor,
    value::{CellPtr, Value},
};

fn handle_set() -> HandleSet {
    HandleSet::new(Arc::new(BlockAllocator::new(&test_config())))
}

fn fake_cell(address: usize) -> Value {
    Value::Cell(CellPtr::new(address as *mut u8).unwrap())
}

fn check_partition(set: &HandleSet, live: &[HandleSlot]) {
    let mut strong = 0;
    let mut immediate = 0;
    for &slot in live {
        match set.list_of(slot) {
            Some(HandleList::Strong) => {
                strong += 1;
                assert!(set.get(slot).unwrap().is_cell());
            }
            Some(HandleList::Immediate) => {
                immediate += 1;
                assert!(!set.get(slot).unwrap().is_cell());
            }
            other => panic!("live handle on {:?}", other),
        }
    }
    assert_eq!(set.strong_count(), strong);
    assert_eq!(set.immediate_count(), immediate);
    assert_eq!(
        set.strong_count() + set.immediate_count() + set.free_count(),
        set.capacity()
    );
}

#[test]
pub fn test_handle_lists_partition_nodes() {
    let mut set = handle_set();
    let mut rng = thread_rng();
    let mut live: Vec<HandleSlot> = Vec::new();

    for step in 0..3000 {
        match rng.gen_range(0..4) {
            0 | 1 => live.push(set.allocate()),
            2 if !live.is_empty() => {
                let slot = live[rng.gen_range(0..live.len())];
                let value = match rng.gen_range(0..4) {
                    0 => Value::Empty,
                    1 => Value::Number(step as f64),
                    2 => Value::Boolean(true),
                    _ => fake_cell(0x1000 + step * 16),
                };
                set.set(slot, value).unwrap();
                assert_eq!(set.get(slot), Some(value));
            }
            _ if !live.is_empty() => {
                let slot = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(set.deallocate(slot));
                assert!(!set.is_live_node(slot));
            }
            _ => {}
        }
        check_partition(&set, &live);
    }
    assert_eq!(set.protected_count(), live.len());
}

#[test]
pub fn test_new_handles_are_immediate() {
    let mut set = handle_set();
    let slot = set.allocate();
    assert_eq!(set.list_of(slot), Some(HandleList::Immediate));
    assert_eq!(set.get(slot), Some(Value::Empty));

    set.set(slot, fake_cell(0x4000)).unwrap();
    assert_eq!(set.list_of(slot), Some(HandleList::Strong));
    set.set(slot, fake_cell(0x8000)).unwrap();
    assert_eq!(set.strong_count(), 1);
    set.set(slot, Value::Undefined).unwrap();
    assert_eq!(set.list_of(slot), Some(HandleList::Immediate));
    assert_eq!(set.strong_count(), 0);
}

#[test]
pub fn test_stale_handles_are_rejected() {
    let mut set = handle_set();
    let slot = set.allocate();
    assert!(set.deallocate(slot));
    assert!(!set.deallocate(slot));
    assert_eq!(set.get(slot), None);
    assert!(matches!(
        set.set(slot, Value::Null),
        Err(HeapError::StaleHandle)
    ));

    // The node is recycled under a new generation.
    let reused = set.allocate();
    assert_ne!(reused, slot);
    assert!(set.is_live_node(reused));
    assert!(!set.is_live_node(slot));
}

#[test]
pub fn test_no_writes_during_finalization() {
    let mut set = handle_set();
    let slot = set.allocate();
    set.begin_finalization();
    assert!(set.is_finalizing());
    assert!(matches!(
        set.set(slot, Value::Null),
        Err(HeapError::HandleWriteDuringFinalization)
    ));
    set.end_finalization();
    set.set(slot, Value::Null).unwrap();
}

#[test]
pub fn test_handle_set_grows_by_blocks() {
    let mut set = handle_set();
    let slots: Vec<HandleSlot> = (0..HandleBlock::NODE_COUNT + 1).map(|_| set.allocate()).collect();
    assert_eq!(set.block_count(), 2);
    assert_eq!(set.capacity(), 2 * HandleBlock::NODE_COUNT);
    let unique: AHashSet<HandleSlot> = slots.iter().copied().collect();
    assert_eq!(unique.len(), slots.len());
}

#[test]
pub fn test_strong_handles_are_roots() {
    let block_allocator = Arc::new(BlockAllocator::new(&test_config()));
    let mut marked_space = MarkedSpace::new(block_allocator.clone());
    let copied_space = CopiedSpace::new(block_allocator.clone());
    let mut set = HandleSet::new(block_allocator);

    let id = marked_space.allocator_for(16, DestructorPolicy::None);
    let first = marked_space.allocate_with_new_block(id, 16).unwrap();
    let second = marked_space.try_allocate(id, 16).unwrap().unwrap();
    let rooted = set.allocate();
    set.set(rooted, Value::Cell(first)).unwrap();
    let immediate = set.allocate();
    set.set(immediate, Value::Number(2.0)).unwrap();

    let mut seen = Vec::new();
    set.for_each_strong_handle(|slot, value| seen.push((slot, value)));
    assert_eq!(seen, vec![(rooted, Value::Cell(first))]);

    marked_space.canonicalize_cell_liveness().unwrap();
    marked_space.clear_marks().unwrap();
    let mut visitor = SlotVisitor::new(&marked_space, &copied_space, None);
    set.visit_strong_handles(&mut visitor);
    visitor.drain();
    assert_eq!(visitor.visit_count(), 1);
    assert!(marked_space.is_marked(first));
    assert!(!marked_space.is_marked(second));
}

#[test]
pub fn test_handle_nodes_live_in_block_memory() {
    let block_allocator = BlockAllocator::new(&test_config());
    let mut block = HandleBlock::new(block_allocator.allocate::<HandleBlock>());
    assert_eq!(block.node_count(), HandleBlock::NODE_COUNT);
    let start = block.start() as usize;
    for index in 0..block.node_count() as u32 {
        let node = block.node(index).unwrap();
        assert_eq!(node.list(), HandleList::Free);
        assert!(block.contains(node as *const _ as *const u8));
    }
    let end = block.node(HandleBlock::NODE_COUNT as u32 - 1).unwrap() as *const _ as usize
        + std::mem::size_of_val(block.node(0).unwrap());
    assert!(end <= start + SMALL_BLOCK_SIZE);
    assert!(block.node(HandleBlock::NODE_COUNT as u32).is_none());

    block.node_mut(0).unwrap().value = Value::Number(4.0);
    assert_eq!(block.node(0).unwrap().value(), Value::Number(4.0));
    assert_eq!(unsafe { (start as *const HandleNode).read().value() }, Value::Number(4.0));

    block_allocator.deallocate(block.into_dead_block());
    assert_eq!(block_allocator.blocks_in_use(BlockClass::Small), 0);
}
