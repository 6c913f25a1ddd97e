use std::sync::Arc;

use crate::{
    block_allocator::BlockAllocator,
    internal::{
        block_list::BlockList,
        slab::{Slab, SlabId},
    },
    marked_space::MarkedSpace,
    slot_visitor::SlotVisitor,
    value::Value,
    weak_block::WeakBlock,
    weak_impl::{WeakHandleOwner, WeakImpl, WeakImplState},
};

/// Names one weak slot. Stale once the slot is deallocated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WeakHandle {
    block: SlabId,
    slot: u32,
    generation: u32,
}

impl WeakHandle {
    pub fn block(&self) -> SlabId {
        self.block
    }

    pub fn slot_index(&self) -> u32 {
        self.slot
    }
}

/// The heap's pool of weak blocks.
pub struct WeakSet {
    block_allocator: Arc<BlockAllocator>,
    blocks: Slab<WeakBlock>,
    block_list: BlockList,
    /// Free slots of one block being allocated from.
    allocator: Option<(SlabId, u32)>,
    next_allocator: Option<SlabId>,
}

impl WeakSet {
    pub fn new(block_allocator: Arc<BlockAllocator>) -> Self {
        Self {
            block_allocator,
            blocks: Slab::new(),
            block_list: BlockList::new(),
            allocator: None,
            next_allocator: None,
        }
    }

    pub fn allocate(
        &mut self,
        value: Value,
        owner: Option<Arc<dyn WeakHandleOwner>>,
        context: usize,
    ) -> WeakHandle {
        let (block, slot) = match self.allocator {
            Some(cursor) => cursor,
            None => self.find_allocator(),
        };
        let weak_block = &mut self.blocks[block];
        let weak = match weak_block.slot_mut(slot) {
            Some(weak) => weak,
            None => unreachable!("weak free list points outside its block"),
        };
        self.allocator = weak.next_free().map(|next| (block, next));
        weak.initialize(value, owner, context);
        WeakHandle {
            block,
            slot,
            generation: weak.generation(),
        }
    }

    fn find_allocator(&mut self) -> (SlabId, u32) {
        if let Some(cursor) = self.try_find_allocator() {
            return cursor;
        }
        self.add_allocator()
    }

    fn try_find_allocator(&mut self) -> Option<(SlabId, u32)> {
        while let Some(id) = self.next_allocator {
            self.next_allocator = BlockList::next(&self.blocks, id);
            let result = self.blocks[id].take_sweep_result();
            if let Some(head) = result.and_then(|result| result.free_list) {
                return Some((id, head));
            }
        }
        None
    }

    fn add_allocator(&mut self) -> (SlabId, u32) {
        let block = WeakBlock::new(self.block_allocator.allocate::<WeakBlock>());
        let id = self.blocks.insert(block);
        self.block_list.push_back(&mut self.blocks, id);
        log::trace!("weak set: added block {:?}", id);
        match self.blocks[id].take_sweep_result().and_then(|result| result.free_list) {
            Some(head) => (id, head),
            None => unreachable!("a fresh weak block has free slots"),
        }
    }

    fn slot(&self, handle: WeakHandle) -> Option<&WeakImpl> {
        self.blocks
            .get(handle.block)
            .and_then(|block| block.slot(handle.slot))
            .filter(|weak| weak.generation() == handle.generation)
    }

    /// The referent, while the slot is `Live`.
    pub fn get(&self, handle: WeakHandle) -> Option<Value> {
        self.slot(handle)
            .filter(|weak| weak.state() == WeakImplState::Live)
            .map(|weak| weak.value())
    }

    pub fn state(&self, handle: WeakHandle) -> Option<WeakImplState> {
        self.slot(handle).map(|weak| weak.state())
    }

    /// Drop a weak reference. The slot is reused after the next sweep.
    pub fn deallocate(&mut self, handle: WeakHandle) -> bool {
        let weak = self
            .blocks
            .get_mut(handle.block)
            .and_then(|block| block.slot_mut(handle.slot))
            .filter(|weak| weak.generation() == handle.generation);
        match weak {
            Some(weak) if weak.state() != WeakImplState::Deallocated => {
                weak.deallocate();
                true
            }
            _ => false,
        }
    }

    pub fn visit(&self, visitor: &mut SlotVisitor<'_>) {
        self.block_list
            .for_each(&self.blocks, |_, block| block.visit(visitor));
    }

    pub fn reap(&mut self, space: &MarkedSpace) {
        for id in self.block_list.ids(&self.blocks) {
            self.blocks[id].reap(space);
        }
    }

    pub fn sweep(&mut self) {
        for id in self.block_list.ids(&self.blocks) {
            self.blocks[id].sweep();
        }
        self.reset_allocator();
    }

    /// Return fully free blocks to the block allocator.
    pub fn shrink(&mut self) -> usize {
        let mut freed = 0;
        for id in self.block_list.ids(&self.blocks) {
            if self.blocks[id].is_empty() {
                self.remove_and_free_block(id);
                freed += 1;
            }
        }
        self.reset_allocator();
        freed
    }

    fn remove_and_free_block(&mut self, id: SlabId) {
        self.block_list.remove(&mut self.blocks, id);
        if let Some(block) = self.blocks.remove(id) {
            self.block_allocator.deallocate(block.into_dead_block());
        }
    }

    pub fn reset_allocator(&mut self) {
        self.allocator = None;
        self.next_allocator = self.block_list.head();
    }

    pub fn last_chance_to_finalize(&mut self) {
        for id in self.block_list.ids(&self.blocks) {
            self.blocks[id].last_chance_to_finalize();
        }
    }

    pub fn block_count(&self) -> usize {
        self.block_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_list.is_empty()
    }

    pub fn live_count(&self) -> usize {
        let mut count = 0;
        self.block_list
            .for_each(&self.blocks, |_, block| count += block.live_count());
        count
    }
}

impl Drop for WeakSet {
    fn drop(&mut self) {
        for id in self.block_list.ids(&self.blocks) {
            self.remove_and_free_block(id);
        }
    }
}
