//! All marked allocators of a heap plus the global block registry.
//!
//! Allocators are segregated by destructor policy, and within one policy by
//! size class: precise classes every `PRECISE_STEP` bytes up to
//! `PRECISE_CUTOFF`, imprecise classes every `IMPRECISE_STEP` bytes up to
//! `IMPRECISE_CUTOFF`, and one large allocator for everything bigger.

use std::sync::Arc;

use ahash::AHashMap;

use crate::{
    block_allocator::BlockAllocator,
    error::HeapResult,
    globals::*,
    internal::slab::SlabId,
    marked_allocator::{AllocatorId, MarkedAllocator},
    marked_block::{
        BlockState, CellDestructor, DestructorPolicy, MarkedBlock, SweepMode,
    },
    out_of_memory,
    value::CellPtr,
};

const ALLOCATORS_PER_POLICY: usize = PRECISE_COUNT + IMPRECISE_COUNT + 1;

/// Names one marked block: the allocator that owns it and its slot there.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MarkedBlockId {
    pub allocator: AllocatorId,
    pub block: SlabId,
}

pub struct MarkedSpace {
    block_allocator: Arc<BlockAllocator>,
    allocators: Vec<MarkedAllocator>,
    /// Block start address to block. Every block, large ones included, is
    /// `MARKED_BLOCK_SIZE` aligned.
    registry: AHashMap<usize, MarkedBlockId>,
}

impl MarkedSpace {
    pub fn new(block_allocator: Arc<BlockAllocator>) -> Self {
        let mut allocators = Vec::with_capacity(ALLOCATORS_PER_POLICY * DestructorPolicy::ALL.len());
        for policy in DestructorPolicy::ALL {
            let sizes = (1..=PRECISE_COUNT)
                .map(|i| i * PRECISE_STEP)
                .chain((1..=IMPRECISE_COUNT).map(|i| i * IMPRECISE_STEP))
                .chain(std::iter::once(0));
            for cell_size in sizes {
                let id = AllocatorId(allocators.len() as u16);
                allocators.push(MarkedAllocator::new(id, cell_size, policy));
            }
        }
        Self {
            block_allocator,
            allocators,
            registry: AHashMap::new(),
        }
    }

    pub fn block_allocator(&self) -> &Arc<BlockAllocator> {
        &self.block_allocator
    }

    /// Pick the allocator serving `bytes` for `policy`.
    pub fn allocator_for(&self, bytes: usize, policy: DestructorPolicy) -> AllocatorId {
        let bytes = bytes.max(1);
        let class = if bytes <= PRECISE_CUTOFF {
            (bytes - 1) / PRECISE_STEP
        } else if bytes <= IMPRECISE_CUTOFF {
            PRECISE_COUNT + (bytes - 1) / IMPRECISE_STEP
        } else {
            PRECISE_COUNT + IMPRECISE_COUNT
        };
        AllocatorId((policy.index() * ALLOCATORS_PER_POLICY + class) as u16)
    }

    pub fn allocator(&self, id: AllocatorId) -> &MarkedAllocator {
        &self.allocators[id.index()]
    }

    pub fn allocator_mut(&mut self, id: AllocatorId) -> &mut MarkedAllocator {
        &mut self.allocators[id.index()]
    }

    pub fn allocators(&self) -> &[MarkedAllocator] {
        &self.allocators
    }

    pub fn set_destructor(&mut self, policy: DestructorPolicy, destructor: Arc<dyn CellDestructor>) {
        for allocator in self
            .allocators
            .iter_mut()
            .filter(|allocator| allocator.destructor_policy() == policy)
        {
            allocator.set_destructor(destructor.clone());
        }
    }

    pub fn try_allocate(&mut self, id: AllocatorId, bytes: usize) -> HeapResult<Option<CellPtr>> {
        self.allocators[id.index()].try_allocate(bytes)
    }

    /// Slow path of last resort: get a new block for `id`, sweep it and
    /// allocate from it.
    pub fn allocate_with_new_block(&mut self, id: AllocatorId, bytes: usize) -> HeapResult<CellPtr> {
        self.add_block(id, bytes)?;
        match self.allocators[id.index()].try_allocate(bytes)? {
            Some(cell) => Ok(cell),
            None => out_of_memory(bytes),
        }
    }

    fn add_block(&mut self, id: AllocatorId, bytes: usize) -> HeapResult<MarkedBlockId> {
        let allocator = &mut self.allocators[id.index()];
        let policy = allocator.destructor_policy();
        let block = if allocator.is_large() {
            let cell_size = round_up_to_multiple_of(ATOM_SIZE, bytes);
            let block_size = round_up_to_multiple_of(MARKED_BLOCK_SIZE, cell_size);
            let dead = self
                .block_allocator
                .allocate_custom_size(block_size, MARKED_BLOCK_SIZE);
            MarkedBlock::new(dead, cell_size, policy, allocator.destructor(), id, true)
        } else {
            let dead = self.block_allocator.allocate::<MarkedBlock>();
            MarkedBlock::new(
                dead,
                allocator.cell_size(),
                policy,
                allocator.destructor(),
                id,
                false,
            )
        };
        let start = block.start() as usize;
        let block = allocator.add_block(block)?;
        let block_id = MarkedBlockId {
            allocator: id,
            block,
        };
        self.registry.insert(start, block_id);
        Ok(block_id)
    }

    /// Unlink a block and return its memory to the block allocator.
    pub fn free_block(&mut self, id: MarkedBlockId) {
        let block = match self.allocators[id.allocator.index()].remove_block(id.block) {
            Some(block) => block,
            None => return,
        };
        self.registry.remove(&(block.start() as usize));
        self.release_block(block);
    }

    fn release_block(&self, block: MarkedBlock) {
        log::trace!("freeing marked block at {:p}", block.start());
        let is_large = block.is_large();
        let dead = block.into_dead_block();
        if is_large {
            self.block_allocator.deallocate_custom_size(dead);
        } else {
            self.block_allocator.deallocate(dead);
        }
    }

    /// Free `id` if nothing in it survived.
    pub fn free_or_shrink(&mut self, id: MarkedBlockId) -> bool {
        let empty = self.block(id).map(|block| block.is_empty()).unwrap_or(false);
        if empty {
            self.free_block(id);
        }
        empty
    }

    /// Return every empty block to the block allocator.
    pub fn shrink(&mut self) -> usize {
        let empty: Vec<MarkedBlockId> = self
            .block_snapshot()
            .into_iter()
            .filter(|&id| self.block(id).map(|block| block.is_empty()).unwrap_or(false))
            .collect();
        for &id in &empty {
            self.free_block(id);
        }
        if !empty.is_empty() {
            log::debug!("shrink freed {} empty marked blocks", empty.len());
        }
        empty.len()
    }

    pub fn block(&self, id: MarkedBlockId) -> Option<&MarkedBlock> {
        self.allocators
            .get(id.allocator.index())
            .and_then(|allocator| allocator.block(id.block))
    }

    pub fn block_mut(&mut self, id: MarkedBlockId) -> Option<&mut MarkedBlock> {
        self.allocators
            .get_mut(id.allocator.index())
            .and_then(|allocator| allocator.block_mut(id.block))
    }

    /// Sweep one block, skipping stale ids and blocks that do not need it.
    pub fn sweep_block(&mut self, id: MarkedBlockId, mode: SweepMode) -> HeapResult<bool> {
        match self.block_mut(id) {
            Some(block) if block.needs_sweeping() => block.sweep(mode).map(|_| true),
            _ => Ok(false),
        }
    }

    pub fn block_snapshot(&self) -> Vec<MarkedBlockId> {
        let mut snapshot = Vec::with_capacity(self.registry.len());
        self.for_each_block(|id, _| snapshot.push(id));
        snapshot
    }

    pub fn for_each_block(&self, mut visitor: impl FnMut(MarkedBlockId, &MarkedBlock)) {
        for allocator in &self.allocators {
            let allocator_id = allocator.id();
            allocator.for_each_block(|block, marked| {
                visitor(
                    MarkedBlockId {
                        allocator: allocator_id,
                        block,
                    },
                    marked,
                )
            });
        }
    }

    pub fn for_each_live_cell(&self, mut visitor: impl FnMut(CellPtr)) {
        self.for_each_block(|_, block| block.for_each_live_cell(&mut visitor));
    }

    pub fn for_each_dead_cell(&self, mut visitor: impl FnMut(CellPtr)) {
        self.for_each_block(|_, block| block.for_each_dead_cell(&mut visitor));
    }

    pub fn block_count(&self) -> usize {
        self.registry.len()
    }

    /// Cells reported live by their blocks.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        self.for_each_block(|_, block| count += block.live_cell_count());
        count
    }

    /// Bytes in marked cells.
    pub fn size(&self) -> usize {
        let mut bytes = 0;
        self.for_each_block(|_, block| bytes += block.marked_bytes());
        bytes
    }

    /// Bytes of block memory held by this space.
    pub fn capacity(&self) -> usize {
        let mut bytes = 0;
        self.for_each_block(|_, block| bytes += block.block_size());
        bytes
    }

    pub fn block_id_for(&self, ptr: *const u8) -> Option<MarkedBlockId> {
        self.registry.get(&MarkedBlock::block_for(ptr)).copied()
    }

    pub fn block_for_cell(&self, cell: CellPtr) -> Option<&MarkedBlock> {
        self.block_id_for(cell.as_ptr())
            .and_then(|id| self.block(id))
            .filter(|block| block.contains_cell(cell.as_ptr()))
    }

    /// Whether `ptr` is the start of a cell in one of this space's blocks.
    pub fn contains(&self, ptr: *const u8) -> bool {
        CellPtr::new(ptr as *mut u8)
            .and_then(|cell| self.block_for_cell(cell))
            .is_some()
    }

    /// Whether `ptr` points at the start of a cell holding an object, in any
    /// phase of a collection.
    pub fn holds_object(&self, ptr: *const u8) -> bool {
        self.block_id_for(ptr)
            .and_then(|id| self.block(id))
            .map(|block| block.holds_object(ptr))
            .unwrap_or(false)
    }

    pub fn is_live(&self, cell: CellPtr) -> bool {
        self.block_for_cell(cell)
            .map(|block| block.is_live(cell))
            .unwrap_or(false)
    }

    pub fn is_marked(&self, cell: CellPtr) -> bool {
        self.block_for_cell(cell)
            .map(|block| block.is_marked(cell))
            .unwrap_or(false)
    }

    /// Returns whether the cell was already marked. Unknown pointers count
    /// as marked so tracers never follow them.
    pub fn test_and_set_marked(&self, cell: CellPtr) -> bool {
        self.block_for_cell(cell)
            .map(|block| block.test_and_set_marked(cell))
            .unwrap_or(true)
    }

    pub fn set_marked(&self, cell: CellPtr) -> bool {
        self.block_for_cell(cell)
            .map(|block| block.set_marked(cell))
            .unwrap_or(true)
    }

    pub fn take_adopted_bytes(&mut self) -> usize {
        self.allocators
            .iter_mut()
            .map(|allocator| allocator.take_adopted_bytes())
            .sum()
    }

    pub fn canonicalize_cell_liveness(&mut self) -> HeapResult<()> {
        for allocator in &mut self.allocators {
            allocator.canonicalize_cell_liveness()?;
        }
        Ok(())
    }

    /// Clear mark bits everywhere before tracing. Blocks that were never
    /// swept have nothing to clear.
    pub fn clear_marks(&mut self) -> HeapResult<()> {
        for allocator in &mut self.allocators {
            for id in allocator.block_ids() {
                if let Some(block) = allocator.block_mut(id) {
                    if block.state() != BlockState::New {
                        block.clear_marks()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Synchronously sweep every block that needs it.
    pub fn sweep(&mut self) -> HeapResult<()> {
        for id in self.block_snapshot() {
            self.sweep_block(id, SweepMode::SweepOnly)?;
        }
        Ok(())
    }

    pub fn reset_allocators(&mut self) {
        for allocator in &mut self.allocators {
            allocator.reset();
        }
    }

    /// Destroy every remaining object and free all blocks.
    pub fn last_chance_to_finalize(&mut self) -> HeapResult<()> {
        self.canonicalize_cell_liveness()?;
        for id in self.block_snapshot() {
            if let Some(block) = self.block_mut(id) {
                block.last_chance_to_finalize()?;
            }
        }
        self.release_all_blocks();
        Ok(())
    }

    fn release_all_blocks(&mut self) {
        self.registry.clear();
        let mut blocks = Vec::new();
        for allocator in &mut self.allocators {
            blocks.extend(allocator.drain_blocks());
        }
        for block in blocks {
            self.release_block(block);
        }
    }
}

impl Drop for MarkedSpace {
    fn drop(&mut self) {
        self.release_all_blocks();
    }
}
