use std::sync::Arc;

use crate::{
    error::HeapResult,
    internal::{
        block_list::BlockList,
        slab::{Slab, SlabId},
    },
    marked_block::{CellDestructor, DestructorPolicy, FreeList, MarkedBlock, SweepMode},
    value::CellPtr,
};

/// Index of an allocator inside its [`MarkedSpace`](crate::marked_space::MarkedSpace).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct AllocatorId(pub(crate) u16);

impl AllocatorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Free-list allocator for one size class and destructor policy.
///
/// Blocks are swept lazily: `blocks_to_sweep` walks the block list and a
/// block is only swept when the allocator runs out of cells. At most one
/// block (`current_block`) is the source of the active free list.
pub struct MarkedAllocator {
    id: AllocatorId,
    /// Zero for the large allocator, whose blocks each have their own size.
    cell_size: usize,
    policy: DestructorPolicy,
    destructor: Option<Arc<dyn CellDestructor>>,
    blocks: Slab<MarkedBlock>,
    block_list: BlockList,
    current_block: Option<SlabId>,
    blocks_to_sweep: Option<SlabId>,
    free_list: FreeList,
    /// Bytes of free lists adopted since the heap last asked.
    adopted_bytes: usize,
}

impl MarkedAllocator {
    pub fn new(id: AllocatorId, cell_size: usize, policy: DestructorPolicy) -> Self {
        Self {
            id,
            cell_size,
            policy,
            destructor: None,
            blocks: Slab::new(),
            block_list: BlockList::new(),
            current_block: None,
            blocks_to_sweep: None,
            free_list: FreeList::empty(),
            adopted_bytes: 0,
        }
    }

    pub fn id(&self) -> AllocatorId {
        self.id
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn is_large(&self) -> bool {
        self.cell_size == 0
    }

    pub fn destructor_policy(&self) -> DestructorPolicy {
        self.policy
    }

    pub fn destructor(&self) -> Option<Arc<dyn CellDestructor>> {
        self.destructor.clone()
    }

    pub fn set_destructor(&mut self, destructor: Arc<dyn CellDestructor>) {
        for (_, block) in self.blocks.iter_mut() {
            block.set_destructor(Some(destructor.clone()));
        }
        self.destructor = Some(destructor);
    }

    pub fn block_count(&self) -> usize {
        self.block_list.len()
    }

    pub fn current_block(&self) -> Option<SlabId> {
        self.current_block
    }

    pub fn next_block_to_sweep(&self) -> Option<SlabId> {
        self.blocks_to_sweep
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub fn block(&self, id: SlabId) -> Option<&MarkedBlock> {
        self.blocks.get(id)
    }

    pub fn block_mut(&mut self, id: SlabId) -> Option<&mut MarkedBlock> {
        self.blocks.get_mut(id)
    }

    pub fn block_ids(&self) -> Vec<SlabId> {
        self.block_list.ids(&self.blocks)
    }

    pub fn for_each_block(&self, visitor: impl FnMut(SlabId, &MarkedBlock)) {
        self.block_list.for_each(&self.blocks, visitor);
    }

    pub fn take_adopted_bytes(&mut self) -> usize {
        std::mem::take(&mut self.adopted_bytes)
    }

    /// Fast path: pop from the active free list, otherwise sweep forward
    /// through the block list. `Ok(None)` means a new block is needed.
    #[inline]
    pub fn try_allocate(&mut self, bytes: usize) -> HeapResult<Option<CellPtr>> {
        if let Some(cell) = self.pop_free_cell() {
            return Ok(Some(cell));
        }
        self.try_allocate_helper(bytes)
    }

    fn pop_free_cell(&mut self) -> Option<CellPtr> {
        let current = self.current_block?;
        let cell = self.free_list.pop()?;
        self.blocks[current].did_allocate(cell);
        Some(cell)
    }

    fn try_allocate_helper(&mut self, bytes: usize) -> HeapResult<Option<CellPtr>> {
        if let Some(current) = self.current_block.take() {
            debug_assert_eq!(Some(current), self.blocks_to_sweep);
            self.blocks[current].did_consume_free_list()?;
            self.blocks_to_sweep = BlockList::next(&self.blocks, current);
        }
        self.free_list = FreeList::empty();

        while let Some(id) = self.blocks_to_sweep {
            let block = &mut self.blocks[id];
            let free_list = block.sweep(SweepMode::SweepToFreeList)?;
            if free_list.is_empty() {
                block.did_consume_free_list()?;
                self.blocks_to_sweep = BlockList::next(&self.blocks, id);
                continue;
            }
            if bytes > block.cell_size() {
                block.canonicalize_cell_liveness(&free_list)?;
                self.blocks_to_sweep = BlockList::next(&self.blocks, id);
                continue;
            }
            self.adopted_bytes += free_list.bytes;
            self.current_block = Some(id);
            self.free_list = free_list;
            break;
        }

        Ok(self.pop_free_cell())
    }

    /// Append a freshly constructed block, make it current and sweep it to
    /// a free list right away.
    pub fn add_block(&mut self, block: MarkedBlock) -> HeapResult<SlabId> {
        debug_assert!(self.current_block.is_none());
        debug_assert_eq!(block.allocator(), self.id);
        let id = self.blocks.insert(block);
        self.block_list.push_back(&mut self.blocks, id);
        self.blocks_to_sweep = Some(id);
        self.current_block = Some(id);
        self.free_list = self.blocks[id].sweep(SweepMode::SweepToFreeList)?;
        self.adopted_bytes += self.free_list.bytes;
        Ok(id)
    }

    /// Unlink a block, keeping the cursors valid.
    pub fn remove_block(&mut self, id: SlabId) -> Option<MarkedBlock> {
        if !self.blocks.contains(id) {
            return None;
        }
        if self.current_block == Some(id) {
            self.current_block = None;
            self.free_list = FreeList::empty();
        }
        if self.blocks_to_sweep == Some(id) {
            self.blocks_to_sweep = BlockList::next(&self.blocks, id);
        }
        self.block_list.remove(&mut self.blocks, id);
        self.blocks.remove(id)
    }

    /// Roll the active free list back into its block.
    pub fn canonicalize_cell_liveness(&mut self) -> HeapResult<()> {
        if let Some(current) = self.current_block.take() {
            let free_list = std::mem::take(&mut self.free_list);
            self.blocks[current].canonicalize_cell_liveness(&free_list)?;
        }
        Ok(())
    }

    /// Start sweeping from the head again. Called after a collection.
    pub fn reset(&mut self) {
        self.current_block = None;
        self.free_list = FreeList::empty();
        self.blocks_to_sweep = self.block_list.head();
    }

    /// Remove every block, e.g. when the space is torn down.
    pub fn drain_blocks(&mut self) -> Vec<MarkedBlock> {
        self.current_block = None;
        self.blocks_to_sweep = None;
        self.free_list = FreeList::empty();
        self.block_list = BlockList::new();
        self.blocks.drain()
    }
}
