//! Bump-allocated space for backing stores.
//!
//! Blocks live in to-space while the mutator allocates. A collection swaps
//! to-space and from-space, lets the copy phase evacuate sparsely used
//! from-space blocks into fresh "loaned" blocks, recycles the evacuated ones
//! and moves the survivors (pinned or not worth copying) back.

use std::{mem::size_of, sync::Arc};

use ahash::AHashMap;

use crate::{
    block_allocator::BlockAllocator,
    copied_block::CopiedBlock,
    copy_work_list::CopyToken,
    globals::*,
    internal::{
        block_list::BlockList,
        slab::{Slab, SlabId},
    },
    value::CellPtr,
};

const ALLOCATION_ALIGNMENT: usize = 8;

/// Bump allocator over one copied block.
pub struct CopiedAllocator {
    block: Option<SlabId>,
    start: usize,
    current: usize,
    end: usize,
    last_allocation: usize,
}

impl Default for CopiedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CopiedAllocator {
    pub const fn new() -> Self {
        Self {
            block: None,
            start: 0,
            current: 0,
            end: 0,
            last_allocation: 0,
        }
    }

    pub fn current_block(&self) -> Option<SlabId> {
        self.block
    }

    pub fn current_capacity(&self) -> usize {
        self.end - self.start
    }

    pub fn current_remaining(&self) -> usize {
        self.end - self.current
    }

    #[inline]
    pub fn try_allocate(&mut self, bytes: usize) -> Option<*mut u8> {
        self.block?;
        let bytes = round_up_to_multiple_of(ALLOCATION_ALIGNMENT, bytes.max(1));
        if self.end - self.current < bytes {
            return None;
        }
        let result = self.current;
        self.current += bytes;
        self.last_allocation = result;
        Some(result as *mut u8)
    }

    /// Grow or shrink the most recent allocation in place. Sizes are rounded
    /// the way `try_allocate` rounds them.
    pub fn try_reallocate(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> bool {
        if self.block.is_none() || ptr as usize != self.last_allocation {
            return false;
        }
        let old_end =
            self.last_allocation + round_up_to_multiple_of(ALLOCATION_ALIGNMENT, old_size.max(1));
        if old_end != self.current {
            return false;
        }
        let new_end =
            self.last_allocation + round_up_to_multiple_of(ALLOCATION_ALIGNMENT, new_size.max(1));
        if new_end > self.end {
            return false;
        }
        self.current = new_end;
        true
    }

    pub fn set_current_block(&mut self, id: SlabId, block: &CopiedBlock) {
        self.block = Some(id);
        self.start = block.start() as usize;
        self.current = self.start + block.size();
        self.end = block.payload_end() as usize;
        self.last_allocation = 0;
    }

    /// Detach from the current block, returning it with its remaining byte
    /// count so the caller can write that back.
    pub fn reset_current_block(&mut self) -> Option<(SlabId, usize)> {
        let block = self.block.take()?;
        let remaining = self.end - self.current;
        *self = Self::new();
        Some((block, remaining))
    }
}

pub struct CopiedSpace {
    block_allocator: Arc<BlockAllocator>,
    blocks: Slab<CopiedBlock>,
    to_space: BlockList,
    from_space: BlockList,
    oversize_blocks: BlockList,
    /// Block start to block, for every block in any list or on loan.
    registry: AHashMap<usize, SlabId>,
    allocator: CopiedAllocator,
    in_copying_phase: bool,
    should_do_copy_phase: bool,
    number_of_loaned_blocks: usize,
    bytes_allocated: usize,
}

impl CopiedSpace {
    pub fn new(block_allocator: Arc<BlockAllocator>) -> Self {
        Self {
            block_allocator,
            blocks: Slab::new(),
            to_space: BlockList::new(),
            from_space: BlockList::new(),
            oversize_blocks: BlockList::new(),
            registry: AHashMap::new(),
            allocator: CopiedAllocator::new(),
            in_copying_phase: false,
            should_do_copy_phase: false,
            number_of_loaned_blocks: 0,
            bytes_allocated: 0,
        }
    }

    pub fn is_oversize(bytes: usize) -> bool {
        bytes > COPIED_MAX_ALLOCATION
    }

    pub fn block(&self, id: SlabId) -> Option<&CopiedBlock> {
        self.blocks.get(id)
    }

    pub fn block_allocator(&self) -> &Arc<BlockAllocator> {
        &self.block_allocator
    }

    /// Bytes of new blocks handed to the mutator since the heap last asked.
    pub fn take_bytes_allocated(&mut self) -> usize {
        std::mem::take(&mut self.bytes_allocated)
    }

    pub fn try_allocate(&mut self, bytes: usize) -> *mut u8 {
        debug_assert!(!self.in_copying_phase);
        if Self::is_oversize(bytes) {
            return self.try_allocate_oversize(bytes);
        }
        if let Some(ptr) = self.allocator.try_allocate(bytes) {
            return ptr;
        }
        self.try_allocate_slow_case(bytes)
    }

    fn try_allocate_slow_case(&mut self, bytes: usize) -> *mut u8 {
        self.allocate_block();
        match self.allocator.try_allocate(bytes) {
            Some(ptr) => ptr,
            None => crate::out_of_memory(bytes),
        }
    }

    fn write_back_current_block(&mut self) {
        if let Some((id, remaining)) = self.allocator.reset_current_block() {
            if let Some(block) = self.blocks.get_mut(id) {
                block.set_remaining(remaining);
            }
        }
    }

    fn allocate_block(&mut self) {
        self.write_back_current_block();
        let block = CopiedBlock::new(self.block_allocator.allocate::<CopiedBlock>(), false);
        self.bytes_allocated += block.payload_capacity();
        let start = block.start() as usize;
        let id = self.blocks.insert(block);
        self.to_space.push_back(&mut self.blocks, id);
        self.registry.insert(start, id);
        self.allocator.set_current_block(id, &self.blocks[id]);
        log::trace!("copied space: new block at {:#x}", start);
    }

    fn try_allocate_oversize(&mut self, bytes: usize) -> *mut u8 {
        let block_size = round_up_to_multiple_of(COPIED_BLOCK_SIZE, bytes);
        let dead = self
            .block_allocator
            .allocate_custom_size(block_size, COPIED_BLOCK_SIZE);
        let mut block = CopiedBlock::new(dead, true);
        block.set_remaining(block.payload_capacity() - round_up_to_multiple_of(ALLOCATION_ALIGNMENT, bytes));
        self.bytes_allocated += block.payload_capacity();
        let start = block.start();
        let id = self.blocks.insert(block);
        self.oversize_blocks.push_back(&mut self.blocks, id);
        self.registry.insert(start as usize, id);
        log::debug!("copied space: oversize block of {} bytes at {:p}", block_size, start);
        start
    }

    /// Resize an allocation, in place when it is the newest one and fits.
    pub fn try_reallocate(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        if old_size >= new_size {
            return ptr;
        }
        if !Self::is_oversize(new_size)
            && !Self::is_oversize(old_size)
            && self.allocator.try_reallocate(ptr, old_size, new_size)
        {
            return ptr;
        }
        let new_ptr = self.try_allocate(new_size);
        unsafe { std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size) };
        if Self::is_oversize(old_size) {
            if let Some(id) = self.block_id_for(ptr) {
                self.free_oversize_block(id);
            }
        }
        new_ptr
    }

    fn free_oversize_block(&mut self, id: SlabId) {
        self.oversize_blocks.remove(&mut self.blocks, id);
        if let Some(block) = self.blocks.remove(id) {
            self.registry.remove(&(block.start() as usize));
            self.block_allocator
                .deallocate_custom_size(block.into_dead_block());
        }
    }

    pub fn block_id_for(&self, ptr: *const u8) -> Option<SlabId> {
        let masked = ptr as usize & !(COPIED_BLOCK_SIZE - 1);
        if let Some(&id) = self.registry.get(&masked) {
            if self.blocks[id].contains(ptr) {
                return Some(id);
            }
        }
        // Interior pointers of oversize blocks past their first chunk.
        self.oversize_blocks
            .ids(&self.blocks)
            .into_iter()
            .find(|&id| self.blocks[id].contains(ptr))
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        !ptr.is_null() && self.block_id_for(ptr).is_some()
    }

    pub fn pin(&self, ptr: *const u8) {
        if let Some(id) = self.block_id_for(ptr) {
            self.blocks[id].pin();
        }
    }

    /// Pin the blocks a conservative root may point into: the start of an
    /// allocation or one value past its end.
    pub fn pin_if_necessary(&self, ptr: *const u8) {
        if self.contains(ptr) {
            self.pin(ptr);
        }
        let back = (ptr as usize).wrapping_sub(2 * size_of::<u64>()) as *const u8;
        if self.contains(back) {
            self.pin(back);
        }
    }

    /// Called from marking for every backing store found alive.
    pub fn report_live_bytes(&self, ptr: *const u8, owner: CellPtr, token: CopyToken, bytes: usize) {
        let id = match self.block_id_for(ptr) {
            Some(id) => id,
            None => return,
        };
        let block = &self.blocks[id];
        if block.is_oversize() {
            block.pin();
            return;
        }
        if block.is_pinned() {
            return;
        }
        block.report_live_bytes(owner, token, bytes, &self.block_allocator);
    }

    /// Swap the semispaces, drop dead oversize blocks and decide whether a
    /// copy phase is worth it given `marked_space_bytes` of other heap.
    pub fn started_copying(&mut self, marked_space_bytes: usize) {
        debug_assert!(!self.in_copying_phase);
        debug_assert_eq!(self.number_of_loaned_blocks, 0);
        self.write_back_current_block();
        std::mem::swap(&mut self.from_space, &mut self.to_space);

        let mut total_live_bytes = 0usize;
        let mut total_usable_bytes = 0usize;
        for id in self.from_space.ids(&self.blocks) {
            let block = &self.blocks[id];
            if !block.is_pinned() && block.can_be_recycled() {
                self.recycle_evacuated_block(id);
                continue;
            }
            total_live_bytes += block.live_bytes();
            total_usable_bytes += block.payload_capacity();
        }

        for id in self.oversize_blocks.ids(&self.blocks) {
            let block = &self.blocks[id];
            if block.is_pinned() {
                total_live_bytes += block.payload_capacity();
                total_usable_bytes += block.payload_capacity();
                block.did_survive_gc();
            } else {
                self.free_oversize_block(id);
            }
        }

        let marked = marked_space_bytes as f64;
        let utilization =
            (total_live_bytes as f64 + marked) / (total_usable_bytes as f64 + marked);
        self.should_do_copy_phase = utilization.is_finite() && utilization <= MIN_HEAP_UTILIZATION;
        log::debug!(
            "copied space: {} live of {} usable bytes, copy phase: {}",
            total_live_bytes,
            total_usable_bytes,
            self.should_do_copy_phase
        );
        if self.should_do_copy_phase {
            self.in_copying_phase = true;
        }
    }

    pub fn should_do_copy_phase(&self) -> bool {
        self.should_do_copy_phase
    }

    pub fn in_copying_phase(&self) -> bool {
        self.in_copying_phase
    }

    pub fn number_of_loaned_blocks(&self) -> usize {
        self.number_of_loaned_blocks
    }

    pub fn from_space_ids(&self) -> Vec<SlabId> {
        self.from_space.ids(&self.blocks)
    }

    fn recycle_evacuated_block(&mut self, id: SlabId) {
        debug_assert!(!self.blocks[id].is_pinned());
        self.from_space.remove(&mut self.blocks, id);
        if let Some(block) = self.blocks.remove(id) {
            self.registry.remove(&(block.start() as usize));
            self.block_allocator.deallocate(block.into_dead_block());
        }
    }

    /// Hand a fresh block to the copy phase. It joins to-space once
    /// [`CopiedSpace::done_filling_block`] is called.
    pub fn allocate_block_for_copying_phase(&mut self) -> SlabId {
        debug_assert!(self.in_copying_phase);
        self.number_of_loaned_blocks += 1;
        let block = CopiedBlock::new_no_zero_fill(self.block_allocator.allocate::<CopiedBlock>(), false);
        let start = block.start() as usize;
        let id = self.blocks.insert(block);
        self.registry.insert(start, id);
        id
    }

    pub fn done_filling_block(&mut self, id: SlabId, remaining: usize) {
        debug_assert!(self.number_of_loaned_blocks > 0);
        if let Some(block) = self.blocks.get_mut(id) {
            block.set_remaining(remaining);
            self.to_space.push_back(&mut self.blocks, id);
        }
        self.number_of_loaned_blocks -= 1;
    }

    pub fn loaned_block(&self, id: SlabId) -> Option<&CopiedBlock> {
        self.blocks.get(id)
    }

    /// Account a completed evacuation of `bytes` that used to live at
    /// `ptr`, recycling the source block once it is empty.
    pub fn did_copy(&mut self, ptr: *const u8, bytes: usize) {
        let id = match self.block_id_for(ptr) {
            Some(id) => id,
            None => return,
        };
        let block = &self.blocks[id];
        debug_assert!(!block.is_oversize());
        debug_assert!(!block.is_pinned());
        if block.did_evacuate_bytes(bytes) {
            self.recycle_evacuated_block(id);
        }
    }

    /// Finish the collection: survivors go back to to-space and allocation
    /// resumes at the head of to-space.
    pub fn done_copying(&mut self) {
        debug_assert_eq!(self.number_of_loaned_blocks, 0);
        debug_assert_eq!(self.in_copying_phase, self.should_do_copy_phase);
        self.in_copying_phase = false;
        while let Some(id) = self.from_space.pop_front(&mut self.blocks) {
            let block = &self.blocks[id];
            block.did_survive_gc();
            self.to_space.push_back(&mut self.blocks, id);
        }
        if let Some(head) = self.to_space.head() {
            self.allocator.set_current_block(head, &self.blocks[head]);
        }
        self.should_do_copy_phase = false;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn oversize_block_count(&self) -> usize {
        self.oversize_blocks.len()
    }

    /// Bytes handed out to the mutator.
    pub fn size(&self) -> usize {
        let mut bytes = 0;
        let current = self.allocator.current_block();
        let count = |id: SlabId, block: &CopiedBlock| {
            if Some(id) == current {
                self.allocator.current_capacity() - self.allocator.current_remaining()
            } else {
                block.size()
            }
        };
        self.to_space.for_each(&self.blocks, |id, block| bytes += count(id, block));
        self.from_space.for_each(&self.blocks, |id, block| bytes += count(id, block));
        self.oversize_blocks
            .for_each(&self.blocks, |_, block| bytes += block.size());
        bytes
    }

    pub fn capacity(&self) -> usize {
        self.blocks
            .iter()
            .map(|(_, block)| block.payload_capacity())
            .sum()
    }

    pub fn allocator(&self) -> &CopiedAllocator {
        &self.allocator
    }

    fn release_all_blocks(&mut self) {
        self.allocator = CopiedAllocator::new();
        self.to_space = BlockList::new();
        self.from_space = BlockList::new();
        self.oversize_blocks = BlockList::new();
        self.registry.clear();
        for block in self.blocks.drain() {
            let oversize = block.is_oversize();
            let dead = block.into_dead_block();
            if oversize {
                self.block_allocator.deallocate_custom_size(dead);
            } else {
                self.block_allocator.deallocate(dead);
            }
        }
    }
}

impl Drop for CopiedSpace {
    fn drop(&mut self) {
        self.release_all_blocks();
    }
}
