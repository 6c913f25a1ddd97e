use std::{mem::size_of, sync::Arc};

use crate::{
    block_allocator::BlockAllocator,
    globals::WORK_LIST_SEGMENT_SIZE,
    region::{BlockClass, BlockType, DeadBlock},
    value::CellPtr,
};

/// Embedder-chosen tag telling a tracer which backing store of a cell to
/// copy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CopyToken(pub u32);

/// A cell whose backing store still has to be evacuated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct CopyWorklistItem {
    pub owner: CellPtr,
    pub token: CopyToken,
}

/// One work-list block. Items are stored in place in the block memory.
pub struct CopyWorkListSegment {
    block: DeadBlock,
    len: usize,
}

impl BlockType for CopyWorkListSegment {
    const CLASS: BlockClass = BlockClass::WorkList;
}

impl CopyWorkListSegment {
    pub const CAPACITY: usize = WORK_LIST_SEGMENT_SIZE / size_of::<CopyWorklistItem>();

    fn new(block: DeadBlock) -> Self {
        debug_assert!(block.size() >= WORK_LIST_SEGMENT_SIZE);
        Self { block, len: 0 }
    }

    fn items(&self) -> *mut CopyWorklistItem {
        self.block.start().cast()
    }

    fn is_full(&self) -> bool {
        self.len == Self::CAPACITY
    }

    fn append(&mut self, item: CopyWorklistItem) {
        debug_assert!(!self.is_full());
        unsafe { self.items().add(self.len).write(item) }
        self.len += 1;
    }

    fn get(&self, index: usize) -> CopyWorklistItem {
        debug_assert!(index < self.len);
        unsafe { self.items().add(index).read() }
    }
}

/// Segmented list of [`CopyWorklistItem`]s backed by work-list blocks from
/// the block allocator. Segments go back to the allocator on drop.
pub struct CopyWorkList {
    block_allocator: Arc<BlockAllocator>,
    segments: Vec<CopyWorkListSegment>,
}

impl CopyWorkList {
    pub fn new(block_allocator: Arc<BlockAllocator>) -> Self {
        Self {
            block_allocator,
            segments: Vec::new(),
        }
    }

    pub fn append(&mut self, item: CopyWorklistItem) {
        let needs_segment = self
            .segments
            .last()
            .map(|segment| segment.is_full())
            .unwrap_or(true);
        if needs_segment {
            let block = self.block_allocator.allocate::<CopyWorkListSegment>();
            self.segments.push(CopyWorkListSegment::new(block));
        }
        if let Some(segment) = self.segments.last_mut() {
            segment.append(item);
        }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|segment| segment.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = CopyWorklistItem> + '_ {
        self.segments
            .iter()
            .flat_map(|segment| (0..segment.len).map(move |index| segment.get(index)))
    }
}

impl Drop for CopyWorkList {
    fn drop(&mut self) {
        for segment in self.segments.drain(..) {
            self.block_allocator.deallocate(segment.block);
        }
    }
}
