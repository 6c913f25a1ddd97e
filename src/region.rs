//! Regions are the unit in which the block allocator talks to the OS.
//!
//! A [`SuperRegion`] is one large reservation carved into `REGION_SIZE`
//! chunks so that heap blocks stay clustered and every normal region base is
//! `REGION_SIZE` aligned. Each [`Region`] is partitioned into equally sized
//! dead block slots. When the reservation runs out a region is backed by a
//! standalone mapping instead (an "excess" region).

use std::ptr::NonNull;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::{
    error::HeapError,
    globals::*,
    internal::{
        block_list::{BlockLink, Linked},
        slab::SlabId,
    },
    mmap::Mmap,
    out_of_memory,
};

pub type RegionId = SlabId;

/// Block size classes pooled by the block allocator.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum BlockClass {
    Copied,
    Marked,
    /// 4KB blocks: weak blocks and handle blocks.
    Small,
    WorkList,
}

impl BlockClass {
    pub const ALL: [BlockClass; 4] = [
        BlockClass::Copied,
        BlockClass::Marked,
        BlockClass::Small,
        BlockClass::WorkList,
    ];

    pub const fn block_size(self) -> usize {
        match self {
            BlockClass::Copied => COPIED_BLOCK_SIZE,
            BlockClass::Marked => MARKED_BLOCK_SIZE,
            BlockClass::Small => SMALL_BLOCK_SIZE,
            BlockClass::WorkList => WORK_LIST_SEGMENT_SIZE,
        }
    }

    pub const fn blocks_per_region(self) -> usize {
        REGION_SIZE / self.block_size()
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Implemented by every typed block that is constructed over a dead block.
pub trait BlockType {
    const CLASS: BlockClass;
}

/// An unconstructed block slot, exclusively owned by whoever holds it.
///
/// Typed blocks keep their dead block for their whole lifetime and give it
/// back to the block allocator when they are destroyed; the memory it names
/// is never allocated twice.
#[derive(Debug)]
pub struct DeadBlock {
    region: RegionId,
    slot: u32,
    start: NonNull<u8>,
    size: usize,
}

// The memory is owned by the region, which outlives every dead block it
// hands out.
unsafe impl Send for DeadBlock {}

impl DeadBlock {
    pub fn region(&self) -> RegionId {
        self.region
    }

    pub fn start(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.start.as_ptr().add(self.size) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.start.as_ptr() as usize && addr < self.end() as usize
    }

    /// Zero the whole block.
    pub fn zero_fill(&mut self) {
        unsafe { std::ptr::write_bytes(self.start.as_ptr(), 0, self.size) }
    }
}

struct SuperRegionInner {
    reservation: Option<Mmap>,
    base: usize,
    chunk_count: usize,
    next_fresh: usize,
    free_chunks: Vec<usize>,
    chunks_in_use: usize,
}

/// One aligned reservation from which normal regions are carved.
pub struct SuperRegion {
    inner: Mutex<SuperRegionInner>,
    size: usize,
}

impl SuperRegion {
    pub fn new(size: usize) -> Self {
        let size = round_up(size, REGION_SIZE);
        let reservation = if size == 0 {
            None
        } else {
            match Mmap::reserve(size, REGION_SIZE) {
                Ok(map) => Some(map),
                Err(err) => {
                    log::warn!("super region reservation of {} bytes failed: {}", size, err);
                    None
                }
            }
        };
        let (base, chunk_count) = match reservation.as_ref() {
            Some(map) => (map.aligned() as usize, size / REGION_SIZE),
            None => (0, 0),
        };
        log::debug!(
            "super region reserved at {:#x}: {} chunks of {} bytes",
            base,
            chunk_count,
            REGION_SIZE
        );
        Self {
            inner: Mutex::new(SuperRegionInner {
                reservation,
                base,
                chunk_count,
                next_fresh: 0,
                free_chunks: Vec::new(),
                chunks_in_use: 0,
            }),
            size: chunk_count * REGION_SIZE,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn chunks_in_use(&self) -> usize {
        self.inner.lock().chunks_in_use
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let inner = self.inner.lock();
        let addr = ptr as usize;
        inner.reservation.is_some()
            && addr >= inner.base
            && addr < inner.base + inner.chunk_count * REGION_SIZE
    }

    /// Hand out one committed `REGION_SIZE` chunk.
    fn allocate_chunk(&self) -> Result<(NonNull<u8>, usize), HeapError> {
        let mut inner = self.inner.lock();
        let chunk = match inner.free_chunks.pop() {
            Some(chunk) => chunk,
            None if inner.next_fresh < inner.chunk_count => {
                inner.next_fresh += 1;
                inner.next_fresh - 1
            }
            None => return Err(HeapError::SuperRegionExhausted),
        };
        let page = (inner.base + chunk * REGION_SIZE) as *mut u8;
        let committed = match inner.reservation.as_ref() {
            Some(map) => map.commit(page, REGION_SIZE),
            None => false,
        };
        if !committed {
            // There is no degraded mode for memory we already reserved.
            out_of_memory(REGION_SIZE);
        }
        inner.chunks_in_use += 1;
        match NonNull::new(page) {
            Some(page) => Ok((page, chunk)),
            None => out_of_memory(REGION_SIZE),
        }
    }

    fn free_chunk(&self, chunk: usize) {
        let mut inner = self.inner.lock();
        let page = (inner.base + chunk * REGION_SIZE) as *mut u8;
        if let Some(map) = inner.reservation.as_ref() {
            if !map.decommit(page, REGION_SIZE) {
                log::trace!("decommit of region chunk {} failed", chunk);
            }
        }
        inner.chunks_in_use -= 1;
        inner.free_chunks.push(chunk);
    }
}

enum RegionMemory {
    Super { chunk: usize },
    Standalone { _map: MmapMut },
}

/// A contiguous span partitioned into `total_blocks` dead block slots.
pub struct Region {
    link: BlockLink,
    memory: RegionMemory,
    base: NonNull<u8>,
    region_size: usize,
    block_size: usize,
    class: Option<BlockClass>,
    total_blocks: usize,
    blocks_in_use: usize,
    dead_blocks: Vec<u32>,
}

unsafe impl Send for Region {}

impl Linked for Region {
    fn link(&self) -> &BlockLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut BlockLink {
        &mut self.link
    }
}

fn map_standalone(size: usize, align: usize) -> Result<(MmapMut, NonNull<u8>), HeapError> {
    let mut map = MmapMut::map_anon(size + align)?;
    let start = map.as_mut_ptr() as usize;
    let base = round_up(start, align) as *mut u8;
    match NonNull::new(base) {
        Some(base) => Ok((map, base)),
        None => Err(HeapError::MapFailed(std::io::Error::from(
            std::io::ErrorKind::OutOfMemory,
        ))),
    }
}

impl Region {
    /// Create a normal region for `class`, preferring the super region and
    /// falling back to a standalone mapping once it is exhausted.
    pub fn create(super_region: &SuperRegion, class: BlockClass) -> Result<Self, HeapError> {
        match super_region.allocate_chunk() {
            Ok((base, chunk)) => Ok(Self::new(
                RegionMemory::Super { chunk },
                base,
                REGION_SIZE,
                class.block_size(),
                Some(class),
            )),
            Err(HeapError::SuperRegionExhausted) => {
                log::warn!("super region exhausted, creating excess region for {:?}", class);
                Self::create_excess(class)
            }
            Err(err) => Err(err),
        }
    }

    /// A normal-sized region backed by its own mapping.
    pub fn create_excess(class: BlockClass) -> Result<Self, HeapError> {
        let (map, base) = map_standalone(REGION_SIZE, REGION_SIZE)?;
        Ok(Self::new(
            RegionMemory::Standalone { _map: map },
            base,
            REGION_SIZE,
            class.block_size(),
            Some(class),
        ))
    }

    /// A region holding exactly one block of `block_size` bytes, aligned to
    /// `alignment`.
    pub fn create_custom_size(block_size: usize, alignment: usize) -> Result<Self, HeapError> {
        let size = round_up_to_multiple_of(alignment, block_size);
        let (map, base) = map_standalone(size, alignment)?;
        Ok(Self::new(
            RegionMemory::Standalone { _map: map },
            base,
            size,
            size,
            None,
        ))
    }

    fn new(
        memory: RegionMemory,
        base: NonNull<u8>,
        region_size: usize,
        block_size: usize,
        class: Option<BlockClass>,
    ) -> Self {
        let mut region = Self {
            link: BlockLink::default(),
            memory,
            base,
            region_size,
            block_size,
            class,
            total_blocks: 0,
            blocks_in_use: 0,
            dead_blocks: Vec::new(),
        };
        region.partition(block_size);
        region
    }

    fn partition(&mut self, block_size: usize) {
        debug_assert!(self.blocks_in_use == 0);
        self.block_size = block_size;
        self.total_blocks = self.region_size / block_size;
        // Pop order is ascending address order.
        self.dead_blocks = (0..self.total_blocks as u32).rev().collect();
    }

    /// Re-partition an empty normal region for a different size class.
    pub fn reset(&mut self, class: BlockClass) {
        debug_assert!(self.is_empty(), "only empty regions can be reset");
        debug_assert!(!self.is_custom_size());
        self.class = Some(class);
        self.partition(class.block_size());
    }

    /// Pop one dead block. The caller must check `is_full()` first.
    pub fn allocate(&mut self, id: RegionId) -> DeadBlock {
        debug_assert!(!self.is_full(), "allocating from a full region");
        let slot = match self.dead_blocks.pop() {
            Some(slot) => slot,
            None => out_of_memory(self.block_size),
        };
        self.blocks_in_use += 1;
        let start = unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(slot as usize * self.block_size))
        };
        DeadBlock {
            region: id,
            slot,
            start,
            size: self.block_size,
        }
    }

    pub fn deallocate(&mut self, block: DeadBlock) {
        debug_assert!(self.blocks_in_use > 0);
        debug_assert!(
            !self.dead_blocks.contains(&block.slot),
            "double free of dead block slot {}",
            block.slot
        );
        debug_assert_eq!(block.size, self.block_size);
        self.dead_blocks.push(block.slot);
        self.blocks_in_use -= 1;
    }

    /// Release the region's memory. Only empty regions may be destroyed.
    pub fn destroy(self, super_region: &SuperRegion) {
        debug_assert!(self.is_empty(), "destroying a region with live blocks");
        if let RegionMemory::Super { chunk } = self.memory {
            super_region.free_chunk(chunk);
        }
    }

    pub fn is_full(&self) -> bool {
        self.blocks_in_use == self.total_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks_in_use == 0
    }

    pub fn is_custom_size(&self) -> bool {
        self.class.is_none()
    }

    pub fn is_excess(&self) -> bool {
        matches!(self.memory, RegionMemory::Standalone { .. }) && !self.is_custom_size()
    }

    pub fn class(&self) -> Option<BlockClass> {
        self.class
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn blocks_in_use(&self) -> usize {
        self.blocks_in_use
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}
