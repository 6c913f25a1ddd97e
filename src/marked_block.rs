//! Fixed-capacity arena of equally sized cells.
//!
//! A marked block keeps all of its metadata (mark bits, newly allocated
//! bits, zap bits and the state machine) outside the cell memory; cells
//! occupy the whole dead block they are constructed over. Cell `i` starts
//! at `start + i * cell_size` and every per-cell bitmap is indexed by `i`.
//!
//! State machine:
//!
//! ```text
//! New --sweep(to free list)--> FreeListed --did_consume_free_list--> Allocated
//!                                   |                                    |
//!                        canonicalize_cell_liveness                 clear_marks
//!                                   v                                    v
//!                                 Marked <------------ clear_marks ---- Marked
//!                                   |
//!                     sweep(only) stays Marked, sweep(to free list) -> FreeListed
//!
//! Sweeping a `New` block without building a free list leaves it `New`.
//! ```

use std::{ptr::null_mut, sync::Arc};

use modular_bitfield::prelude::*;

use crate::{
    error::{HeapError, HeapResult},
    globals::*,
    internal::{
        block_list::{BlockLink, Linked},
        space_bitmap::SpaceBitmap,
    },
    marked_allocator::AllocatorId,
    region::{BlockClass, BlockType, DeadBlock},
    value::CellPtr,
};

#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, Debug)]
#[bits = 2]
pub enum BlockState {
    New,
    FreeListed,
    Allocated,
    Marked,
}

/// What has to happen to a dead cell before its memory is reused.
#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[bits = 2]
pub enum DestructorPolicy {
    None,
    Normal,
    ImmortalStructure,
}

impl DestructorPolicy {
    pub const ALL: [DestructorPolicy; 3] = [
        DestructorPolicy::None,
        DestructorPolicy::Normal,
        DestructorPolicy::ImmortalStructure,
    ];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepMode {
    SweepOnly,
    SweepToFreeList,
}

/// Finalizes one dead cell. Installed per allocator, so every block of a
/// size class and policy shares it.
pub trait CellDestructor: Send + Sync {
    fn destroy(&self, cell: CellPtr);
}

impl<F> CellDestructor for F
where
    F: Fn(CellPtr) + Send + Sync,
{
    fn destroy(&self, cell: CellPtr) {
        self(cell)
    }
}

#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
struct BlockFlags {
    state: BlockState,
    destructor: DestructorPolicy,
    has_newly_allocated: bool,
    is_large: bool,
    #[skip]
    __: B2,
}

/// Entry of a free list, written into the free cell itself.
#[repr(C)]
pub struct FreeCell {
    next: *mut FreeCell,
}

/// Singly linked list of free cells of one block plus the number of bytes
/// it covers.
#[derive(Clone, Copy, Debug)]
pub struct FreeList {
    pub head: *mut FreeCell,
    pub bytes: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::empty()
    }
}

impl FreeList {
    pub const fn empty() -> Self {
        Self {
            head: null_mut(),
            bytes: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn push(&mut self, cell: *mut u8, size: usize) {
        let cell = cell.cast::<FreeCell>();
        unsafe {
            cell.write(FreeCell { next: self.head });
        }
        self.head = cell;
        self.bytes += size;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<CellPtr> {
        if self.head.is_null() {
            return None;
        }
        let head = self.head;
        unsafe {
            self.head = (*head).next;
            Some(CellPtr::new_unchecked(head.cast()))
        }
    }

    /// Walk the list without consuming it.
    pub fn for_each(&self, mut visitor: impl FnMut(*mut u8)) {
        let mut current = self.head;
        while !current.is_null() {
            unsafe {
                let next = (*current).next;
                visitor(current.cast());
                current = next;
            }
        }
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        self.for_each(|_| count += 1);
        count
    }
}

pub struct MarkedBlock {
    link: BlockLink,
    block: DeadBlock,
    flags: BlockFlags,
    cell_size: usize,
    atoms_per_cell: usize,
    cell_count: usize,
    marks: SpaceBitmap,
    newly_allocated: Option<SpaceBitmap>,
    /// Set for cells that hold nothing to destroy: never allocated, or
    /// already destroyed by an earlier sweep.
    zapped: SpaceBitmap,
    destructor: Option<Arc<dyn CellDestructor>>,
    allocator: AllocatorId,
}

impl BlockType for MarkedBlock {
    const CLASS: BlockClass = BlockClass::Marked;
}

impl Linked for MarkedBlock {
    fn link(&self) -> &BlockLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut BlockLink {
        &mut self.link
    }
}

impl MarkedBlock {
    /// Construct a block over `block`. Cell sizes are rounded up to whole
    /// atoms. A large block holds exactly one cell.
    pub fn new(
        block: DeadBlock,
        cell_size: usize,
        policy: DestructorPolicy,
        destructor: Option<Arc<dyn CellDestructor>>,
        allocator: AllocatorId,
        is_large: bool,
    ) -> Self {
        let cell_size = round_up_to_multiple_of(ATOM_SIZE, cell_size.max(ATOM_SIZE));
        let cell_count = if is_large {
            1
        } else {
            block.size() / cell_size
        };
        debug_assert!(cell_count >= 1, "cell size {} does not fit a block", cell_size);
        let zapped = SpaceBitmap::new(cell_count);
        zapped.set_all();
        let flags = BlockFlags::new()
            .with_state(BlockState::New)
            .with_destructor(policy)
            .with_has_newly_allocated(false)
            .with_is_large(is_large);
        log::trace!(
            "new marked block at {:p}: {} cells of {} bytes ({:?})",
            block.start(),
            cell_count,
            cell_size,
            policy
        );
        Self {
            link: BlockLink::default(),
            block,
            flags,
            cell_size,
            atoms_per_cell: cell_size / ATOM_SIZE,
            cell_count,
            marks: SpaceBitmap::new(cell_count),
            newly_allocated: None,
            zapped,
            destructor,
            allocator,
        }
    }

    /// Address of the normal block a cell would live in.
    pub fn block_for(ptr: *const u8) -> usize {
        ptr as usize & !(MARKED_BLOCK_SIZE - 1)
    }

    /// Give the memory back. The caller returns it to the block allocator.
    pub fn into_dead_block(self) -> DeadBlock {
        self.block
    }

    pub fn state(&self) -> BlockState {
        self.flags.state()
    }

    fn set_state(&mut self, state: BlockState) {
        log::trace!(
            "marked block {:p}: {:?} -> {:?}",
            self.block.start(),
            self.state(),
            state
        );
        self.flags.set_state(state);
    }

    fn invalid(&self, operation: &'static str) -> HeapError {
        HeapError::InvalidBlockState {
            operation,
            state: self.state(),
        }
    }

    pub fn destructor_policy(&self) -> DestructorPolicy {
        self.flags.destructor()
    }

    pub fn set_destructor(&mut self, destructor: Option<Arc<dyn CellDestructor>>) {
        self.destructor = destructor;
    }

    pub fn is_large(&self) -> bool {
        self.flags.is_large()
    }

    pub fn allocator(&self) -> AllocatorId {
        self.allocator
    }

    pub fn start(&self) -> *mut u8 {
        self.block.start()
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.block.start().add(self.cell_count * self.cell_size) }
    }

    pub fn block_size(&self) -> usize {
        self.block.size()
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn atoms_per_cell(&self) -> usize {
        self.atoms_per_cell
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    pub fn cell_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.cell_count);
        unsafe { self.block.start().add(index * self.cell_size) }
    }

    #[inline]
    fn cell_number(&self, cell: *const u8) -> usize {
        (cell as usize - self.block.start() as usize) / self.cell_size
    }

    /// Whether `ptr` is the start of one of this block's cells.
    pub fn contains_cell(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let start = self.block.start() as usize;
        addr >= start
            && addr < self.end() as usize
            && (addr - start) % self.cell_size == 0
    }

    pub fn is_marked(&self, cell: CellPtr) -> bool {
        self.marks.get(self.cell_number(cell.as_ptr()))
    }

    /// Returns whether the cell was already marked.
    pub fn set_marked(&self, cell: CellPtr) -> bool {
        self.marks.set(self.cell_number(cell.as_ptr()))
    }

    /// Safe against concurrent markers. Returns whether the cell was already
    /// marked.
    pub fn test_and_set_marked(&self, cell: CellPtr) -> bool {
        self.marks.test_and_set(self.cell_number(cell.as_ptr()))
    }

    pub fn clear_marked(&self, cell: CellPtr) -> bool {
        self.marks.clear(self.cell_number(cell.as_ptr()))
    }

    pub fn marks_count(&self) -> usize {
        self.marks.count()
    }

    pub fn is_newly_allocated(&self, cell: CellPtr) -> bool {
        match self.newly_allocated.as_ref() {
            Some(bits) => bits.get(self.cell_number(cell.as_ptr())),
            None => false,
        }
    }

    pub fn has_newly_allocated(&self) -> bool {
        self.flags.has_newly_allocated()
    }

    /// The allocator handed `cell` out; it holds an object again.
    pub fn did_allocate(&self, cell: CellPtr) {
        self.zapped.clear(self.cell_number(cell.as_ptr()));
    }

    pub fn is_zapped(&self, cell: CellPtr) -> bool {
        self.zapped.get(self.cell_number(cell.as_ptr()))
    }

    pub fn needs_sweeping(&self) -> bool {
        self.state() == BlockState::Marked
    }

    /// No live cells and no newly allocated ones. Only meaningful once the
    /// block is `Marked`.
    pub fn is_empty(&self) -> bool {
        self.state() == BlockState::Marked
            && self.marks.is_empty()
            && self
                .newly_allocated
                .as_ref()
                .map(|bits| bits.is_empty())
                .unwrap_or(true)
    }

    fn is_live_index(&self, state: BlockState, index: usize) -> bool {
        match state {
            BlockState::Allocated => true,
            BlockState::Marked => {
                self.marks.get(index)
                    || self
                        .newly_allocated
                        .as_ref()
                        .map(|bits| bits.get(index))
                        .unwrap_or(false)
            }
            BlockState::New | BlockState::FreeListed => false,
        }
    }

    pub fn is_live(&self, cell: CellPtr) -> bool {
        self.is_live_index(self.state(), self.cell_number(cell.as_ptr()))
    }

    /// `is_live` for an arbitrary pointer that may not name a cell.
    pub fn is_live_cell(&self, ptr: *const u8) -> bool {
        if !self.contains_cell(ptr) {
            return false;
        }
        self.is_live_index(self.state(), self.cell_number(ptr))
    }

    /// Whether `ptr` is a cell that currently holds an object. Only the zap
    /// bits are consulted, so the answer survives `clear_marks`.
    pub fn holds_object(&self, ptr: *const u8) -> bool {
        self.contains_cell(ptr) && !self.zapped.get(self.cell_number(ptr))
    }

    pub fn live_cell_count(&self) -> usize {
        let state = self.state();
        (0..self.cell_count)
            .filter(|&index| self.is_live_index(state, index))
            .count()
    }

    pub fn for_each_cell(&self, mut visitor: impl FnMut(CellPtr)) {
        for index in 0..self.cell_count {
            unsafe { visitor(CellPtr::new_unchecked(self.cell_at(index))) }
        }
    }

    pub fn for_each_live_cell(&self, mut visitor: impl FnMut(CellPtr)) {
        let state = self.state();
        for index in 0..self.cell_count {
            if self.is_live_index(state, index) {
                unsafe { visitor(CellPtr::new_unchecked(self.cell_at(index))) }
            }
        }
    }

    pub fn for_each_dead_cell(&self, mut visitor: impl FnMut(CellPtr)) {
        let state = self.state();
        for index in 0..self.cell_count {
            if !self.is_live_index(state, index) {
                unsafe { visitor(CellPtr::new_unchecked(self.cell_at(index))) }
            }
        }
    }

    /// Reclaim dead cells, running destructors as needed.
    ///
    /// Sweeping an `Allocated` block is an error; sweeping a `FreeListed`
    /// block yields an empty list since its cells are already handed out.
    /// With `SweepToFreeList` the dead cells come back as a free list in
    /// descending address order.
    pub fn sweep(&mut self, mode: SweepMode) -> HeapResult<FreeList> {
        match self.state() {
            BlockState::Allocated => return Err(self.invalid("sweep")),
            BlockState::FreeListed => return Ok(FreeList::empty()),
            BlockState::New | BlockState::Marked => {}
        }

        // A new block holds no objects, so there is nothing to destroy.
        if mode == SweepMode::SweepOnly
            && (self.destructor_policy() == DestructorPolicy::None
                || self.state() == BlockState::New)
        {
            return Ok(FreeList::empty());
        }

        Ok(self.specialized_sweep(mode))
    }

    fn specialized_sweep(&mut self, mode: SweepMode) -> FreeList {
        let state = self.state();
        let runs_destructors =
            self.destructor_policy() != DestructorPolicy::None && state != BlockState::New;
        let mut free_list = FreeList::empty();

        for index in 0..self.cell_count {
            if state == BlockState::Marked && self.is_live_index(state, index) {
                continue;
            }
            let cell = self.cell_at(index);
            if runs_destructors && !self.zapped.get(index) {
                if let Some(destructor) = self.destructor.as_ref() {
                    destructor.destroy(unsafe { CellPtr::new_unchecked(cell) });
                }
            }
            self.zapped.set(index);
            if mode == SweepMode::SweepToFreeList {
                free_list.push(cell, self.cell_size);
            }
        }

        if mode == SweepMode::SweepToFreeList {
            // Everything that survived is plainly allocated again.
            self.newly_allocated = None;
            self.flags.set_has_newly_allocated(false);
            self.set_state(BlockState::FreeListed);
        } else {
            self.set_state(BlockState::Marked);
        }
        free_list
    }

    /// The allocator used up the free list this block produced.
    pub fn did_consume_free_list(&mut self) -> HeapResult<()> {
        if self.state() != BlockState::FreeListed {
            return Err(self.invalid("did_consume_free_list"));
        }
        self.set_state(BlockState::Allocated);
        Ok(())
    }

    /// Make a block that is mid-allocation introspectable: every extant cell
    /// becomes newly allocated except the ones still on `free_list`, which
    /// are zapped.
    pub fn canonicalize_cell_liveness(&mut self, free_list: &FreeList) -> HeapResult<()> {
        match self.state() {
            BlockState::Marked => {
                debug_assert!(free_list.is_empty());
                return Ok(());
            }
            BlockState::FreeListed => {}
            BlockState::New | BlockState::Allocated => {
                return Err(self.invalid("canonicalize_cell_liveness"))
            }
        }

        let newly_allocated = SpaceBitmap::new(self.cell_count);
        newly_allocated.set_all();
        free_list.for_each(|cell| {
            let index = self.cell_number(cell);
            newly_allocated.clear(index);
            self.marks.clear(index);
            self.zapped.set(index);
        });
        self.newly_allocated = Some(newly_allocated);
        self.flags.set_has_newly_allocated(true);
        self.set_state(BlockState::Marked);
        Ok(())
    }

    /// Prepare for the next mark phase.
    pub fn clear_marks(&mut self) -> HeapResult<()> {
        match self.state() {
            BlockState::New | BlockState::FreeListed => Err(self.invalid("clear_marks")),
            BlockState::Allocated | BlockState::Marked => {
                self.marks.clear_all();
                self.newly_allocated = None;
                self.flags.set_has_newly_allocated(false);
                self.set_state(BlockState::Marked);
                Ok(())
            }
        }
    }

    /// Destroy every cell that still holds an object. Used at teardown; the
    /// block must not be `FreeListed`.
    pub fn last_chance_to_finalize(&mut self) -> HeapResult<()> {
        match self.state() {
            BlockState::New => Ok(()),
            BlockState::FreeListed => Err(self.invalid("last_chance_to_finalize")),
            BlockState::Allocated | BlockState::Marked => {
                self.clear_marks()?;
                self.sweep(SweepMode::SweepOnly).map(|_| ())
            }
        }
    }

    /// Bytes held by marked cells.
    pub fn marked_bytes(&self) -> usize {
        self.marks.count() * self.cell_size
    }
}
