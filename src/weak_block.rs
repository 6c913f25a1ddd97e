use std::{
    marker::PhantomData,
    mem::{align_of, size_of, ManuallyDrop},
    ptr, slice,
};

use crate::{
    globals::SMALL_BLOCK_SIZE,
    internal::block_list::{BlockLink, Linked},
    marked_space::MarkedSpace,
    region::{BlockClass, BlockType, DeadBlock},
    slot_visitor::SlotVisitor,
    value::Value,
    weak_impl::{WeakImpl, WeakImplState},
};

/// Outcome of the last sweep of a weak block: its free slots and whether
/// every slot is free.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SweepResult {
    pub block_is_free: bool,
    pub free_list: Option<u32>,
}

/// A block of weak slots. The slots live in the block's own memory.
pub struct WeakBlock {
    link: BlockLink,
    block: DeadBlock,
    _slots: PhantomData<WeakImpl>,
    /// `None` once the allocator took the result.
    sweep_result: Option<SweepResult>,
}

impl BlockType for WeakBlock {
    const CLASS: BlockClass = BlockClass::Small;
}

impl Linked for WeakBlock {
    fn link(&self) -> &BlockLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut BlockLink {
        &mut self.link
    }
}

/// A weak slot's referent is alive if it is not a cell, or is a cell the
/// collector marked.
fn is_live(space: &MarkedSpace, value: Value) -> bool {
    match value.as_cell() {
        Some(cell) => !space.contains(cell.as_ptr()) || space.is_marked(cell),
        None => true,
    }
}

impl WeakBlock {
    pub const SLOT_COUNT: usize = SMALL_BLOCK_SIZE / size_of::<WeakImpl>();

    pub fn new(block: DeadBlock) -> Self {
        debug_assert!(block.size() >= Self::SLOT_COUNT * size_of::<WeakImpl>());
        debug_assert_eq!(block.start() as usize % align_of::<WeakImpl>(), 0);
        let start = block.start().cast::<WeakImpl>();
        for index in 0..Self::SLOT_COUNT {
            unsafe { start.add(index).write(WeakImpl::default()) };
        }
        let mut weak_block = Self {
            link: BlockLink::default(),
            block,
            _slots: PhantomData,
            sweep_result: None,
        };
        let mut result = SweepResult {
            block_is_free: true,
            free_list: None,
        };
        for index in (0..Self::SLOT_COUNT as u32).rev() {
            weak_block.add_to_free_list(&mut result, index);
        }
        weak_block.sweep_result = Some(result);
        debug_assert!(weak_block.is_empty());
        weak_block
    }

    /// Drop every slot and give the memory back. The caller returns it to
    /// the block allocator.
    pub fn into_dead_block(self) -> DeadBlock {
        let mut this = ManuallyDrop::new(self);
        unsafe {
            ptr::drop_in_place(this.slots_mut() as *mut [WeakImpl]);
            ptr::read(&this.block)
        }
    }

    fn slots(&self) -> &[WeakImpl] {
        unsafe { slice::from_raw_parts(self.block.start().cast(), Self::SLOT_COUNT) }
    }

    fn slots_mut(&mut self) -> &mut [WeakImpl] {
        unsafe { slice::from_raw_parts_mut(self.block.start().cast(), Self::SLOT_COUNT) }
    }

    pub fn start(&self) -> *mut u8 {
        self.block.start()
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.block.contains(ptr)
    }

    pub fn slot(&self, index: u32) -> Option<&WeakImpl> {
        self.slots().get(index as usize)
    }

    pub(crate) fn slot_mut(&mut self, index: u32) -> Option<&mut WeakImpl> {
        self.slots_mut().get_mut(index as usize)
    }

    pub fn slot_count(&self) -> usize {
        Self::SLOT_COUNT
    }

    pub fn live_count(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.state() == WeakImplState::Live)
            .count()
    }

    /// Every slot is free and the allocator has not claimed them.
    pub fn is_empty(&self) -> bool {
        matches!(self.sweep_result, Some(result) if result.block_is_free)
    }

    pub fn take_sweep_result(&mut self) -> Option<SweepResult> {
        self.sweep_result.take()
    }

    fn add_to_free_list(&mut self, result: &mut SweepResult, index: u32) {
        let slot = &mut self.slots_mut()[index as usize];
        if slot.state() != WeakImplState::Deallocated {
            slot.deallocate();
        }
        slot.set_next_free(result.free_list);
        result.free_list = Some(index);
    }

    fn finalize(slot: &mut WeakImpl) {
        debug_assert_eq!(slot.state(), WeakImplState::Dead);
        slot.set_state(WeakImplState::Finalized);
        if let Some(owner) = slot.owner() {
            owner.finalize(slot.value(), slot.context());
        }
    }

    /// Run finalizers of dead slots and rebuild the free list from every
    /// finalized or deallocated slot.
    pub fn sweep(&mut self) {
        if self.is_empty() {
            return;
        }
        let mut result = SweepResult {
            block_is_free: true,
            free_list: None,
        };
        for index in (0..Self::SLOT_COUNT as u32).rev() {
            let slot = &mut self.slots_mut()[index as usize];
            if slot.state() == WeakImplState::Dead {
                Self::finalize(slot);
            }
            match slot.state() {
                WeakImplState::Finalized | WeakImplState::Deallocated => {
                    self.add_to_free_list(&mut result, index)
                }
                WeakImplState::Live | WeakImplState::Dead => result.block_is_free = false,
            }
        }
        self.sweep_result = Some(result);
    }

    /// Keep referents alive that an owner vouches for through opaque roots.
    pub fn visit(&self, visitor: &mut SlotVisitor<'_>) {
        if self.is_empty() {
            return;
        }
        for slot in self.slots().iter() {
            if slot.state() != WeakImplState::Live {
                continue;
            }
            let owner = match slot.owner() {
                Some(owner) => owner,
                None => continue,
            };
            let value = slot.value();
            if is_live(visitor.marked_space(), value) {
                continue;
            }
            if !owner.is_reachable_from_opaque_roots(value, slot.context(), visitor) {
                continue;
            }
            visitor.append(value);
        }
    }

    /// Demote slots whose referent did not survive marking to `Dead`.
    pub fn reap(&mut self, space: &MarkedSpace) {
        if self.is_empty() {
            return;
        }
        for slot in self.slots_mut().iter_mut() {
            if slot.state() > WeakImplState::Dead {
                continue;
            }
            if is_live(space, slot.value()) {
                debug_assert_eq!(slot.state(), WeakImplState::Live);
                continue;
            }
            slot.set_state(WeakImplState::Dead);
        }
    }

    /// Finalize every slot that has not been finalized yet.
    pub fn last_chance_to_finalize(&mut self) {
        for slot in self.slots_mut().iter_mut() {
            if slot.state() >= WeakImplState::Finalized {
                continue;
            }
            slot.set_state(WeakImplState::Dead);
            Self::finalize(slot);
        }
    }
}

impl Drop for WeakBlock {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.slots_mut() as *mut [WeakImpl]) }
    }
}
