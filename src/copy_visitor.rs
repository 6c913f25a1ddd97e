use crate::{
    copied_space::{CopiedAllocator, CopiedSpace},
    internal::slab::SlabId,
    slot_visitor::CellTracer,
};

/// Evacuates from-space backing stores into loaned to-space blocks.
pub struct CopyVisitor<'a> {
    space: &'a mut CopiedSpace,
    allocator: CopiedAllocator,
    copied_bytes: usize,
}

impl<'a> CopyVisitor<'a> {
    pub fn new(space: &'a mut CopiedSpace) -> Self {
        Self {
            space,
            allocator: CopiedAllocator::new(),
            copied_bytes: 0,
        }
    }

    /// Walk the work lists of every from-space block that may be evacuated.
    /// Without a tracer nothing can be moved, so such blocks are pinned.
    pub fn copy_from_shared(&mut self, tracer: Option<&dyn CellTracer>) {
        for id in self.space.from_space_ids() {
            let block = match self.space.block(id) {
                Some(block) => block,
                None => continue,
            };
            if block.is_pinned() {
                continue;
            }
            let work_list = match block.take_work_list() {
                Some(work_list) => work_list,
                None => continue,
            };
            let tracer = match tracer {
                Some(tracer) => tracer,
                None => {
                    block.pin();
                    continue;
                }
            };
            for item in work_list.iter() {
                tracer.copy_backing_store(item.owner, item.token, self);
            }
        }
    }

    /// Space for `bytes` in a loaned block.
    pub fn allocate_new_space(&mut self, bytes: usize) -> *mut u8 {
        if let Some(ptr) = self.allocator.try_allocate(bytes) {
            return ptr;
        }
        self.allocate_new_space_slow(bytes)
    }

    fn allocate_new_space_slow(&mut self, bytes: usize) -> *mut u8 {
        self.done_filling_current();
        let id = self.space.allocate_block_for_copying_phase();
        self.set_current(id);
        match self.allocator.try_allocate(bytes) {
            Some(ptr) => ptr,
            None => crate::out_of_memory(bytes),
        }
    }

    fn set_current(&mut self, id: SlabId) {
        if let Some(block) = self.space.loaned_block(id) {
            self.allocator.set_current_block(id, block);
        }
    }

    fn done_filling_current(&mut self) {
        if let Some((id, remaining)) = self.allocator.reset_current_block() {
            self.space.done_filling_block(id, remaining);
        }
    }

    /// Evacuation of `bytes` at `ptr` finished.
    pub fn did_copy(&mut self, ptr: *const u8, bytes: usize) {
        self.copied_bytes += bytes;
        self.space.did_copy(ptr, bytes);
    }

    /// Move `bytes` at `ptr` into to-space and return the new address. The
    /// caller updates its own reference.
    pub fn copy(&mut self, ptr: *const u8, bytes: usize) -> *mut u8 {
        let new_ptr = self.allocate_new_space(bytes);
        unsafe { std::ptr::copy_nonoverlapping(ptr, new_ptr, bytes) };
        self.did_copy(ptr, bytes);
        new_ptr
    }

    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes
    }

    /// Return the last loaned block to to-space.
    pub fn done_copying(&mut self) {
        self.done_filling_current();
    }
}
