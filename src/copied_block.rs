use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    block_allocator::BlockAllocator,
    copy_work_list::{CopyToken, CopyWorkList, CopyWorklistItem},
    globals::MIN_COPIED_BLOCK_UTILIZATION,
    internal::block_list::{BlockLink, Linked},
    region::{BlockClass, BlockType, DeadBlock},
    value::CellPtr,
};

#[derive(Default)]
struct Liveness {
    live_bytes: usize,
    work_list: Option<CopyWorkList>,
}

/// Append-only payload block of the copied space.
///
/// `remaining` counts the unused bytes at the end of the payload; live
/// bytes and the work list are only meaningful between marking and the end
/// of the copy phase.
pub struct CopiedBlock {
    link: BlockLink,
    block: DeadBlock,
    remaining: usize,
    is_oversize: bool,
    is_pinned: AtomicBool,
    liveness: Mutex<Liveness>,
}

impl BlockType for CopiedBlock {
    const CLASS: BlockClass = BlockClass::Copied;
}

impl Linked for CopiedBlock {
    fn link(&self) -> &BlockLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut BlockLink {
        &mut self.link
    }
}

impl CopiedBlock {
    pub fn new(mut block: DeadBlock, is_oversize: bool) -> Self {
        block.zero_fill();
        Self::new_no_zero_fill(block, is_oversize)
    }

    /// Used for blocks that are about to be filled by the copy phase.
    pub fn new_no_zero_fill(block: DeadBlock, is_oversize: bool) -> Self {
        Self {
            link: BlockLink::default(),
            remaining: block.size(),
            block,
            is_oversize,
            is_pinned: AtomicBool::new(false),
            liveness: Mutex::new(Liveness::default()),
        }
    }

    pub fn into_dead_block(self) -> DeadBlock {
        self.block
    }

    pub fn start(&self) -> *mut u8 {
        self.block.start()
    }

    pub fn payload_end(&self) -> *mut u8 {
        self.block.end()
    }

    pub fn payload_capacity(&self) -> usize {
        self.block.size()
    }

    /// Bytes handed out so far.
    pub fn size(&self) -> usize {
        self.payload_capacity() - self.remaining
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn set_remaining(&mut self, remaining: usize) {
        debug_assert!(remaining <= self.payload_capacity());
        self.remaining = remaining;
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.block.contains(ptr)
    }

    pub fn is_oversize(&self) -> bool {
        self.is_oversize
    }

    pub fn is_pinned(&self) -> bool {
        self.is_pinned.load(Ordering::Relaxed)
    }

    pub fn pin(&self) {
        self.is_pinned.store(true, Ordering::Relaxed);
        // A pinned block is never evacuated.
        self.liveness.lock().work_list = None;
    }

    pub fn live_bytes(&self) -> usize {
        self.liveness.lock().live_bytes
    }

    pub fn should_evacuate(&self) -> bool {
        Self::should_evacuate_with(self.live_bytes(), self.payload_capacity())
    }

    fn should_evacuate_with(live_bytes: usize, capacity: usize) -> bool {
        live_bytes as f64 / capacity as f64 <= MIN_COPIED_BLOCK_UTILIZATION
    }

    pub fn can_be_recycled(&self) -> bool {
        self.live_bytes() == 0
    }

    /// Account `bytes` of backing store owned by `owner`. Blocks too full to
    /// be worth evacuating are pinned instead of queued.
    pub fn report_live_bytes(
        &self,
        owner: CellPtr,
        token: CopyToken,
        bytes: usize,
        block_allocator: &Arc<BlockAllocator>,
    ) {
        let mut liveness = self.liveness.lock();
        liveness.live_bytes += bytes;
        if !Self::should_evacuate_with(liveness.live_bytes, self.payload_capacity()) {
            drop(liveness);
            self.pin();
            return;
        }
        if self.is_pinned() {
            return;
        }
        liveness
            .work_list
            .get_or_insert_with(|| CopyWorkList::new(block_allocator.clone()))
            .append(CopyWorklistItem { owner, token });
    }

    /// Returns whether the block is now free of live data.
    pub fn did_evacuate_bytes(&self, bytes: usize) -> bool {
        let mut liveness = self.liveness.lock();
        debug_assert!(liveness.live_bytes >= bytes);
        liveness.live_bytes = liveness.live_bytes.saturating_sub(bytes);
        liveness.live_bytes == 0
    }

    pub fn take_work_list(&self) -> Option<CopyWorkList> {
        self.liveness.lock().work_list.take()
    }

    pub fn has_work_list(&self) -> bool {
        self.liveness.lock().work_list.is_some()
    }

    /// Reset the per-collection bookkeeping of a block that stays.
    pub fn did_survive_gc(&self) {
        let mut liveness = self.liveness.lock();
        liveness.live_bytes = 0;
        liveness.work_list = None;
        self.is_pinned.store(false, Ordering::Relaxed);
    }
}
