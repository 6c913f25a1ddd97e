//! The heap ties the spaces together and runs collections.
//!
//! Allocation is the only driver of collection scheduling: the slow path of
//! [`Heap::allocate`] collects once the byte budget is exhausted. Timers
//! (incremental sweeping and the opportunistic collection timer) only fire
//! from [`Heap::service_timers`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    allocation_config::AllocationConfig,
    block_allocator::BlockAllocator,
    copied_space::CopiedSpace,
    copy_visitor::CopyVisitor,
    error::{HeapError, HeapResult},
    handle_set::{HandleSet, HandleSlot},
    heap_timer::GcActivityCallback,
    incremental_sweeper::IncrementalSweeper,
    marked_allocator::AllocatorId,
    marked_block::{CellDestructor, DestructorPolicy},
    marked_space::{MarkedBlockId, MarkedSpace},
    slot_visitor::{CellTracer, SlotVisitor},
    statistics::HeapStatistics,
    value::{CellPtr, Value},
    weak_impl::{WeakHandleOwner, WeakImplState},
    weak_set::{WeakHandle, WeakSet},
    Config,
};

/// What the heap is busy with. Allocation and collection exclude each other.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapOperation {
    NoOperation,
    Allocation,
    Collection,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepToggle {
    /// Sweep everything before returning from the collection.
    DoSweep,
    /// Leave sweeping to the allocators and the incremental sweeper.
    DoNotSweep,
}

pub type Constraint = Box<dyn FnMut(&mut SlotVisitor<'_>)>;

pub struct Heap {
    config: Config,
    marked_space: MarkedSpace,
    copied_space: CopiedSpace,
    weak_set: WeakSet,
    handle_set: HandleSet,
    sweeper: IncrementalSweeper,
    activity_callback: GcActivityCallback,
    allocation_config: AllocationConfig,
    constraints: Vec<Constraint>,
    tracer: Option<Box<dyn CellTracer>>,
    operation: HeapOperation,
    in_finalization: bool,
    gc_cycles: usize,
    last_gc_length: Duration,
    last_death_rate: f64,
    block_allocator: Arc<BlockAllocator>,
}

impl Heap {
    pub fn new(config: Config) -> Self {
        let block_allocator = Arc::new(BlockAllocator::new(&config));
        logln_if!(
            config.verbose,
            "heap created: super region of {} bytes, trim worker: {}",
            block_allocator.super_region().size(),
            block_allocator.has_trim_worker()
        );
        Self {
            marked_space: MarkedSpace::new(block_allocator.clone()),
            copied_space: CopiedSpace::new(block_allocator.clone()),
            weak_set: WeakSet::new(block_allocator.clone()),
            handle_set: HandleSet::new(block_allocator.clone()),
            sweeper: IncrementalSweeper::new(&config),
            activity_callback: GcActivityCallback::new(),
            allocation_config: AllocationConfig::new(&config),
            constraints: Vec::new(),
            tracer: None,
            operation: HeapOperation::NoOperation,
            in_finalization: false,
            gc_cycles: 0,
            last_gc_length: Duration::ZERO,
            last_death_rate: 1.0,
            block_allocator,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn operation(&self) -> HeapOperation {
        self.operation
    }

    pub fn is_busy(&self) -> bool {
        self.operation != HeapOperation::NoOperation
    }

    pub fn block_allocator(&self) -> &Arc<BlockAllocator> {
        &self.block_allocator
    }

    pub fn marked_space(&self) -> &MarkedSpace {
        &self.marked_space
    }

    pub fn marked_space_mut(&mut self) -> &mut MarkedSpace {
        &mut self.marked_space
    }

    pub fn copied_space(&self) -> &CopiedSpace {
        &self.copied_space
    }

    pub fn weak_set(&self) -> &WeakSet {
        &self.weak_set
    }

    pub fn handle_set(&self) -> &HandleSet {
        &self.handle_set
    }

    pub fn sweeper(&self) -> &IncrementalSweeper {
        &self.sweeper
    }

    pub fn activity_callback(&self) -> &GcActivityCallback {
        &self.activity_callback
    }

    pub fn activity_callback_mut(&mut self) -> &mut GcActivityCallback {
        &mut self.activity_callback
    }

    pub fn allocation_config(&self) -> &AllocationConfig {
        &self.allocation_config
    }

    pub fn gc_cycles(&self) -> usize {
        self.gc_cycles
    }

    pub fn last_gc_length(&self) -> Duration {
        self.last_gc_length
    }

    pub fn set_cell_tracer(&mut self, tracer: impl CellTracer + 'static) {
        self.tracer = Some(Box::new(tracer));
    }

    pub fn set_destructor(
        &mut self,
        policy: DestructorPolicy,
        destructor: impl CellDestructor + 'static,
    ) {
        self.marked_space.set_destructor(policy, Arc::new(destructor));
    }

    /// Register a root marking callback that runs at the start of every
    /// collection.
    pub fn add_constraint(&mut self, constraint: impl FnMut(&mut SlotVisitor<'_>) + 'static) {
        self.constraints.push(Box::new(constraint));
    }

    fn check_not_busy(&self, requested: HeapOperation) -> HeapResult<()> {
        if self.in_finalization {
            return Err(HeapError::FinalizerReentrancy);
        }
        match self.operation {
            HeapOperation::NoOperation => Ok(()),
            current => Err(HeapError::OperationInProgress { requested, current }),
        }
    }

    /// Allocate a cell of at least `bytes` bytes whose dead instances are
    /// handled according to `policy`.
    pub fn allocate(&mut self, bytes: usize, policy: DestructorPolicy) -> HeapResult<CellPtr> {
        self.check_not_busy(HeapOperation::Allocation)?;
        let id = self.marked_space.allocator_for(bytes, policy);
        if let Some(cell) = self.try_allocate(id, bytes)? {
            return Ok(cell);
        }

        if self.should_collect() {
            self.collect(SweepToggle::DoNotSweep)?;
            if let Some(cell) = self.try_allocate(id, bytes)? {
                return Ok(cell);
            }
        }

        self.operation = HeapOperation::Allocation;
        let result = self.marked_space.allocate_with_new_block(id, bytes);
        self.operation = HeapOperation::NoOperation;
        let cell = result?;
        self.account_adopted_bytes(id);
        Ok(cell)
    }

    fn try_allocate(&mut self, id: AllocatorId, bytes: usize) -> HeapResult<Option<CellPtr>> {
        self.operation = HeapOperation::Allocation;
        let result = self.marked_space.try_allocate(id, bytes);
        self.operation = HeapOperation::NoOperation;
        let cell = result?;
        self.account_adopted_bytes(id);
        Ok(cell)
    }

    fn account_adopted_bytes(&mut self, id: AllocatorId) {
        let bytes = self.marked_space.allocator_mut(id).take_adopted_bytes();
        if bytes != 0 {
            self.report_bytes_allocated(bytes);
        }
    }

    pub fn should_collect(&self) -> bool {
        self.operation == HeapOperation::NoOperation
            && !self.in_finalization
            && self.allocation_config.should_collect()
    }

    pub fn report_bytes_allocated(&mut self, bytes: usize) {
        self.allocation_config.report_bytes_allocated(bytes);
        self.activity_callback.did_allocate(
            self.allocation_config.bytes_allocated,
            self.last_gc_length,
            self.last_death_rate,
        );
    }

    pub fn report_bytes_freed(&mut self, bytes: usize) {
        self.allocation_config.report_bytes_freed(bytes);
    }

    pub fn notify_collection_start(&mut self) -> HeapResult<()> {
        self.check_not_busy(HeapOperation::Collection)?;
        self.operation = HeapOperation::Collection;
        self.activity_callback.will_collect();
        self.sweeper.will_finish_sweeping();
        Ok(())
    }

    pub fn notify_collection_end(&mut self) {
        self.operation = HeapOperation::NoOperation;
    }

    /// Run a full mark-sweep cycle.
    pub fn collect(&mut self, sweep: SweepToggle) -> HeapResult<()> {
        self.notify_collection_start()?;
        let start = Instant::now();
        let result = self.collect_impl(sweep);
        self.notify_collection_end();
        result?;
        self.last_gc_length = start.elapsed();
        self.gc_cycles += 1;
        logln_if!(
            self.config.verbose,
            "GC #{} took {:.3}ms: {} bytes live, next collection after {} bytes",
            self.gc_cycles,
            self.last_gc_length.as_secs_f64() * 1000.0,
            self.allocation_config.size_after_last_collect,
            self.allocation_config.bytes_allocated_limit
        );
        Ok(())
    }

    fn collect_impl(&mut self, sweep: SweepToggle) -> HeapResult<()> {
        self.marked_space.canonicalize_cell_liveness()?;
        self.marked_space.clear_marks()?;
        self.mark_roots();
        self.weak_set.reap(&self.marked_space);
        self.copy_backing_stores();

        self.in_finalization = true;
        self.handle_set.begin_finalization();
        self.weak_set.sweep();
        self.handle_set.end_finalization();
        self.in_finalization = false;
        self.weak_set.shrink();

        match sweep {
            SweepToggle::DoSweep => {
                self.marked_space.sweep()?;
                self.marked_space.shrink();
            }
            SweepToggle::DoNotSweep => {
                let snapshot = self.marked_space.block_snapshot();
                self.sweeper.start_sweeping(snapshot);
            }
        }
        self.marked_space.reset_allocators();

        let live = self.marked_space.size() + self.copied_space.size();
        self.last_death_rate = self.allocation_config.update_after_collection(live);
        if !self.block_allocator.has_trim_worker() {
            self.block_allocator.trim();
        }
        Ok(())
    }

    fn mark_roots(&mut self) {
        let tracer = self.tracer.as_deref();
        let mut visitor = SlotVisitor::new(&self.marked_space, &self.copied_space, tracer);
        self.handle_set.visit_strong_handles(&mut visitor);
        for constraint in self.constraints.iter_mut() {
            constraint(&mut visitor);
        }
        visitor.drain();

        // Weak owners may keep more cells alive, which may in turn make
        // more owners answer yes.
        loop {
            let before = visitor.visit_count();
            self.weak_set.visit(&mut visitor);
            visitor.drain();
            if visitor.visit_count() == before {
                break;
            }
        }
        log::debug!("marking visited {} cells", visitor.visit_count());
    }

    fn copy_backing_stores(&mut self) {
        self.copied_space.started_copying(self.marked_space.capacity());
        if self.copied_space.should_do_copy_phase() {
            let tracer = self.tracer.as_deref();
            let mut visitor = CopyVisitor::new(&mut self.copied_space);
            visitor.copy_from_shared(tracer);
            visitor.done_copying();
            log::debug!("copy phase evacuated {} bytes", visitor.copied_bytes());
        }
        self.copied_space.done_copying();
    }

    /// Sweep every block synchronously, preempting the incremental sweeper.
    pub fn sweep_all(&mut self) -> HeapResult<()> {
        self.check_not_busy(HeapOperation::Collection)?;
        self.sweeper.will_finish_sweeping();
        self.marked_space.canonicalize_cell_liveness()?;
        self.marked_space.sweep()?;
        self.marked_space.shrink();
        Ok(())
    }

    pub fn request_incremental_sweep(&mut self, blocks: Vec<MarkedBlockId>) {
        self.sweeper.start_sweeping(blocks);
    }

    /// Fire every due timer.
    pub fn service_timers(&mut self) -> HeapResult<()> {
        if self.is_busy() || self.in_finalization {
            return Ok(());
        }
        let now = Instant::now();
        self.sweeper.fire(&mut self.marked_space, now)?;
        if self.activity_callback.is_due(now) {
            self.activity_callback.cancel();
            self.collect(SweepToggle::DoNotSweep)?;
        }
        Ok(())
    }

    pub fn allocate_handle(&mut self) -> HandleSlot {
        self.handle_set.allocate()
    }

    pub fn set_handle(&mut self, slot: HandleSlot, value: Value) -> HeapResult<()> {
        self.handle_set.set(slot, value)
    }

    pub fn handle(&self, slot: HandleSlot) -> Option<Value> {
        self.handle_set.get(slot)
    }

    pub fn deallocate_handle(&mut self, slot: HandleSlot) -> bool {
        self.handle_set.deallocate(slot)
    }

    pub fn allocate_weak(
        &mut self,
        value: Value,
        owner: Option<Arc<dyn WeakHandleOwner>>,
        context: usize,
    ) -> WeakHandle {
        self.weak_set.allocate(value, owner, context)
    }

    pub fn weak(&self, handle: WeakHandle) -> Option<Value> {
        self.weak_set.get(handle)
    }

    pub fn weak_state(&self, handle: WeakHandle) -> Option<WeakImplState> {
        self.weak_set.state(handle)
    }

    pub fn deallocate_weak(&mut self, handle: WeakHandle) -> bool {
        self.weak_set.deallocate(handle)
    }

    /// Allocate `bytes` of backing store in the copied space.
    pub fn allocate_backing_store(&mut self, bytes: usize) -> HeapResult<*mut u8> {
        self.check_not_busy(HeapOperation::Allocation)?;
        let ptr = self.copied_space.try_allocate(bytes);
        let new_bytes = self.copied_space.take_bytes_allocated();
        if new_bytes != 0 {
            self.report_bytes_allocated(new_bytes);
        }
        Ok(ptr)
    }

    pub fn reallocate_backing_store(
        &mut self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> HeapResult<*mut u8> {
        self.check_not_busy(HeapOperation::Allocation)?;
        let new_ptr = self.copied_space.try_reallocate(ptr, old_size, new_size);
        let new_bytes = self.copied_space.take_bytes_allocated();
        if new_bytes != 0 {
            self.report_bytes_allocated(new_bytes);
        }
        Ok(new_ptr)
    }

    pub fn is_live(&self, cell: CellPtr) -> bool {
        self.marked_space.is_live(cell)
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            marked_blocks: self.marked_space.block_count(),
            weak_blocks: self.weak_set.block_count(),
            handle_blocks: self.handle_set.block_count(),
            copied_blocks: self.copied_space.block_count(),
            regions: self.block_allocator.region_count(),
            regions_created: self.block_allocator.regions_created(),
            regions_destroyed: self.block_allocator.regions_destroyed(),
            empty_regions: self.block_allocator.empty_region_count(),
            live_objects: self.marked_space.object_count(),
            marked_space_size: self.marked_space.size(),
            marked_space_capacity: self.marked_space.capacity(),
            copied_space_size: self.copied_space.size(),
            copied_space_capacity: self.copied_space.capacity(),
            protected_handles: self.handle_set.protected_count(),
            total_gc_cycles_count: self.gc_cycles,
            last_gc_length: self.last_gc_length,
            total_memory_allocated: self.allocation_config.total_bytes_allocated,
            heap_threshold: self.allocation_config.bytes_allocated_limit,
        }
    }

    fn last_chance_to_finalize(&mut self) {
        self.sweeper.will_finish_sweeping();
        self.activity_callback.cancel();
        self.in_finalization = true;
        self.handle_set.begin_finalization();
        self.weak_set.last_chance_to_finalize();
        self.handle_set.end_finalization();
        self.in_finalization = false;
        if let Err(err) = self.marked_space.last_chance_to_finalize() {
            log::error!("heap teardown could not finalize every cell: {}", err);
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.last_chance_to_finalize();
        logln_if!(self.config.verbose, "{}", self.statistics());
    }
}
