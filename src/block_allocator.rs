//! Pools regions by block size class and hands out dead blocks.
//!
//! Regions move between three kinds of lists: a per-class partial list, a
//! per-class full list, and one shared pool of completely empty regions.
//! Empty regions are not unmapped right away; a background trim worker
//! halves the pool about once per second so that allocation bursts can
//! reuse them without going back to the OS.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::{
    globals::TRIM_BACKOFF,
    internal::{block_list::BlockList, slab::Slab},
    out_of_memory,
    region::{BlockClass, BlockType, DeadBlock, Region, RegionId, SuperRegion},
    Config,
};

#[derive(Default)]
struct RegionSet {
    partial: BlockList,
    full: BlockList,
}

struct RegionPools {
    regions: Slab<Region>,
    sets: [RegionSet; 4],
    empty: BlockList,
    custom_regions: usize,
}

struct Shared {
    super_region: SuperRegion,
    pools: spin::Mutex<RegionPools>,
    number_of_empty_regions: AtomicUsize,
    is_currently_allocating: AtomicBool,
    regions_created: AtomicUsize,
    excess_regions_created: AtomicUsize,
    regions_destroyed: AtomicUsize,
}

impl Shared {
    /// Destroy pooled empty regions until at most `desired` remain.
    fn release_empty_regions_down_to(&self, desired: usize) -> usize {
        let mut released = 0;
        loop {
            let region = {
                let mut pools = self.pools.lock();
                if self.number_of_empty_regions.load(Ordering::Relaxed) <= desired {
                    None
                } else {
                    let RegionPools { regions, empty, .. } = &mut *pools;
                    empty.pop_front(regions).and_then(|id| {
                        self.number_of_empty_regions.fetch_sub(1, Ordering::Relaxed);
                        regions.remove(id)
                    })
                }
            };
            match region {
                Some(region) => {
                    region.destroy(&self.super_region);
                    self.regions_destroyed.fetch_add(1, Ordering::Relaxed);
                    released += 1;
                }
                None => break,
            }
        }
        released
    }

    fn trim_half(&self) -> usize {
        let current = self.number_of_empty_regions.load(Ordering::Relaxed);
        let released = self.release_empty_regions_down_to(current / 2);
        if released != 0 {
            log::debug!(
                "trimmed {} of {} empty regions",
                released,
                current
            );
        }
        released
    }
}

enum TrimMessage {
    EmptyRegionAvailable,
    Shutdown,
}

struct TrimWorker {
    sender: Sender<TrimMessage>,
    handle: Option<JoinHandle<()>>,
}

fn trim_worker_main(shared: Arc<Shared>, receiver: Receiver<TrimMessage>, interval: Duration) {
    loop {
        // Usually wait a full interval. An early wake-up is harmless.
        match receiver.recv_timeout(interval) {
            Ok(TrimMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(TrimMessage::EmptyRegionAvailable) | Err(RecvTimeoutError::Timeout) => {}
        }

        if shared.is_currently_allocating.swap(false, Ordering::Relaxed) {
            match receiver.recv_timeout(TRIM_BACKOFF) {
                Ok(TrimMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                _ => continue,
            }
        }

        // Park until there is actually something to trim.
        while shared.number_of_empty_regions.load(Ordering::Relaxed) == 0 {
            match receiver.recv() {
                Ok(TrimMessage::Shutdown) | Err(_) => return,
                Ok(TrimMessage::EmptyRegionAvailable) => {}
            }
        }

        shared.trim_half();
    }
}

pub struct BlockAllocator {
    shared: Arc<Shared>,
    worker: Option<TrimWorker>,
}

impl BlockAllocator {
    pub fn new(config: &Config) -> Self {
        let shared = Arc::new(Shared {
            super_region: SuperRegion::new(config.super_region_size),
            pools: spin::Mutex::new(RegionPools {
                regions: Slab::new(),
                sets: Default::default(),
                empty: BlockList::new(),
                custom_regions: 0,
            }),
            number_of_empty_regions: AtomicUsize::new(0),
            is_currently_allocating: AtomicBool::new(false),
            regions_created: AtomicUsize::new(0),
            excess_regions_created: AtomicUsize::new(0),
            regions_destroyed: AtomicUsize::new(0),
        });

        let worker = if config.spawn_trim_thread {
            let (sender, receiver) = channel::unbounded();
            let thread_shared = shared.clone();
            let interval = config.trim_interval;
            match std::thread::Builder::new()
                .name("comet-region-trim".into())
                .spawn(move || trim_worker_main(thread_shared, receiver, interval))
            {
                Ok(handle) => Some(TrimWorker {
                    sender,
                    handle: Some(handle),
                }),
                Err(err) => {
                    log::warn!("failed to spawn region trim thread: {}", err);
                    None
                }
            }
        } else {
            None
        };

        Self { shared, worker }
    }

    /// Get a dead block sized for `T`'s class.
    ///
    /// Partially used regions of the class are tried first, then the shared
    /// pool of empty regions; a new region is created only as a last resort.
    pub fn allocate<T: BlockType>(&self) -> DeadBlock {
        self.allocate_class(T::CLASS)
    }

    pub fn allocate_class(&self, class: BlockClass) -> DeadBlock {
        self.shared
            .is_currently_allocating
            .store(true, Ordering::Relaxed);
        {
            let mut pools = self.shared.pools.lock();
            let RegionPools {
                regions,
                sets,
                empty,
                ..
            } = &mut *pools;
            let set = &mut sets[class.index()];
            let candidate = match set.partial.head() {
                Some(id) => Some(id),
                None => empty.pop_front(regions).map(|id| {
                    self.shared
                        .number_of_empty_regions
                        .fetch_sub(1, Ordering::Relaxed);
                    regions[id].reset(class);
                    set.partial.push_back(regions, id);
                    log::trace!("reusing empty region {:?} for {:?}", id, class);
                    id
                }),
            };
            if let Some(id) = candidate {
                return Self::allocate_from(regions, set, id);
            }
        }

        let region = match Region::create(&self.shared.super_region, class) {
            Ok(region) => region,
            Err(err) => {
                log::error!("unable to create a region for {:?}: {}", class, err);
                out_of_memory(class.block_size());
            }
        };
        if region.is_excess() {
            self.shared
                .excess_regions_created
                .fetch_add(1, Ordering::Relaxed);
        }
        self.shared.regions_created.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "created region at {:p} for {:?} ({} blocks)",
            region.base(),
            class,
            region.total_blocks()
        );

        let mut pools = self.shared.pools.lock();
        let RegionPools { regions, sets, .. } = &mut *pools;
        let set = &mut sets[class.index()];
        let id = regions.insert(region);
        set.partial.push_back(regions, id);
        Self::allocate_from(regions, set, id)
    }

    fn allocate_from(regions: &mut Slab<Region>, set: &mut RegionSet, id: RegionId) -> DeadBlock {
        let block = regions[id].allocate(id);
        if regions[id].is_full() {
            set.partial.remove(regions, id);
            set.full.push_back(regions, id);
        }
        block
    }

    /// Return a dead block to its region. A region that becomes empty goes
    /// to the empty pool; custom-size regions are destroyed immediately.
    pub fn deallocate(&self, block: DeadBlock) {
        let mut should_wake_trim_worker = false;
        {
            let mut pools = self.shared.pools.lock();
            let RegionPools {
                regions,
                sets,
                empty,
                custom_regions,
            } = &mut *pools;
            let id = block.region();
            let class = match regions[id].class() {
                Some(class) => class,
                None => {
                    let mut region = match regions.remove(id) {
                        Some(region) => region,
                        None => return,
                    };
                    *custom_regions -= 1;
                    drop(pools);
                    region.deallocate(block);
                    region.destroy(&self.shared.super_region);
                    self.shared.regions_destroyed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let set = &mut sets[class.index()];
            let was_full = regions[id].is_full();
            regions[id].deallocate(block);
            let now_empty = regions[id].is_empty();
            if was_full {
                set.full.remove(regions, id);
            } else if now_empty {
                set.partial.remove(regions, id);
            }
            if now_empty {
                empty.push_back(regions, id);
                should_wake_trim_worker = self
                    .shared
                    .number_of_empty_regions
                    .fetch_add(1, Ordering::Relaxed)
                    == 0;
            } else if was_full {
                set.partial.push_front(regions, id);
            }
        }

        if should_wake_trim_worker {
            if let Some(worker) = self.worker.as_ref() {
                let _ = worker.sender.send(TrimMessage::EmptyRegionAvailable);
            }
        }
    }

    /// Allocate a block of `size` bytes aligned to `alignment` in a region of
    /// its own.
    pub fn allocate_custom_size(&self, size: usize, alignment: usize) -> DeadBlock {
        self.shared
            .is_currently_allocating
            .store(true, Ordering::Relaxed);
        let region = match Region::create_custom_size(size, alignment) {
            Ok(region) => region,
            Err(err) => {
                log::error!("unable to map a custom region of {} bytes: {}", size, err);
                out_of_memory(size);
            }
        };
        self.shared.regions_created.fetch_add(1, Ordering::Relaxed);
        let mut pools = self.shared.pools.lock();
        pools.custom_regions += 1;
        let id = pools.regions.insert(region);
        pools.regions[id].allocate(id)
    }

    pub fn deallocate_custom_size(&self, block: DeadBlock) {
        debug_assert!(self.is_custom_size(&block));
        self.deallocate(block);
    }

    pub fn is_custom_size(&self, block: &DeadBlock) -> bool {
        let pools = self.shared.pools.lock();
        pools
            .regions
            .get(block.region())
            .map(|region| region.is_custom_size())
            .unwrap_or(false)
    }

    /// One trim tick: destroy half of the pooled empty regions.
    pub fn trim(&self) -> usize {
        self.shared.trim_half()
    }

    /// Destroy every pooled empty region.
    pub fn release_free_regions(&self) -> usize {
        self.shared.release_empty_regions_down_to(0)
    }

    pub fn has_trim_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn empty_region_count(&self) -> usize {
        self.shared.number_of_empty_regions.load(Ordering::Relaxed)
    }

    pub fn region_count(&self) -> usize {
        self.shared.pools.lock().regions.len()
    }

    pub fn partial_region_count(&self, class: BlockClass) -> usize {
        self.shared.pools.lock().sets[class.index()].partial.len()
    }

    pub fn full_region_count(&self, class: BlockClass) -> usize {
        self.shared.pools.lock().sets[class.index()].full.len()
    }

    pub fn custom_region_count(&self) -> usize {
        self.shared.pools.lock().custom_regions
    }

    pub fn regions_created(&self) -> usize {
        self.shared.regions_created.load(Ordering::Relaxed)
    }

    pub fn excess_regions_created(&self) -> usize {
        self.shared.excess_regions_created.load(Ordering::Relaxed)
    }

    pub fn regions_destroyed(&self) -> usize {
        self.shared.regions_destroyed.load(Ordering::Relaxed)
    }

    pub fn super_region(&self) -> &SuperRegion {
        &self.shared.super_region
    }

    /// Number of dead blocks currently handed out for `class`.
    pub fn blocks_in_use(&self, class: BlockClass) -> usize {
        let pools = self.shared.pools.lock();
        let set = &pools.sets[class.index()];
        let mut total = 0;
        set.partial
            .for_each(&pools.regions, |_, region| total += region.blocks_in_use());
        set.full
            .for_each(&pools.regions, |_, region| total += region.blocks_in_use());
        total
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let _ = worker.sender.send(TrimMessage::Shutdown);
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    log::error!("region trim thread panicked");
                }
            }
        }
        self.release_free_regions();

        let pools = self.shared.pools.lock();
        let leaked = pools.regions.len();
        if leaked != 0 {
            log::error!("block allocator dropped with {} non-empty regions", leaked);
            if !std::thread::panicking() {
                debug_assert!(
                    leaked == 0,
                    "all typed blocks must be freed before the block allocator"
                );
            }
        }
    }
}
