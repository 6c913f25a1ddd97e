use crate::Config;

/// Byte budget deciding when the next collection runs.
///
/// Allocation reports bytes as free lists and blocks are handed out; once
/// more than `bytes_allocated_limit` were allocated since the last
/// collection, the next allocation slow path collects.
pub struct AllocationConfig {
    pub min_bytes_per_cycle: usize,
    pub heap_growth_factor: f64,
    pub bytes_allocated_limit: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
    pub size_after_last_collect: usize,
    pub total_bytes_allocated: usize,
}

impl AllocationConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            min_bytes_per_cycle: config.min_bytes_per_cycle,
            heap_growth_factor: config.heap_growth_factor,
            bytes_allocated_limit: config.min_bytes_per_cycle,
            bytes_allocated: 0,
            bytes_freed: 0,
            size_after_last_collect: 0,
            total_bytes_allocated: 0,
        }
    }

    pub fn report_bytes_allocated(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
        self.total_bytes_allocated += bytes;
    }

    /// Memory released outside of a collection relieves the budget.
    pub fn report_bytes_freed(&mut self, bytes: usize) {
        self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes);
        self.bytes_freed += bytes;
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.bytes_allocated_limit
    }

    /// Proportional growth with a fixed floor.
    pub fn proportional_limit(&self, heap_size: usize) -> usize {
        ((heap_size as f64 * self.heap_growth_factor).ceil() as usize).max(self.min_bytes_per_cycle)
    }

    /// Reset the budget after a collection left `heap_size` bytes live.
    /// Returns the share of the previous heap that died.
    pub fn update_after_collection(&mut self, heap_size: usize) -> f64 {
        let before = self.size_after_last_collect + self.bytes_allocated;
        let death_rate = if before == 0 {
            1.0
        } else {
            1.0 - (heap_size.min(before) as f64 / before as f64)
        };
        self.size_after_last_collect = heap_size;
        self.bytes_allocated_limit = self.proportional_limit(heap_size);
        self.bytes_allocated = 0;
        self.bytes_freed = 0;
        death_rate
    }
}
