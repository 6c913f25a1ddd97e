use std::time::Duration;

pub struct HeapStatistics {
    pub marked_blocks: usize,
    pub weak_blocks: usize,
    pub handle_blocks: usize,
    pub copied_blocks: usize,
    pub regions: usize,
    pub regions_created: usize,
    pub regions_destroyed: usize,
    pub empty_regions: usize,
    pub live_objects: usize,
    pub marked_space_size: usize,
    pub marked_space_capacity: usize,
    pub copied_space_size: usize,
    pub copied_space_capacity: usize,
    pub protected_handles: usize,
    pub total_gc_cycles_count: usize,
    pub last_gc_length: Duration,
    pub total_memory_allocated: usize,
    pub heap_threshold: usize,
}

struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> impl std::fmt::Display {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Marked space: {} live of {} in {} blocks",
            formatted_size(self.marked_space_size),
            formatted_size(self.marked_space_capacity),
            self.marked_blocks
        )?;
        writeln!(
            f,
            "  Copied space: {} used of {} in {} blocks",
            formatted_size(self.copied_space_size),
            formatted_size(self.copied_space_capacity),
            self.copied_blocks
        )?;
        writeln!(
            f,
            "  Weak blocks: {}, handle blocks: {} ({} protected handles)",
            self.weak_blocks, self.handle_blocks, self.protected_handles
        )?;
        writeln!(
            f,
            "  Regions: {} live ({} empty), {} created, {} destroyed",
            self.regions, self.empty_regions, self.regions_created, self.regions_destroyed
        )?;
        writeln!(f, "  Live objects: {}", self.live_objects)?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(f, "  Last GC took: {:.3}ms", self.last_gc_length.as_secs_f64() * 1000.0)?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            formatted_size(self.total_memory_allocated)
        )?;
        writeln!(
            f,
            "  Heap threshold: {}",
            formatted_size(self.heap_threshold)
        )?;
        Ok(())
    }
}
