use std::time::{Duration, Instant};

use crate::{
    error::HeapResult,
    heap_timer::HeapTimer,
    marked_block::SweepMode,
    marked_space::{MarkedBlockId, MarkedSpace},
    Config,
};

/// Sweeps the blocks seen at the end of marking in short timed slices.
///
/// Each firing sweeps for about `time_slice`, then reschedules itself so
/// that sweeping takes roughly `time_slice / time_total` of wall-clock time.
/// Blocks freed meanwhile or not needing a sweep are skipped.
pub struct IncrementalSweeper {
    timer: HeapTimer,
    blocks_to_sweep: Vec<MarkedBlockId>,
    current_index: usize,
    time_slice: Duration,
    time_total: Duration,
    blocks_swept: usize,
}

impl IncrementalSweeper {
    pub fn new(config: &Config) -> Self {
        Self {
            timer: HeapTimer::new(),
            blocks_to_sweep: Vec::new(),
            current_index: 0,
            time_slice: config.sweep_time_slice,
            time_total: config.sweep_time_total,
            blocks_swept: 0,
        }
    }

    /// Delay between two firings.
    pub fn interval(&self) -> Duration {
        let total = self.time_total.as_secs_f64();
        if total <= 0.0 {
            return self.time_slice;
        }
        self.time_slice.mul_f64(1.0 / total)
    }

    /// Schedule the next firing one interval after `now` on the caller's
    /// clock.
    fn schedule_timer(&mut self, now: Instant) {
        let interval = self.interval();
        self.timer.schedule_at(now + interval);
    }

    fn cancel_timer(&mut self) {
        self.timer.cancel();
    }

    pub fn start_sweeping(&mut self, blocks: Vec<MarkedBlockId>) {
        log::debug!("incremental sweep of {} blocks scheduled", blocks.len());
        self.blocks_to_sweep = blocks;
        self.current_index = 0;
        self.schedule_timer(Instant::now());
    }

    /// Cancel the incremental sweep; a synchronous sweep takes over.
    /// Idempotent.
    pub fn will_finish_sweeping(&mut self) {
        self.current_index = 0;
        self.blocks_to_sweep.clear();
        self.cancel_timer();
    }

    /// Timer callback: sweep if the timer is due at `now`. The slice and
    /// the next firing are measured from `now`.
    pub fn fire(&mut self, space: &mut MarkedSpace, now: Instant) -> HeapResult<bool> {
        if !self.timer.is_due(now) {
            return Ok(false);
        }
        self.do_sweep(space, now)?;
        Ok(true)
    }

    pub fn do_sweep(&mut self, space: &mut MarkedSpace, sweep_begin: Instant) -> HeapResult<()> {
        while self.current_index < self.blocks_to_sweep.len() {
            self.sweep_next_block(space)?;
            let elapsed = Instant::now().saturating_duration_since(sweep_begin);
            if elapsed < self.time_slice {
                continue;
            }
            if self.current_index < self.blocks_to_sweep.len() {
                self.schedule_timer(sweep_begin + elapsed);
                return Ok(());
            }
        }
        log::trace!("incremental sweep finished");
        self.blocks_to_sweep.clear();
        self.current_index = 0;
        self.cancel_timer();
        Ok(())
    }

    /// Sweep the next block of the snapshot that needs it. Returns whether
    /// a block was swept.
    pub fn sweep_next_block(&mut self, space: &mut MarkedSpace) -> HeapResult<bool> {
        while self.current_index < self.blocks_to_sweep.len() {
            let id = self.blocks_to_sweep[self.current_index];
            self.current_index += 1;
            if !space.sweep_block(id, SweepMode::SweepOnly)? {
                continue;
            }
            self.blocks_swept += 1;
            space.free_or_shrink(id);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_sweeping(&self) -> bool {
        self.current_index < self.blocks_to_sweep.len()
    }

    pub fn remaining(&self) -> usize {
        self.blocks_to_sweep.len() - self.current_index
    }

    pub fn timer(&self) -> &HeapTimer {
        &self.timer
    }

    /// Blocks swept over the sweeper's lifetime.
    pub fn blocks_swept(&self) -> usize {
        self.blocks_swept
    }
}
