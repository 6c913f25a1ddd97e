//! Polled timers.
//!
//! There is no run loop here: the embedder calls
//! [`Heap::service_timers`](crate::heap::Heap::service_timers) whenever it
//! is idle and every due timer fires on the caller's thread.

use std::time::{Duration, Instant};

use crate::globals::MB;

#[derive(Default, Debug)]
pub struct HeapTimer {
    next_fire: Option<Instant>,
}

impl HeapTimer {
    pub const fn new() -> Self {
        Self { next_fire: None }
    }

    pub fn schedule_at(&mut self, when: Instant) {
        self.next_fire = Some(when);
    }

    /// Idempotent.
    pub fn cancel(&mut self) {
        self.next_fire = None;
    }

    pub fn is_scheduled(&self) -> bool {
        self.next_fire.is_some()
    }

    pub fn next_fire(&self) -> Option<Instant> {
        self.next_fire
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.next_fire, Some(when) if when <= now)
    }
}

/// Share of CPU time spent reclaiming one megabyte.
const GC_TIME_SLICE_PER_MB: f64 = 0.01;
/// Upper bound on the CPU share of timer-triggered collections.
const MAX_GC_TIME_SLICE: f64 = 0.05;
/// Only move the timer when the new delay is this much shorter.
const TIMER_SLOP: f64 = 2.0;

fn gc_time_slice(bytes: usize) -> f64 {
    ((bytes as f64 / MB as f64) * GC_TIME_SLICE_PER_MB).min(MAX_GC_TIME_SLICE)
}

/// Schedules an opportunistic collection proportional to how much garbage
/// the mutator is likely producing.
#[derive(Debug)]
pub struct GcActivityCallback {
    timer: HeapTimer,
    delay: Option<Duration>,
    enabled: bool,
}

impl Default for GcActivityCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl GcActivityCallback {
    pub const fn new() -> Self {
        Self {
            timer: HeapTimer::new(),
            delay: None,
            enabled: true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.cancel();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn timer(&self) -> &HeapTimer {
        &self.timer
    }

    /// `bytes` were allocated since the last collection, which took
    /// `last_gc_length` and freed `death_rate` of the heap.
    pub fn did_allocate(&mut self, bytes: usize, last_gc_length: Duration, death_rate: f64) {
        if !self.enabled {
            return;
        }
        let bytes = ((bytes.max(1) as f64) * death_rate.clamp(0.0, 1.0)).max(1.0) as usize;
        let new_delay = last_gc_length.as_secs_f64() / gc_time_slice(bytes);
        if !new_delay.is_finite() {
            return;
        }
        self.schedule(Duration::from_secs_f64(new_delay));
    }

    fn schedule(&mut self, new_delay: Duration) {
        let now = Instant::now();
        match (self.delay, self.timer.next_fire()) {
            (Some(delay), Some(fire)) => {
                if new_delay.as_secs_f64() * TIMER_SLOP > delay.as_secs_f64() {
                    return;
                }
                let delta = delay - new_delay;
                self.delay = Some(new_delay);
                self.timer.schedule_at(fire.checked_sub(delta).unwrap_or(now));
            }
            _ => {
                self.delay = Some(new_delay);
                self.timer.schedule_at(now + new_delay);
            }
        }
    }

    /// A collection is starting anyway.
    pub fn will_collect(&mut self) {
        self.cancel();
    }

    pub fn cancel(&mut self) {
        self.delay = None;
        self.timer.cancel();
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.enabled && self.timer.is_due(now)
    }
}
