use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{globals::MB, marked_block::CellDestructor, value::CellPtr, Config};

mod handles;
mod marked;
mod regions;
mod sweeper;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small reservation, no trim thread: tests drive trimming themselves.
pub(crate) fn test_config() -> Config {
    init_logging();
    Config {
        super_region_size: 32 * MB,
        spawn_trim_thread: false,
        ..Config::default()
    }
}

/// A destructor that counts how often it ran.
pub(crate) fn counting_destructor() -> (Arc<dyn CellDestructor>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let destructor: Arc<dyn CellDestructor> = Arc::new(move |_: CellPtr| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    (destructor, count)
}
