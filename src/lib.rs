mod rkv_lib;

use std::collections::HashSet;
use std::path::PathBuf;

use lazy_static::lazy_static;
use parking_lot::Mutex;

pub use rkv_lib::*;

lazy_static! {
    // Store files currently open in this process; enforces the
    // exclusive-open-per-path contract
    pub(crate) static ref OPEN_PATHS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// Process-wide one-shot initialisation (logging). `Store::open` calls
/// this on its own; embedders may call it earlier.
pub fn init() {
    rkv_lib::utils::init_logs();
}
