//! Runtime invariant checks, run after bringup under the `testing` feature.
//!
//! Each check logs a pass/fail line rather than asserting, so a failure is
//! visible on the serial console of a system that otherwise keeps running.

use crate::fs;
use crate::memory::{frame_allocator, heap};
use crate::task::scheduler;

fn check(name: &str, ok: bool) {
    if ok {
        log::info!("selftest: {} ... ok", name);
    } else {
        log::error!("selftest: {} ... FAILED", name);
    }
}

/// Run the battery of post-bringup checks. Does not halt or panic on
/// failure; intended for a developer watching the serial log.
pub fn run() {
    log::info!("selftest: running");

    let frames = frame_allocator::stats();
    check("frame allocator accounting", frames.used + frames.free == frames.total);

    check("heap consistency", heap::check_consistency().is_ok());

    check("scheduler has a current task", scheduler::current_task().is_some());
    check("scheduler ready queue accounted for", scheduler::ready_len() <= scheduler::task_count());

    check("root filesystem mounted", fs::ext2::is_mounted());
    let root_readable = fs::ext2::root_fs()
        .as_ref()
        .map(|root| root.resolve_path("/").is_ok())
        .unwrap_or(false);
    check("root directory resolves", root_readable);

    log::info!("selftest: done");
}
