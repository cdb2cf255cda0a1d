//! Monotonic tick counter.
//!
//! Advanced once per timer interrupt (§4.5); this is the "monotonic current
//! time source" the filesystem timestamps fall back to when no real-time
//! clock is available (§4.7).

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// A fixed epoch used as the base for `current_unix_time` when no RTC
/// collaborator has supplied a real one. Arbitrary but stable within a boot.
const FALLBACK_EPOCH_SECS: u64 = 1_700_000_000;

/// The Unix time `uptime_secs()` was at the last `set_epoch_offset` call (or
/// boot, absent one). `current_unix_time` adds uptime-since-that-call to it.
static EPOCH_OFFSET_SECS: AtomicU64 = AtomicU64::new(FALLBACK_EPOCH_SECS);

pub fn increment_ticks() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Seconds elapsed since boot, derived from the tick counter and the
/// configured timer frequency.
pub fn uptime_secs() -> u64 {
    ticks() / crate::config::TIMER_FREQUENCY_HZ as u64
}

/// Anchor `current_unix_time` to a real wall-clock reading. A collaborator
/// that owns an RTC calls this once with the real current Unix time right
/// after reading it; subsequent calls to `current_unix_time` then track
/// real time instead of the arbitrary fallback epoch.
pub fn set_epoch_offset(unix_time_now: u64) {
    EPOCH_OFFSET_SECS.store(unix_time_now.saturating_sub(uptime_secs()), Ordering::Relaxed);
}

/// Best-effort "current time" for inode timestamps: the epoch offset plus
/// uptime since it was set (see `set_epoch_offset`).
pub fn current_unix_time() -> u32 {
    (EPOCH_OFFSET_SECS.load(Ordering::Relaxed) + uptime_secs()) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_epoch_offset_anchors_current_time() {
        let before = current_unix_time();
        set_epoch_offset(2_000_000_000);
        let after = current_unix_time();
        assert!(after >= 2_000_000_000 - 1);
        assert_ne!(before, after);
    }
}
