//! Timer tick handler: advances the monotonic clock and drives the
//! scheduler tick (§4.5, §4.6). Kept minimal — no blocking, no logging on
//! the hot path.

pub fn on_tick() {
    crate::time::increment_ticks();
    crate::task::scheduler::tick();
}
