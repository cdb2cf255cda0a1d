//! Boot-time configuration constants.
//!
//! A `no_std` kernel has no environment and no config file; the knobs a
//! deployment might want to vary are instead named constants collected here
//! so the boot bringup driver has one surface to read, rather than scattered
//! magic numbers across each subsystem.

/// Log level installed at boot. `log`'s macros compile out below this level
/// at the call site when built with the matching `max_level_*` feature;
/// without that feature this just filters at the logger.
pub const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// Timer tick frequency, in Hz. Drives both the wall-clock tick counter and
/// the unit the scheduler quantum is expressed in.
pub const TIMER_FREQUENCY_HZ: u32 = 100;

/// Ticks a task may run before being preempted (see `task::scheduler`).
pub const DEFAULT_QUANTUM_TICKS: u32 = 10;

/// Bytes requested from the PFA/VMM the first time the heap needs to grow,
/// and every time thereafter that a single growth step doesn't cover the
/// request. Must be a multiple of the frame size.
pub const HEAP_GROW_STEP: usize = 64 * 1024;

/// Virtual address the kernel heap arena begins at. Chosen well above any
/// identity or HHDM mapping so it cannot collide with either.
pub const HEAP_START: usize = 0x_4444_4444_0000;

/// Upper bound on the number of physical frames the PFA will track,
/// regardless of how much usable memory the loader reports. Matches the
/// specification's "bounded ceiling (e.g. 4 GiB)" language.
pub const MAX_TRACKED_FRAMES: usize = (4usize * 1024 * 1024 * 1024) / 4096;

/// Size, in bytes, of the region reserved at the bottom of physical memory
/// for firmware/BIOS compatibility. The frame allocator never hands out
/// frames below this address.
pub const LOW_MEMORY_RESERVE: u64 = 0x0010_0000;

/// Size of each per-task kernel stack, in frames.
pub const KERNEL_STACK_FRAMES: usize = 4;

/// Block count of the RAM disk boot formats and mounts as the root
/// filesystem, absent a real disk driver (§2 data-flow order, §4.7
/// implementation note). 1024-byte blocks, so 4096 blocks is 4 MiB.
pub const ROOT_RAMDISK_BLOCKS: u64 = 4096;
