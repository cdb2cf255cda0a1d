//! Memory subsystem bringup: physical frame allocator, then the virtual
//! memory mapper, then the kernel heap, in that order (§2).

pub mod frame_allocator;
pub mod heap;
pub mod paging;

use frame_allocator::MemoryRegion;
use x86_64::VirtAddr;

/// Bring up the memory subsystem. Must run exactly once, before any other
/// subsystem that allocates memory (GDT/IDT/scheduler/filesystem all do).
///
/// # Safety
/// `hhdm_offset` must be the offset the loader actually established for the
/// higher-half direct map, and `regions` must describe the real memory map
/// handed to the kernel by the loader.
pub unsafe fn init(regions: &[MemoryRegion], hhdm_offset: VirtAddr) {
    log::info!("memory: initializing (hhdm offset {:#x})", hhdm_offset.as_u64());

    frame_allocator::init(regions, hhdm_offset);
    paging::init(hhdm_offset);
    heap::init();

    log::info!("memory: subsystem ready");
}

/// Translate a loader-supplied `bootloader_api` memory map into the plain
/// `MemoryRegion` slice the frame allocator consumes, so the boot driver
/// doesn't need to depend on `frame_allocator`'s internals directly.
pub fn regions_from_bootinfo(regions: &bootloader_api::info::MemoryRegions) -> alloc::vec::Vec<MemoryRegion> {
    use bootloader_api::info::MemoryRegionKind;
    regions
        .iter()
        .map(|r| MemoryRegion {
            base: r.start,
            length: r.end - r.start,
            usable: matches!(r.kind, MemoryRegionKind::Usable),
        })
        .collect()
}
