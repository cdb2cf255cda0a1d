//! Virtual memory mapper: the four-level x86-64 page table tree (§4.2).
//!
//! Built on the `x86_64` crate's `OffsetPageTable`/`Mapper` machinery, which
//! implements exactly the level-by-level walk-and-allocate-on-demand
//! algorithm the specification describes; this module is the thin,
//! HHDM-aware layer around it that the rest of the kernel calls through.
//!
//! `init` does not simply trust the loader's flags on the HHDM window and
//! the kernel image: it forces the HHDM range writable and non-executable,
//! and the kernel image's own L4 slot writable, before installing the new
//! root (§4.2).

use crate::config::MAX_TRACKED_FRAMES;
use crate::memory::frame_allocator::{GlobalFrameAllocator, FRAME_SIZE};
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    Translate,
};
use x86_64::{PhysAddr, VirtAddr};

static HHDM_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();
static MAPPER: OnceCell<Mutex<OffsetPageTable<'static>>> = OnceCell::uninit();

/// Lowest 1 MiB, identity-mapped for firmware/BIOS compatibility (§4.2).
const IDENTITY_MAP_END: u64 = 0x0010_0000;

/// Returns a mutable reference to a physical frame via the HHDM.
unsafe fn frame_to_table(frame: PhysFrame, hhdm_offset: VirtAddr) -> &'static mut PageTable {
    let virt = hhdm_offset + frame.start_address().as_u64();
    &mut *virt.as_mut_ptr::<PageTable>()
}

/// A byte address inside the kernel's own image (its `.text`/`.data`), used
/// only as a representative pointer to find which L4 slot the kernel image
/// lives in. Its value is never read.
static KERNEL_IMAGE_MARKER: u8 = 0;

/// OR `flags` into every present L4 entry spanning `[start, end)`. Both the
/// HHDM and the kernel image are mapped entirely within one or a handful of
/// 512 GiB L4 slots in this core's layout, so L4 granularity is enough to
/// "make sure" a region carries a flag without walking the full L3/L2/L1
/// chain underneath it.
fn force_l4_flags(l4: &mut PageTable, start: VirtAddr, end: VirtAddr, flags: PageTableFlags) {
    let start_idx = (start.as_u64() >> 39) as usize & 0x1FF;
    let end_idx = ((end.as_u64().saturating_sub(1)) >> 39) as usize & 0x1FF;
    for idx in start_idx..=end_idx {
        let entry = &mut l4[idx];
        if !entry.is_unused() {
            let existing = entry.flags();
            entry.set_flags(existing | flags);
        }
    }
}

/// Takes over from the loader's identity map: builds a fresh L4 root that
/// shares the loader's existing mappings, ensures the lowest 1 MiB is
/// identity-mapped, and installs the new root.
///
/// # Safety
/// `hhdm_offset` must be the offset the loader actually established, and
/// this must run before the frame allocator's bitmap frames are reused for
/// anything else (the fresh root is itself carved from it).
pub unsafe fn init(hhdm_offset: VirtAddr) {
    HHDM_OFFSET
        .try_init_once(|| hhdm_offset)
        .expect("paging::init called twice");

    let (current_l4_frame, _) = Cr3::read();
    let current_l4 = frame_to_table(current_l4_frame, hhdm_offset);

    let new_l4_frame = GlobalFrameAllocator
        .allocate_frame()
        .expect("no frame available to build the kernel's L4 root");
    let new_l4 = frame_to_table(new_l4_frame, hhdm_offset);
    new_l4.zero();
    for (i, entry) in current_l4.iter().enumerate() {
        new_l4[i] = entry.clone();
    }

    // The loader's flags on the HHDM and kernel-image ranges are not a
    // contract this core can rely on; force them rather than trust them.
    // HHDM: writable and never executable, spanning the full tracked
    // physical range.
    let hhdm_end = hhdm_offset + (MAX_TRACKED_FRAMES as u64 * FRAME_SIZE);
    force_l4_flags(
        new_l4,
        hhdm_offset,
        hhdm_end,
        PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
    );
    // Kernel image: writable (for its .data/.bss), execute bit left alone
    // since .text in the same L4 slot must remain executable.
    let kernel_addr = VirtAddr::new(core::ptr::addr_of!(KERNEL_IMAGE_MARKER) as u64);
    force_l4_flags(new_l4, kernel_addr, kernel_addr + 1u64, PageTableFlags::WRITABLE);

    // Install the new root so the remainder of this function (and every
    // mapping call after it) operates against the kernel's own tree.
    Cr3::write(new_l4_frame, Cr3::read().1);

    let mut mapper = OffsetPageTable::new(new_l4, hhdm_offset);

    // Identity-map the lowest 1 MiB if it is not already covered (the loader
    // usually covers it, but the contract is explicit about this).
    let mut addr = 0u64;
    while addr < IDENTITY_MAP_END {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(addr));
        if mapper.translate_addr(page.start_address()).is_none() {
            let frame = PhysFrame::containing_address(PhysAddr::new(addr));
            let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            let _ = mapper
                .map_to(page, frame, flags, &mut GlobalFrameAllocator)
                .map(|flush| flush.flush());
        }
        addr += Size4KiB::SIZE;
    }

    log::info!("paging: kernel L4 root installed, HHDM offset {:#x}", hhdm_offset.as_u64());

    MAPPER
        .try_init_once(|| Mutex::new(mapper))
        .map_err(|_| ())
        .expect("paging mapper already initialized");
}

/// Map one page with the given flags. Allocates any intermediate page-table
/// nodes needed along the way (§4.2); returns `false` on out-of-memory.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> bool {
    let Ok(lock) = MAPPER.try_get() else { return false };
    let mut mapper = lock.lock();
    let page = Page::<Size4KiB>::containing_address(virt);
    let frame = PhysFrame::<Size4KiB>::containing_address(phys);
    match unsafe { mapper.map_to(page, frame, flags | PageTableFlags::PRESENT, &mut GlobalFrameAllocator) } {
        Ok(flush) => {
            flush.flush();
            true
        }
        Err(e) => {
            log::debug!("map_page({:#x} -> {:#x}) failed: {:?}", virt.as_u64(), phys.as_u64(), e);
            false
        }
    }
}

/// Unmap one page. Returns `false` if it was not mapped. The freed L1 entry
/// is cleared and the TLB invalidated; intermediate nodes are left in place
/// even if now empty (§4.2's stated policy).
pub fn unmap_page(virt: VirtAddr) -> bool {
    let Ok(lock) = MAPPER.try_get() else { return false };
    let mut mapper = lock.lock();
    let page = Page::<Size4KiB>::containing_address(virt);
    match mapper.unmap(page) {
        Ok((_frame, flush)) => {
            flush.flush();
            true
        }
        Err(_) => false,
    }
}

/// Translate a virtual address to its physical address, or `None` if any
/// level of the walk is absent.
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    let lock = MAPPER.try_get().ok()?;
    let mapper = lock.lock();
    mapper.translate_addr(virt)
}

/// Physical-to-virtual translation through the HHDM window.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    let offset = *HHDM_OFFSET.try_get().expect("paging::init not called");
    offset + phys.as_u64()
}

pub fn hhdm_offset() -> VirtAddr {
    *HHDM_OFFSET.try_get().expect("paging::init not called")
}

/// Switch the active address space to a different L4 root. Offered for a
/// future multi-address-space caller; the boot bringup driver never calls
/// this itself (see SPEC_FULL.md §4.2 implementation note).
///
/// # Safety
/// `root` must be a valid, fully-populated L4 table whose upper half matches
/// the kernel's.
pub unsafe fn switch_address_space(root: PhysFrame) {
    let (_, flags) = Cr3::read();
    Cr3::write(root, flags);
}

#[cfg(test)]
mod tests {
    use super::{force_l4_flags, IDENTITY_MAP_END};
    use x86_64::structures::paging::{PageTable, PageTableFlags};
    use x86_64::{PhysAddr, VirtAddr};

    #[test]
    fn test_identity_map_covers_first_megabyte() {
        assert_eq!(IDENTITY_MAP_END, 0x0010_0000);
    }

    #[test]
    fn test_force_l4_flags_ors_into_present_entries_only() {
        let mut table = PageTable::new();
        table[0].set_addr(PhysAddr::new(0x1000), PageTableFlags::PRESENT);

        force_l4_flags(
            &mut table,
            VirtAddr::new(0),
            VirtAddr::new(1),
            PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
        );

        assert!(table[0].flags().contains(PageTableFlags::WRITABLE));
        assert!(table[0].flags().contains(PageTableFlags::NO_EXECUTE));
        assert!(table[1].is_unused());
    }
}
