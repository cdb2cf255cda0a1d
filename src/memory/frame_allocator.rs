//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame, 1 = used, 0 = free, packed into `u64` words and
//! stored in frames carved out of usable memory itself (§4.1). Word index 0
//! is never consulted by the scan — it backs the lowest megabyte, which is
//! reserved for firmware/BIOS compatibility and is always marked used.

use crate::config::{LOW_MEMORY_RESERVE, MAX_TRACKED_FRAMES};
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

pub const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub usable: bool,
}

struct Bitmap {
    words: &'static mut [u64],
    total_frames: usize,
    free_frames: usize,
}

impl Bitmap {
    fn word_bit(frame_index: usize) -> (usize, u32) {
        (frame_index / BITS_PER_WORD, (frame_index % BITS_PER_WORD) as u32)
    }

    fn is_used(&self, frame_index: usize) -> bool {
        let (w, b) = Self::word_bit(frame_index);
        self.words[w] & (1u64 << b) != 0
    }

    fn set_used(&mut self, frame_index: usize) {
        let (w, b) = Self::word_bit(frame_index);
        self.words[w] |= 1u64 << b;
    }

    fn set_free(&mut self, frame_index: usize) {
        let (w, b) = Self::word_bit(frame_index);
        self.words[w] &= !(1u64 << b);
    }

    /// Linear scan from word index 1 (word 0 backs the reserved low-memory
    /// megabyte) for the first clear bit, lowest index first.
    fn find_first_free(&self) -> Option<usize> {
        let start_word = (LOW_MEMORY_RESERVE / FRAME_SIZE) as usize / BITS_PER_WORD;
        let total_words = self.words.len();
        for w in start_word.max(1)..total_words {
            if self.words[w] != u64::MAX {
                for b in 0..BITS_PER_WORD {
                    if self.words[w] & (1u64 << b) == 0 {
                        let idx = w * BITS_PER_WORD + b;
                        if idx < self.total_frames {
                            return Some(idx);
                        }
                    }
                }
            }
        }
        None
    }

    /// Sweep for the first run of `n` consecutive clear bits, lowest address
    /// first.
    fn find_first_free_run(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let start = (LOW_MEMORY_RESERVE / FRAME_SIZE) as usize;
        let mut run_start = None;
        let mut run_len = 0usize;
        for idx in start..self.total_frames {
            if !self.is_used(idx) {
                if run_len == 0 {
                    run_start = Some(idx);
                }
                run_len += 1;
                if run_len == n {
                    return run_start;
                }
            } else {
                run_len = 0;
                run_start = None;
            }
        }
        None
    }
}

struct FrameAlloc {
    bitmap: Bitmap,
}

static ALLOCATOR: OnceCell<Mutex<FrameAlloc>> = OnceCell::uninit();

#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

/// Initialize the allocator from the loader's memory map.
///
/// `regions` need not be sorted. `hhdm_offset` is added to any physical
/// address to obtain a byte-addressable virtual pointer for the bitmap
/// itself, which is carved out of the first usable region large enough to
/// hold it.
///
/// # Safety
/// The HHDM must already cover all of physical memory up to the chosen
/// bitmap's backing frames, and this must run exactly once.
pub unsafe fn init(regions: &[MemoryRegion], hhdm_offset: VirtAddr) {
    let max_addr = regions
        .iter()
        .filter(|r| r.usable)
        .map(|r| r.base + r.length)
        .max()
        .unwrap_or(0);
    let total_frames = ((max_addr / FRAME_SIZE) as usize).min(MAX_TRACKED_FRAMES).max(1);
    let total_words = (total_frames + BITS_PER_WORD - 1) / BITS_PER_WORD;
    let bitmap_bytes = total_words * core::mem::size_of::<u64>();
    let bitmap_frames = (bitmap_bytes as u64 + FRAME_SIZE - 1) / FRAME_SIZE;

    let mut regions: [MemoryRegion; 256] = {
        let mut buf = [MemoryRegion { base: 0, length: 0, usable: false }; 256];
        let n = regions.len().min(256);
        buf[..n].copy_from_slice(&regions[..n]);
        buf
    };
    let region_count = regions.len().min(256);

    // Find a usable region large enough to hold the bitmap.
    let mut bitmap_phys: Option<u64> = None;
    for r in regions.iter_mut().take(region_count) {
        if r.usable && r.length >= bitmap_frames * FRAME_SIZE {
            let base = r.base;
            r.base += bitmap_frames * FRAME_SIZE;
            r.length -= bitmap_frames * FRAME_SIZE;
            bitmap_phys = Some(base);
            break;
        }
    }
    let bitmap_phys = bitmap_phys.expect("no usable memory region large enough for frame bitmap");

    let bitmap_virt = hhdm_offset + bitmap_phys;
    let words: &'static mut [u64] = core::slice::from_raw_parts_mut(
        bitmap_virt.as_mut_ptr::<u64>(),
        total_words,
    );
    // Start "all used"; usable regions are cleared below.
    for w in words.iter_mut() {
        *w = u64::MAX;
    }

    let mut bitmap = Bitmap {
        words,
        total_frames,
        free_frames: 0,
    };

    for r in regions.iter().take(region_count) {
        if !r.usable || r.length == 0 {
            continue;
        }
        let start = (r.base + FRAME_SIZE - 1) / FRAME_SIZE;
        let end = (r.base + r.length) / FRAME_SIZE;
        for idx in start..end {
            let idx = idx as usize;
            if idx >= total_frames {
                break;
            }
            if bitmap.is_used(idx) {
                bitmap.set_free(idx);
                bitmap.free_frames += 1;
            }
        }
    }

    log::info!(
        "frame allocator: {} frames tracked ({} bitmap frames reserved), {} free",
        total_frames,
        bitmap_frames,
        bitmap.free_frames
    );

    ALLOCATOR
        .try_init_once(|| Mutex::new(FrameAlloc { bitmap }))
        .map_err(|_| ())
        .expect("frame allocator already initialized");
}

pub fn alloc_frame() -> Option<PhysAddr> {
    let lock = ALLOCATOR.try_get().ok()?;
    let mut alloc = lock.lock();
    let idx = alloc.bitmap.find_first_free()?;
    alloc.bitmap.set_used(idx);
    alloc.bitmap.free_frames -= 1;
    log::trace!("alloc_frame -> frame {}", idx);
    Some(PhysAddr::new(idx as u64 * FRAME_SIZE))
}

pub fn alloc_frames(count: usize) -> Option<PhysAddr> {
    if count == 0 {
        return None;
    }
    let lock = ALLOCATOR.try_get().ok()?;
    let mut alloc = lock.lock();
    let start = alloc.bitmap.find_first_free_run(count)?;
    for idx in start..start + count {
        alloc.bitmap.set_used(idx);
    }
    alloc.bitmap.free_frames -= count;
    log::trace!("alloc_frames({}) -> frame {}", count, start);
    Some(PhysAddr::new(start as u64 * FRAME_SIZE))
}

pub fn free_frame(addr: PhysAddr) {
    let Ok(lock) = ALLOCATOR.try_get() else { return };
    let mut alloc = lock.lock();
    let idx = (addr.as_u64() / FRAME_SIZE) as usize;
    if idx >= alloc.bitmap.total_frames {
        return; // out of range: no-op
    }
    if alloc.bitmap.is_used(idx) {
        alloc.bitmap.set_free(idx);
        alloc.bitmap.free_frames += 1;
    }
    // Freeing an already-free frame does not decrement anything further.
}

pub fn free_frames(addr: PhysAddr, count: usize) {
    let base = (addr.as_u64() / FRAME_SIZE) as usize;
    for idx in base..base + count {
        free_frame(PhysAddr::new(idx as u64 * FRAME_SIZE));
    }
}

pub fn stats() -> FrameStats {
    match ALLOCATOR.try_get() {
        Ok(lock) => {
            let alloc = lock.lock();
            FrameStats {
                total: alloc.bitmap.total_frames,
                free: alloc.bitmap.free_frames,
                used: alloc.bitmap.total_frames - alloc.bitmap.free_frames,
            }
        }
        Err(_) => FrameStats { total: 0, free: 0, used: 0 },
    }
}

/// Count of set bits in the live bitmap; used by `selftest` to check
/// invariant 1 of the specification directly against the backing storage
/// rather than the cached counter.
#[cfg(feature = "testing")]
pub fn count_used_bits() -> usize {
    match ALLOCATOR.try_get() {
        Ok(lock) => {
            let alloc = lock.lock();
            alloc.bitmap.words.iter().map(|w| w.count_ones() as usize).sum()
        }
        Err(_) => 0,
    }
}

/// Adapter onto the `x86_64` crate's page-table-building traits, so the VMM
/// can hand this allocator directly to `Mapper::map_to`.
pub struct GlobalFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        alloc_frame().map(|addr| PhysFrame::containing_address(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn make_bitmap(total_frames: usize, words: &'static mut [u64]) -> Bitmap {
        Bitmap { words, total_frames, free_frames: 0 }
    }

    /// Populate `ALLOCATOR` directly from a literal memmap, skipping the
    /// real `init`'s HHDM carve-out (not host-addressable in a unit test):
    /// the bitmap itself lives in a leaked host allocation instead of
    /// physical memory reached through an offset.
    fn init_for_test(total_frames: usize, regions: &[MemoryRegion]) {
        let total_words = (total_frames + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let words: &'static mut [u64] = Box::leak(alloc::vec![u64::MAX; total_words].into_boxed_slice());
        let mut bitmap = Bitmap { words, total_frames, free_frames: 0 };

        for r in regions {
            if !r.usable || r.length == 0 {
                continue;
            }
            let start = (r.base + FRAME_SIZE - 1) / FRAME_SIZE;
            let end = (r.base + r.length) / FRAME_SIZE;
            for idx in start..end {
                let idx = idx as usize;
                if idx >= total_frames {
                    break;
                }
                if bitmap.is_used(idx) {
                    bitmap.set_free(idx);
                    bitmap.free_frames += 1;
                }
            }
        }

        let _ = ALLOCATOR.try_init_once(|| Mutex::new(FrameAlloc { bitmap }));
    }

    /// Drives the public `alloc_frame`/`free_frame` API through the literal
    /// scenario: memmap `[{0, 0x1000, usable}, {0x1000, 0x100000, reserved},
    /// {0x100000, 0x10000000, usable}]`. First allocation lands at the first
    /// usable frame above the 1 MiB reserve, the second directly above it,
    /// and freeing the first and reallocating returns to it (first-fit).
    #[test]
    fn test_alloc_frame_free_frame_public_api_s1() {
        let regions = [
            MemoryRegion { base: 0x0000_0000, length: 0x1000, usable: true },
            MemoryRegion { base: 0x0000_1000, length: 0x100000 - 0x1000, usable: false },
            MemoryRegion { base: 0x0010_0000, length: 0x1000_0000 - 0x0010_0000, usable: true },
        ];
        let total_frames = (0x1000_0000u64 / FRAME_SIZE) as usize;
        init_for_test(total_frames, &regions);

        let first = alloc_frame().expect("first alloc_frame should succeed");
        assert_eq!(first.as_u64(), 0x0010_0000);

        let second = alloc_frame().expect("second alloc_frame should succeed");
        assert_eq!(second.as_u64(), 0x0010_1000);

        free_frame(first);
        let third = alloc_frame().expect("third alloc_frame should succeed");
        assert_eq!(third.as_u64(), 0x0010_0000);
    }

    #[test]
    fn test_word_bit_roundtrip() {
        assert_eq!(Bitmap::word_bit(0), (0, 0));
        assert_eq!(Bitmap::word_bit(63), (0, 63));
        assert_eq!(Bitmap::word_bit(64), (1, 0));
        assert_eq!(Bitmap::word_bit(321), (5, 1));
    }

    #[test]
    fn test_find_first_free_skips_reserved_low_memory() {
        let words: &'static mut [u64] = Box::leak(Box::new([0u64; 8]));
        let bm = make_bitmap(512, words);
        // LOW_MEMORY_RESERVE (0x100000) / FRAME_SIZE (4096) = 256.
        let first = bm.find_first_free().unwrap();
        assert_eq!(first, 256);
    }

    #[test]
    fn test_set_used_free_roundtrip() {
        let words: &'static mut [u64] = Box::leak(Box::new([0u64; 4]));
        let mut bm = make_bitmap(256, words);
        assert!(!bm.is_used(300));
        bm.set_used(10);
        assert!(bm.is_used(10));
        bm.set_free(10);
        assert!(!bm.is_used(10));
    }

    #[test]
    fn test_find_first_free_run() {
        let words: &'static mut [u64] = Box::leak(Box::new([0u64; 8]));
        let mut bm = make_bitmap(512, words);
        // Occupy frame 260 so a run starting at 256 of length 5 is blocked.
        bm.set_used(260);
        let run = bm.find_first_free_run(5).unwrap();
        assert_eq!(run, 261);
    }
}
