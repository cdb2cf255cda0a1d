//! Kernel heap: an intrusive free-list allocator over the VMM (§4.3).
//!
//! Every live byte range handed to a caller is preceded by a `BlockHeader`;
//! headers form a doubly-linked list in address order covering the whole
//! arena. The arena grows by mapping fresh frames right after the current
//! last block and installing a new last-block header there.

use crate::config::HEAP_GROW_STEP;
use crate::memory::frame_allocator;
use crate::memory::paging;
use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::NonNull;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

const MAGIC: u64 = 0x4B45_5250_4845_4150; // "KERPHEAP" bytes, used as a sentinel.
const FLAG_FREE: u8 = 0b01;
const FLAG_LAST: u8 = 0b10;

#[repr(C)]
struct BlockHeader {
    magic: u64,
    total_size: usize,
    flags: u8,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();
const MIN_PAYLOAD: usize = 8;
const MIN_BLOCK_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD;

impl BlockHeader {
    unsafe fn is_free(&self) -> bool {
        self.flags & FLAG_FREE != 0
    }
    unsafe fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }
    fn payload_size(&self) -> usize {
        self.total_size - HEADER_SIZE
    }
    unsafe fn payload_ptr(header: *mut BlockHeader) -> *mut u8 {
        (header as *mut u8).add(HEADER_SIZE)
    }
    unsafe fn from_payload_ptr(ptr: *mut u8) -> *mut BlockHeader {
        ptr.sub(HEADER_SIZE) as *mut BlockHeader
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub arena_bytes: usize,
}

struct Heap {
    head: *mut BlockHeader,
    arena_start: VirtAddr,
    arena_len: usize,
}

unsafe impl Send for Heap {}

impl Heap {
    const fn empty() -> Self {
        Heap { head: core::ptr::null_mut(), arena_start: VirtAddr::zero(), arena_len: 0 }
    }

    /// Map `frames_needed` fresh frames right after the arena's current end
    /// and install a new last-block header spanning them (or extend the
    /// existing tail block, if the arena hasn't been started yet).
    unsafe fn grow(&mut self, min_bytes: usize) -> bool {
        let grow_bytes = min_bytes.max(HEAP_GROW_STEP);
        let frame_size = frame_allocator::FRAME_SIZE as usize;
        let frames_needed = (grow_bytes + frame_size - 1) / frame_size;

        let growth_start = if self.head.is_null() {
            self.arena_start
        } else {
            VirtAddr::new(self.arena_start.as_u64() + self.arena_len as u64)
        };

        for i in 0..frames_needed {
            let Some(phys) = frame_allocator::alloc_frame() else {
                return false;
            };
            let virt = growth_start + (i as u64 * frame_size as u64);
            let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
            if !paging::map_page(virt, phys, flags) {
                frame_allocator::free_frame(phys);
                return false;
            }
        }

        let added = frames_needed * frame_size;
        let new_header = growth_start.as_mut_ptr::<BlockHeader>();

        if self.head.is_null() {
            *new_header = BlockHeader {
                magic: MAGIC,
                total_size: added,
                flags: FLAG_FREE | FLAG_LAST,
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
            };
            self.head = new_header;
        } else {
            let old_last = self.last_block();
            (*old_last).flags &= !FLAG_LAST;
            *new_header = BlockHeader {
                magic: MAGIC,
                total_size: added,
                flags: FLAG_FREE | FLAG_LAST,
                prev: old_last,
                next: core::ptr::null_mut(),
            };
            (*old_last).next = new_header;
        }

        self.arena_len += added;
        log::debug!("heap: grew arena by {} bytes ({} frames)", added, frames_needed);
        true
    }

    unsafe fn last_block(&self) -> *mut BlockHeader {
        let mut cur = self.head;
        while !(*cur).is_last() {
            cur = (*cur).next;
        }
        cur
    }

    /// Split `block` if its payload has room for a header plus a minimum
    /// payload beyond `needed`; returns true if a split happened.
    unsafe fn maybe_split(&mut self, block: *mut BlockHeader, needed_total: usize) {
        let remainder = (*block).total_size - needed_total;
        if remainder < MIN_BLOCK_SIZE {
            return;
        }
        let new_block = (block as *mut u8).add(needed_total) as *mut BlockHeader;
        let was_last = (*block).is_last();
        *new_block = BlockHeader {
            magic: MAGIC,
            total_size: remainder,
            flags: FLAG_FREE | if was_last { FLAG_LAST } else { 0 },
            prev: block,
            next: (*block).next,
        };
        if !(*block).next.is_null() {
            (*(*block).next).prev = new_block;
        }
        (*block).next = new_block;
        (*block).total_size = needed_total;
        (*block).flags &= !FLAG_LAST;
    }

    unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        let size = (size + 7) & !7;
        let needed_total = size + HEADER_SIZE;

        loop {
            if !self.head.is_null() {
                let mut cur = self.head;
                loop {
                    if (*cur).is_free() && (*cur).total_size >= needed_total {
                        self.maybe_split(cur, needed_total);
                        (*cur).flags &= !FLAG_FREE;
                        return BlockHeader::payload_ptr(cur);
                    }
                    if (*cur).is_last() {
                        break;
                    }
                    cur = (*cur).next;
                }
            }
            if !self.grow(needed_total) {
                return core::ptr::null_mut();
            }
        }
    }

    unsafe fn coalesce_forward(&mut self, block: *mut BlockHeader) {
        let next = (*block).next;
        if next.is_null() || !(*next).is_free() {
            return;
        }
        (*block).total_size += (*next).total_size;
        if (*next).is_last() {
            (*block).flags |= FLAG_LAST;
        }
        (*block).next = (*next).next;
        if !(*next).next.is_null() {
            (*(*next).next).prev = block;
        }
    }

    unsafe fn free(&mut self, ptr: *mut u8) {
        let block = BlockHeader::from_payload_ptr(ptr);
        if (*block).magic != MAGIC {
            log::warn!("heap::free: bad magic at {:p}, ignoring", block);
            return; // corrupted header: best-effort no-op
        }
        (*block).flags |= FLAG_FREE;

        self.coalesce_forward(block);
        let prev = (*block).prev;
        if !prev.is_null() && (*prev).is_free() {
            self.coalesce_forward(prev);
        }
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let new_size = (new_size + 7) & !7;
        let block = BlockHeader::from_payload_ptr(ptr);
        if (*block).magic != MAGIC {
            return core::ptr::null_mut();
        }
        let old_payload = (*block).payload_size();

        if new_size <= old_payload {
            self.maybe_split(block, new_size + HEADER_SIZE);
            return ptr;
        }

        let next = (*block).next;
        if !next.is_null() && (*next).is_free() {
            let combined = (*block).total_size + (*next).total_size;
            if combined >= new_size + HEADER_SIZE {
                self.coalesce_forward(block);
                self.maybe_split(block, new_size + HEADER_SIZE);
                return ptr;
            }
        }

        let new_ptr = self.alloc(new_size);
        if new_ptr.is_null() {
            return core::ptr::null_mut();
        }
        core::ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(new_size));
        self.free(ptr);
        new_ptr
    }

    fn stats(&self) -> HeapStats {
        let mut stats = HeapStats { allocated_blocks: 0, free_blocks: 0, arena_bytes: self.arena_len };
        if self.head.is_null() {
            return stats;
        }
        unsafe {
            let mut cur = self.head;
            loop {
                if (*cur).is_free() {
                    stats.free_blocks += 1;
                } else {
                    stats.allocated_blocks += 1;
                }
                if (*cur).is_last() {
                    break;
                }
                cur = (*cur).next;
            }
        }
        stats
    }

    /// Checks the invariants of §8.3 against the live list. Returns `Err`
    /// with a short description of the first violation found.
    #[cfg(feature = "testing")]
    fn check_consistency(&self) -> Result<(), &'static str> {
        if self.head.is_null() {
            return Ok(());
        }
        unsafe {
            let mut cur = self.head;
            let mut total = 0usize;
            let mut last_count = 0usize;
            loop {
                if (*cur).magic != MAGIC {
                    return Err("bad magic");
                }
                total += (*cur).total_size;
                if (*cur).is_last() {
                    last_count += 1;
                }
                let next = (*cur).next;
                if !next.is_null() {
                    if (*next).prev != cur {
                        return Err("broken prev link");
                    }
                    if (*cur).is_free() && (*next).is_free() {
                        return Err("adjacent free blocks");
                    }
                }
                if (*cur).is_last() {
                    break;
                }
                cur = next;
            }
            if last_count != 1 {
                return Err("arena does not have exactly one last block");
            }
            if total != self.arena_len {
                return Err("block sizes do not sum to arena length");
            }
        }
        Ok(())
    }
}

struct LockedHeap(Mutex<Heap>);

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().alloc(layout.size().max(layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        self.0.lock().realloc(ptr, new_size)
    }
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap(Mutex::new(Heap::empty()));

/// Initialize the heap arena at `HEAP_START`. Must run after the VMM is up.
pub fn init() {
    let mut heap = ALLOCATOR.0.lock();
    heap.arena_start = VirtAddr::new(crate::config::HEAP_START as u64);
    unsafe {
        heap.grow(HEAP_GROW_STEP);
    }
    log::info!("heap: initialized at {:#x}", heap.arena_start.as_u64());
}

pub fn kalloc(size: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe { ALLOCATOR.0.lock().alloc(size) };
    NonNull::new(ptr)
}

pub fn kfree(ptr: NonNull<u8>) {
    unsafe { ALLOCATOR.0.lock().free(ptr.as_ptr()) };
}

pub fn krealloc(ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
    let new_ptr = unsafe { ALLOCATOR.0.lock().realloc(ptr.as_ptr(), new_size) };
    NonNull::new(new_ptr)
}

pub fn stats() -> HeapStats {
    ALLOCATOR.0.lock().stats()
}

#[cfg(feature = "testing")]
pub fn check_consistency() -> Result<(), &'static str> {
    ALLOCATOR.0.lock().check_consistency()
}

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    log::error!("heap allocation failed: {:?}", layout);
    crate::hlt_loop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    unsafe fn fresh_heap(arena_bytes: usize) -> Heap {
        let buf: &'static mut [u8] = Box::leak(alloc::vec![0u8; arena_bytes].into_boxed_slice());
        let header = buf.as_mut_ptr() as *mut BlockHeader;
        *header = BlockHeader {
            magic: MAGIC,
            total_size: arena_bytes,
            flags: FLAG_FREE | FLAG_LAST,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
        };
        Heap {
            head: header,
            arena_start: VirtAddr::new(buf.as_ptr() as u64),
            arena_len: arena_bytes,
        }
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        unsafe {
            let mut heap = fresh_heap(4096);
            let p1 = heap.alloc(100);
            assert!(!p1.is_null());
            let p2 = heap.alloc(200);
            assert!(!p2.is_null());
            heap.free(p1);
            let p3 = heap.alloc(50);
            assert_eq!(p1, p3, "first-fit should reuse the freed 100-byte hole");
            assert!(heap.check_consistency().is_ok());
        }
    }

    #[test]
    fn test_coalesce_leaves_no_adjacent_free_blocks() {
        unsafe {
            let mut heap = fresh_heap(4096);
            let p1 = heap.alloc(64);
            let p2 = heap.alloc(64);
            let p3 = heap.alloc(64);
            heap.free(p1);
            heap.free(p2);
            heap.free(p3);
            assert!(heap.check_consistency().is_ok());
            // A single allocation spanning roughly the freed region should
            // now succeed, proving the holes coalesced into one block.
            let big = heap.alloc(150);
            assert!(!big.is_null());
        }
    }

    #[test]
    fn test_bad_magic_free_is_noop() {
        unsafe {
            let mut heap = fresh_heap(4096);
            let p1 = heap.alloc(32);
            let header = BlockHeader::from_payload_ptr(p1);
            (*header).magic = 0xBAD;
            heap.free(p1); // must not panic or corrupt the list
            (*header).magic = MAGIC;
            assert!(heap.check_consistency().is_ok());
        }
    }

    #[test]
    fn test_split_minimum_remainder() {
        unsafe {
            let mut heap = fresh_heap(4096);
            let before = heap.stats();
            assert_eq!(before.free_blocks, 1);
            let _ = heap.alloc(8);
            let after = heap.stats();
            assert_eq!(after.allocated_blocks, 1);
            assert_eq!(after.free_blocks, 1, "remainder should still be one free block");
        }
    }
}
