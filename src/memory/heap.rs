//! Kernel heap.
//!
//! Byte-granularity allocator over the reserved 16 MiB heap region. Blocks
//! carry a header {magic, size, free, next}; the list is singly linked in
//! address order. Distinct magics for occupied and free blocks catch double
//! frees and header corruption before they spread.
//!
//! First fit, with best fit for large requests. Adjacent free blocks are
//! merged on free (successor immediately, predecessor by an O(n) list
//! scan); a periodic defragmentation pass handles the rest.

use core::ptr;

use spin::Mutex;

use crate::memory::MemError;

/// Magic for a live allocation: "HEAP".
pub const MAGIC_OCCUPIED: u32 = 0x4845_4150;
/// Magic for a free block: "FREE".
pub const MAGIC_FREE: u32 = 0x4652_4545;

/// Requests above this size use best fit instead of first fit.
const BEST_FIT_THRESHOLD: usize = 4096;

/// Defragment when fragmentation exceeds this percentage...
pub const FRAGMENTATION_THRESHOLD: u32 = 40;
/// ...but at most once per this interval,
pub const MIN_DEFRAG_INTERVAL_MS: u32 = 10_000;
/// and at least once per this interval regardless.
pub const FORCE_DEFRAG_INTERVAL_MS: u32 = 60_000;

#[repr(C, align(8))]
struct BlockHeader {
    magic: u32,
    size: usize, // payload bytes, excluding this header
    free: bool,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
/// Smallest splittable remainder: a header plus 8 payload bytes.
const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 8;

/// Heap statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub largest_free: usize,
    /// 1 - largest_free/free, in percent. 0 when nothing is free.
    pub fragmentation_pct: u32,
}

pub struct Heap {
    start: *mut u8,
    size: usize,
    first: *mut BlockHeader,
    last_defrag_tick: u32,
}

// The heap owns its region exclusively; the raw pointers never escape
// unlocked.
unsafe impl Send for Heap {}

impl Heap {
    /// Install a single free block covering [base, base+size).
    ///
    /// # Safety
    /// The region must be writable, exclusive to the heap, and outlive it.
    pub unsafe fn new(base: *mut u8, size: usize) -> Result<Heap, MemError> {
        if base.is_null() || size < MIN_BLOCK_SIZE || (base as usize) % 8 != 0 {
            return Err(MemError::BadAddress);
        }
        let first = base as *mut BlockHeader;
        unsafe {
            first.write(BlockHeader {
                magic: MAGIC_FREE,
                size: size - HEADER_SIZE,
                free: true,
                next: ptr::null_mut(),
            });
        }
        Ok(Heap { start: base, size, first, last_defrag_tick: 0 })
    }

    fn payload(block: *mut BlockHeader) -> *mut u8 {
        unsafe { (block as *mut u8).add(HEADER_SIZE) }
    }

    fn header_of(ptr: *mut u8) -> *mut BlockHeader {
        unsafe { ptr.sub(HEADER_SIZE) as *mut BlockHeader }
    }

    fn in_range(&self, block: *mut BlockHeader) -> bool {
        let addr = block as usize;
        let start = self.start as usize;
        addr >= start && addr + HEADER_SIZE <= start + self.size
    }

    /// Allocate `size` bytes, 8-byte aligned.
    pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let size = (size + 7) & !7;

        let chosen = if size > BEST_FIT_THRESHOLD {
            self.find_best_fit(size)
        } else {
            self.find_first_fit(size)
        }?;

        unsafe {
            self.split_if_worth(chosen, size);
            (*chosen).magic = MAGIC_OCCUPIED;
            (*chosen).free = false;
        }
        Some(Self::payload(chosen))
    }

    fn find_first_fit(&self, size: usize) -> Option<*mut BlockHeader> {
        let mut cur = self.first;
        while !cur.is_null() {
            unsafe {
                if (*cur).free && (*cur).size >= size {
                    return Some(cur);
                }
                cur = (*cur).next;
            }
        }
        None
    }

    fn find_best_fit(&self, size: usize) -> Option<*mut BlockHeader> {
        let mut best: Option<*mut BlockHeader> = None;
        let mut cur = self.first;
        while !cur.is_null() {
            unsafe {
                if (*cur).free && (*cur).size >= size {
                    match best {
                        Some(b) if (*b).size <= (*cur).size => {}
                        _ => best = Some(cur),
                    }
                }
                cur = (*cur).next;
            }
        }
        best
    }

    /// Split `block` so it keeps exactly `size` payload bytes, if the
    /// remainder can stand as a block of its own.
    unsafe fn split_if_worth(&mut self, block: *mut BlockHeader, size: usize) {
        unsafe {
            let excess = (*block).size - size;
            if excess < MIN_BLOCK_SIZE {
                return;
            }
            let rest = Self::payload(block).add(size) as *mut BlockHeader;
            rest.write(BlockHeader {
                magic: MAGIC_FREE,
                size: excess - HEADER_SIZE,
                free: true,
                next: (*block).next,
            });
            (*block).size = size;
            (*block).next = rest;
        }
    }

    /// Release an allocation. Reports `Corruption` (without mutating
    /// anything) when the header magic is wrong, which covers double frees.
    pub fn free(&mut self, p: *mut u8) -> Result<(), MemError> {
        if p.is_null() {
            return Err(MemError::BadAddress);
        }
        let block = Self::header_of(p);
        if !self.in_range(block) {
            return Err(MemError::BadAddress);
        }
        unsafe {
            match (*block).magic {
                MAGIC_OCCUPIED => {}
                MAGIC_FREE => {
                    log_warn!("[HEAP] double free at {:p}", p);
                    return Err(MemError::Corruption);
                }
                _ => {
                    log_warn!("[HEAP] corrupt header at {:p}", p);
                    return Err(MemError::Corruption);
                }
            }
            (*block).magic = MAGIC_FREE;
            (*block).free = true;

            self.merge_with_next(block);

            // Predecessor merge: find the block immediately before this one.
            let mut cur = self.first;
            while !cur.is_null() {
                if (*cur).next == block {
                    if (*cur).free {
                        self.merge_with_next(cur);
                    }
                    break;
                }
                cur = (*cur).next;
            }
        }
        Ok(())
    }

    /// Merge `block` with its successor when both are free and adjacent.
    unsafe fn merge_with_next(&mut self, block: *mut BlockHeader) {
        unsafe {
            let next = (*block).next;
            if next.is_null() || !(*block).free || !(*next).free {
                return;
            }
            // Only physically adjacent blocks fold together.
            if Self::payload(block).add((*block).size) as *mut BlockHeader != next {
                return;
            }
            (*block).size += HEADER_SIZE + (*next).size;
            (*block).next = (*next).next;
        }
    }

    /// Resize an allocation, preserving contents.
    pub fn realloc(&mut self, p: *mut u8, new_size: usize) -> Option<*mut u8> {
        if p.is_null() {
            return self.alloc(new_size);
        }
        let block = Self::header_of(p);
        if !self.in_range(block) {
            return None;
        }
        unsafe {
            if (*block).magic != MAGIC_OCCUPIED {
                return None;
            }
            let old_size = (*block).size;
            if new_size <= old_size {
                return Some(p);
            }
            let new = self.alloc(new_size)?;
            ptr::copy_nonoverlapping(p, new, old_size);
            let _ = self.free(p);
            Some(new)
        }
    }

    /// Walk the whole list merging every run of adjacent free blocks.
    pub fn defragment(&mut self) -> u32 {
        let mut merges = 0;
        let mut cur = self.first;
        while !cur.is_null() {
            unsafe {
                if (*cur).free {
                    loop {
                        let before = (*cur).size;
                        self.merge_with_next(cur);
                        if (*cur).size == before {
                            break;
                        }
                        merges += 1;
                    }
                }
                cur = (*cur).next;
            }
        }
        self.last_defrag_tick = crate::time::ticks();
        merges
    }

    pub fn stats(&self) -> HeapStats {
        let mut used = 0;
        let mut free = 0;
        let mut largest = 0;
        let mut cur = self.first;
        while !cur.is_null() {
            unsafe {
                if (*cur).free {
                    free += (*cur).size;
                    largest = largest.max((*cur).size);
                } else {
                    used += (*cur).size;
                }
                cur = (*cur).next;
            }
        }
        let fragmentation_pct = if free > 0 {
            (100 - largest * 100 / free) as u32
        } else {
            0
        };
        HeapStats { total: self.size, used, free, largest_free: largest, fragmentation_pct }
    }

    /// Whether the periodic maintenance task should defragment now.
    pub fn defrag_due(&self, now_tick: u32) -> bool {
        let elapsed_ms =
            now_tick.wrapping_sub(self.last_defrag_tick) * (1000 / crate::time::TICK_HZ);
        if elapsed_ms < MIN_DEFRAG_INTERVAL_MS {
            return false;
        }
        if elapsed_ms >= FORCE_DEFRAG_INTERVAL_MS {
            return true;
        }
        self.stats().fragmentation_pct > FRAGMENTATION_THRESHOLD
    }

    /// Sum of header-accounted bytes; equals the region size when the list
    /// is intact. Used by integrity checks and tests.
    pub fn accounted_bytes(&self) -> usize {
        let mut total = 0;
        let mut cur = self.first;
        while !cur.is_null() {
            unsafe {
                total += HEADER_SIZE + (*cur).size;
                cur = (*cur).next;
            }
        }
        total
    }
}

// ===== Global heap =====

static KERNEL_HEAP: Mutex<Option<Heap>> = Mutex::new(None);

/// Install the kernel heap over its reserved region.
///
/// # Safety
/// See [`Heap::new`].
pub unsafe fn init(base: *mut u8, size: usize) -> Result<(), MemError> {
    let heap = unsafe { Heap::new(base, size) }?;
    *KERNEL_HEAP.lock() = Some(heap);
    log_info!("[HEAP] {} KiB at {:p}", size / 1024, base);
    Ok(())
}

pub fn kmalloc(size: usize) -> Option<*mut u8> {
    KERNEL_HEAP.lock().as_mut()?.alloc(size)
}

pub fn kfree(p: *mut u8) {
    if let Some(heap) = KERNEL_HEAP.lock().as_mut() {
        let _ = heap.free(p);
    }
}

pub fn krealloc(p: *mut u8, new_size: usize) -> Option<*mut u8> {
    KERNEL_HEAP.lock().as_mut()?.realloc(p, new_size)
}

pub fn heap_stats() -> HeapStats {
    KERNEL_HEAP.lock().as_ref().map(|h| h.stats()).unwrap_or_default()
}

/// One maintenance pass; the housekeeping task calls this every 5 s.
pub fn maintain() {
    let mut guard = KERNEL_HEAP.lock();
    if let Some(heap) = guard.as_mut() {
        if heap.defrag_due(crate::time::ticks()) {
            let merges = heap.defragment();
            if merges > 0 {
                log_debug!("[HEAP] defragmented, {} merges", merges);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap(size: usize) -> (Heap, Vec<u8>) {
        let mut region = vec![0u8; size + 8];
        let base = region.as_mut_ptr();
        let aligned = ((base as usize + 7) & !7) as *mut u8;
        let heap = unsafe { Heap::new(aligned, size) }.unwrap();
        (heap, region)
    }

    #[test]
    fn alloc_returns_aligned_pointers() {
        let (mut heap, _region) = test_heap(4096);
        for req in [1, 3, 8, 13, 64] {
            let p = heap.alloc(req).unwrap();
            assert_eq!(p as usize % 8, 0);
        }
    }

    #[test]
    fn split_and_merge_preserve_accounting() {
        let (mut heap, _region) = test_heap(8192);
        assert_eq!(heap.accounted_bytes(), 8192);

        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(200).unwrap();
        let c = heap.alloc(300).unwrap();
        assert_eq!(heap.accounted_bytes(), 8192);

        heap.free(b).unwrap();
        heap.free(a).unwrap();
        heap.free(c).unwrap();
        assert_eq!(heap.accounted_bytes(), 8192);

        heap.defragment();
        let stats = heap.stats();
        assert_eq!(stats.used, 0);
        // Everything merged back into one block.
        assert_eq!(stats.largest_free, stats.free);
    }

    #[test]
    fn double_free_is_detected_and_harmless() {
        let (mut heap, _region) = test_heap(4096);
        let p = heap.alloc(64).unwrap();
        heap.free(p).unwrap();
        let stats_after_first = heap.stats();
        assert_eq!(heap.free(p), Err(MemError::Corruption));
        assert_eq!(heap.stats(), stats_after_first);
    }

    #[test]
    fn realloc_preserves_contents() {
        let (mut heap, _region) = test_heap(4096);
        let p = heap.alloc(16).unwrap();
        unsafe {
            for i in 0..16 {
                p.add(i).write(i as u8);
            }
        }
        let q = heap.realloc(p, 128).unwrap();
        unsafe {
            for i in 0..16 {
                assert_eq!(q.add(i).read(), i as u8);
            }
        }
    }

    #[test]
    fn large_requests_use_best_fit() {
        let (mut heap, _region) = test_heap(64 * 1024);
        // Carve free blocks of 8 KiB and 6 KiB separated by live blocks.
        let big = heap.alloc(8 * 1024).unwrap();
        let _hold1 = heap.alloc(64).unwrap();
        let small = heap.alloc(6 * 1024).unwrap();
        let _hold2 = heap.alloc(64).unwrap();
        heap.free(big).unwrap();
        heap.free(small).unwrap();

        // A 5 KiB request fits both; best fit must pick the 6 KiB hole.
        let p = heap.alloc(5 * 1024).unwrap();
        assert_eq!(p, small);
    }

    #[test]
    fn exhaustion_returns_none_and_recovers() {
        let (mut heap, _region) = test_heap(1024);
        let p = heap.alloc(900).unwrap();
        assert!(heap.alloc(900).is_none());
        heap.free(p).unwrap();
        assert!(heap.alloc(900).is_some());
    }

    #[test]
    fn fragmentation_percentage_reflects_split_free_space() {
        let (mut heap, _region) = test_heap(16 * 1024);
        let a = heap.alloc(1024).unwrap();
        let _b = heap.alloc(1024).unwrap();
        let c = heap.alloc(1024).unwrap();
        let _d = heap.alloc(1024).unwrap();
        heap.free(a).unwrap();
        heap.free(c).unwrap();
        let stats = heap.stats();
        assert!(stats.fragmentation_pct > 0);
        assert!(stats.largest_free < stats.free);
    }
}
