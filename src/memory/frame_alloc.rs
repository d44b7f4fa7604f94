//! Physical frame allocator.
//!
//! Owns every usable 4 KiB frame reported by the boot memory map. A single
//! bitmap spans all usable regions concatenated in sorted order; bit set
//! means free. The bitmap itself lives at the tail of the first region
//! large enough to hold it twice over, and those frames are marked used.
//!
//! Frees of unaligned or out-of-region addresses are silent no-ops; a
//! double free is detected (the bit is already set) and leaves the bitmap
//! untouched.

use spin::Mutex;

use crate::boot::MemMapEntry;
use crate::memory::layout::{page_align_down, page_align_up, PhysAddr, PAGE_SIZE};
use crate::memory::MemError;

/// A sorted, merged run of usable physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub base: PhysAddr,
    pub pages: u32,
}

impl FrameRange {
    pub fn end(&self) -> PhysAddr {
        self.base + self.pages * PAGE_SIZE
    }
}

pub const MAX_RANGES: usize = 32;

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total_pages: u32,
    pub free_pages: u32,
    pub used_pages: u32,
}

pub struct FrameAllocator<'a> {
    ranges: heapless::Vec<FrameRange, MAX_RANGES>,
    bitmap: &'a mut [u32],
    total_pages: u32,
    free_pages: u32,
}

/// Sort available map entries, clip them to page boundaries, and merge
/// adjacent or overlapping runs.
pub fn collect_ranges(mmap: &[MemMapEntry]) -> heapless::Vec<FrameRange, MAX_RANGES> {
    let mut ranges: heapless::Vec<FrameRange, MAX_RANGES> = heapless::Vec::new();

    for entry in mmap.iter().filter(|e| e.is_available()) {
        // Beyond 4 GiB is unreachable with 32-bit paging.
        if entry.base >= u32::MAX as u64 {
            continue;
        }
        let base = page_align_up(entry.base as u32);
        let end = page_align_down(entry.base.saturating_add(entry.length).min(u32::MAX as u64) as u32);
        if end <= base || end - base < PAGE_SIZE {
            continue;
        }
        let _ = ranges.push(FrameRange { base, pages: (end - base) / PAGE_SIZE });
    }

    ranges.sort_unstable_by_key(|r| r.base);

    // Merge overlapping or touching runs.
    let mut merged: heapless::Vec<FrameRange, MAX_RANGES> = heapless::Vec::new();
    for r in ranges {
        match merged.last_mut() {
            Some(last) if r.base <= last.end() => {
                let new_end = r.end().max(last.end());
                last.pages = (new_end - last.base) / PAGE_SIZE;
            }
            _ => {
                let _ = merged.push(r);
            }
        }
    }
    merged
}

/// Bytes of bitmap needed to track `total_pages` frames, in whole words.
pub fn bitmap_bytes(total_pages: u32) -> usize {
    (((total_pages as usize) + 31) / 32) * 4
}

/// Pick the physical placement for the bitmap: the tail of the first range
/// that can hold twice its size.
pub fn place_bitmap(ranges: &[FrameRange], bytes: usize) -> Option<PhysAddr> {
    let need = page_align_up(bytes as u32);
    ranges
        .iter()
        .find(|r| r.pages * PAGE_SIZE >= 2 * need)
        .map(|r| r.end() - need)
}

impl<'a> FrameAllocator<'a> {
    /// Build the allocator over pre-collected ranges and caller-provided
    /// bitmap storage. All frames start free except the bitmap's own.
    pub fn new(
        ranges: heapless::Vec<FrameRange, MAX_RANGES>,
        bitmap: &'a mut [u32],
    ) -> Result<FrameAllocator<'a>, MemError> {
        let total_pages: u32 = ranges.iter().map(|r| r.pages).sum();
        if total_pages == 0 {
            return Err(MemError::OutOfMemory);
        }
        if bitmap.len() * 32 < total_pages as usize {
            return Err(MemError::OutOfMemory);
        }

        bitmap.fill(!0);
        // Clear padding bits past the last page so word scans never find them.
        let tail_bits = (total_pages % 32) as usize;
        if tail_bits != 0 {
            let last = (total_pages as usize) / 32;
            bitmap[last] = (1u32 << tail_bits) - 1;
            for w in bitmap.iter_mut().skip(last + 1) {
                *w = 0;
            }
        }

        Ok(FrameAllocator { ranges, bitmap, total_pages, free_pages: total_pages })
    }

    /// Translate a global page index to its physical address.
    fn index_to_phys(&self, mut index: u32) -> Option<PhysAddr> {
        for r in self.ranges.iter() {
            if index < r.pages {
                return Some(r.base + index * PAGE_SIZE);
            }
            index -= r.pages;
        }
        None
    }

    /// Translate a physical address to its global page index. `None` for
    /// unaligned addresses or addresses outside every range.
    fn phys_to_index(&self, phys: PhysAddr) -> Option<u32> {
        if phys % PAGE_SIZE != 0 {
            return None;
        }
        let mut skipped = 0u32;
        for r in self.ranges.iter() {
            if phys >= r.base && phys < r.end() {
                return Some(skipped + (phys - r.base) / PAGE_SIZE);
            }
            skipped += r.pages;
        }
        None
    }

    fn bit_is_free(&self, index: u32) -> bool {
        self.bitmap[(index / 32) as usize] & (1 << (index % 32)) != 0
    }

    fn clear_bit(&mut self, index: u32) {
        self.bitmap[(index / 32) as usize] &= !(1 << (index % 32));
    }

    fn set_bit(&mut self, index: u32) {
        self.bitmap[(index / 32) as usize] |= 1 << (index % 32);
    }

    /// Allocate one free frame.
    pub fn alloc_page(&mut self) -> Result<PhysAddr, MemError> {
        for (w, &word) in self.bitmap.iter().enumerate() {
            if word != 0 {
                let bit = word.trailing_zeros();
                let index = w as u32 * 32 + bit;
                self.clear_bit(index);
                self.free_pages -= 1;
                return self.index_to_phys(index).ok_or(MemError::Corruption);
            }
        }
        Err(MemError::OutOfMemory)
    }

    /// Allocate `count` physically contiguous frames, first fit.
    pub fn alloc_pages(&mut self, count: u32) -> Result<PhysAddr, MemError> {
        if count == 0 {
            return Err(MemError::OutOfMemory);
        }
        if count == 1 {
            return self.alloc_page();
        }

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for index in 0..self.total_pages {
            if self.bit_is_free(index) {
                if run_len == 0 {
                    run_start = index;
                }
                // Contiguity in index space must also be contiguity in
                // physical space: check for a range seam.
                if run_len > 0 {
                    let prev = self.index_to_phys(index - 1).ok_or(MemError::Corruption)?;
                    let cur = self.index_to_phys(index).ok_or(MemError::Corruption)?;
                    if cur != prev + PAGE_SIZE {
                        run_start = index;
                        run_len = 0;
                    }
                }
                run_len += 1;
                if run_len == count {
                    for i in run_start..run_start + count {
                        self.clear_bit(i);
                    }
                    self.free_pages -= count;
                    return self.index_to_phys(run_start).ok_or(MemError::Corruption);
                }
            } else {
                run_len = 0;
            }
        }
        Err(MemError::OutOfMemory)
    }

    /// Return one frame. Bad input is a no-op; a double free is detected
    /// and logged without touching the bitmap.
    pub fn free_page(&mut self, phys: PhysAddr) {
        let Some(index) = self.phys_to_index(phys) else {
            return;
        };
        if self.bit_is_free(index) {
            log_warn!("[PMM] double free of frame {:#010x}", phys);
            return;
        }
        self.set_bit(index);
        self.free_pages += 1;
    }

    /// Return `count` contiguous frames starting at `phys`.
    pub fn free_pages(&mut self, phys: PhysAddr, count: u32) {
        for i in 0..count {
            self.free_page(phys + i * PAGE_SIZE);
        }
    }

    /// Carve a physical range out of the allocator (kernel image, heap
    /// region, MMIO windows). Frames already allocated are left as-is.
    pub fn exclude(&mut self, start: PhysAddr, size: u32) {
        let end = page_align_up(start.saturating_add(size));
        let start = page_align_down(start);
        let mut phys = start;
        while phys < end {
            if let Some(index) = self.phys_to_index(phys) {
                if self.bit_is_free(index) {
                    self.clear_bit(index);
                    self.free_pages -= 1;
                }
            }
            phys += PAGE_SIZE;
        }
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_pages: self.total_pages,
            free_pages: self.free_pages,
            used_pages: self.total_pages - self.free_pages,
        }
    }
}

// ===== Global allocator instance =====

static FRAME_ALLOCATOR: Mutex<Option<FrameAllocator<'static>>> = Mutex::new(None);

/// Install the global frame allocator. Called once from `memory::init`.
pub fn init_global(alloc: FrameAllocator<'static>) {
    let stats = alloc.stats();
    *FRAME_ALLOCATOR.lock() = Some(alloc);
    log_info!(
        "[PMM] {} pages tracked, {} free ({} MiB)",
        stats.total_pages,
        stats.free_pages,
        stats.free_pages as u64 * PAGE_SIZE as u64 / (1024 * 1024)
    );
}

pub fn alloc_frame() -> Result<PhysAddr, MemError> {
    FRAME_ALLOCATOR.lock().as_mut().ok_or(MemError::OutOfMemory)?.alloc_page()
}

pub fn alloc_frames(count: u32) -> Result<PhysAddr, MemError> {
    FRAME_ALLOCATOR.lock().as_mut().ok_or(MemError::OutOfMemory)?.alloc_pages(count)
}

pub fn free_frame(phys: PhysAddr) {
    if let Some(alloc) = FRAME_ALLOCATOR.lock().as_mut() {
        alloc.free_page(phys);
    }
}

pub fn free_frames(phys: PhysAddr, count: u32) {
    if let Some(alloc) = FRAME_ALLOCATOR.lock().as_mut() {
        alloc.free_pages(phys, count);
    }
}

pub fn exclude_range(start: PhysAddr, size: u32) {
    if let Some(alloc) = FRAME_ALLOCATOR.lock().as_mut() {
        alloc.exclude(start, size);
    }
}

pub fn get_stats() -> FrameStats {
    FRAME_ALLOCATOR.lock().as_ref().map(|a| a.stats()).unwrap_or_default()
}
