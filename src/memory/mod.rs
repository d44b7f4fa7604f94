// Vesper Operating System
// Copyright (C) 2026 Vesper Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Memory subsystem: physical frames, paging, kernel heap, user address
//! spaces. Initialization order matters and is fixed in [`init`].

pub mod frame_alloc;
pub mod heap;
pub mod layout;
pub mod paging;
pub mod virt;

// Host test binaries link the system allocator; the kernel heap only
// backs `alloc` on the real target.
#[cfg(all(not(test), target_arch = "x86"))]
mod global_alloc;

/// Memory subsystem error. Every fallible memory operation returns one of
/// these; callers decide whether it is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No physical frames or heap bytes left for the request.
    OutOfMemory,
    /// The target virtual range is already mapped to something else.
    MappingConflict,
    /// Allocator metadata failed a consistency check.
    Corruption,
    /// Address outside the legal range for the operation.
    BadAddress,
}

impl MemError {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemError::OutOfMemory => "out of memory",
            MemError::MappingConflict => "mapping conflict",
            MemError::Corruption => "allocator corruption",
            MemError::BadAddress => "bad address",
        }
    }
}

#[cfg(target_arch = "x86")]
mod init_x86 {
    use super::*;
    use crate::boot::BootInfo;
    use crate::memory::layout::{
        page_align_up, PhysAddr, FRAMEBUFFER_BASE, KERNEL_HEAP_SIZE, KERNEL_VIRTUAL_BASE,
        LARGE_PAGE_SIZE, PAGE_SIZE,
    };
    use crate::memory::paging::{KernelEnv, KernelMmu, PageFlags};

    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }

    /// Bring up the whole memory subsystem from the boot memory map.
    ///
    /// Order: frame allocator (bitmap carved out of the largest usable
    /// region), kernel page directory (identity low RAM plus the higher
    /// half), then the kernel heap on frames reserved here.
    pub unsafe fn init(boot: &BootInfo) -> Result<(), MemError> {
        let kernel_start = unsafe { &__kernel_start as *const u8 as u32 };
        let kernel_end = unsafe { &__kernel_end as *const u8 as u32 };

        // --- Physical frame allocator ---
        let ranges = frame_alloc::collect_ranges(&boot.mmap);
        let total_pages: u32 = ranges.iter().map(|r| r.pages).sum();
        let bitmap_bytes = frame_alloc::bitmap_bytes(total_pages);
        let bitmap_phys =
            frame_alloc::place_bitmap(&ranges, bitmap_bytes).ok_or(MemError::OutOfMemory)?;
        let bitmap: &'static mut [u32] =
            unsafe { core::slice::from_raw_parts_mut(bitmap_phys as *mut u32, bitmap_bytes / 4) };
        let mut pmm = frame_alloc::FrameAllocator::new(ranges, bitmap)?;
        pmm.exclude(kernel_start, kernel_end - kernel_start);
        pmm.exclude(bitmap_phys, bitmap_bytes as u32);
        frame_alloc::init_global(pmm);

        let stats = frame_alloc::get_stats();
        log_info!(
            "pmm: {} KiB usable, {} KiB free",
            stats.total_pages * 4,
            stats.free_pages * 4
        );

        // --- Kernel page directory ---
        let mut env = KernelEnv;
        let pd_phys = frame_alloc::alloc_frame()?;
        unsafe {
            core::ptr::write_bytes(pd_phys as *mut u8, 0, PAGE_SIZE as usize);
        }

        // Identity map low RAM with 4 MiB pages so physical frames stay
        // reachable, then alias the same RAM into the higher half.
        let identity_span = identity_span(boot);
        let mut phys: PhysAddr = 0;
        while phys < identity_span {
            paging::map_large_page(&mut env, pd_phys, phys, phys, PageFlags::RW)?;
            paging::map_large_page(
                &mut env,
                pd_phys,
                KERNEL_VIRTUAL_BASE + phys,
                phys,
                PageFlags::RW,
            )?;
            phys += LARGE_PAGE_SIZE;
        }

        if let Some(fb) = &boot.framebuffer {
            let fb_size = fb.pitch * fb.height;
            let mut off = 0;
            while off < page_align_up(fb_size) {
                paging::map_page(
                    &mut env,
                    pd_phys,
                    FRAMEBUFFER_BASE + off,
                    (fb.addr as u32) + off,
                    PageFlags::RW | PageFlags::CACHE_DISABLE,
                )?;
                off += PAGE_SIZE;
            }
            log_info!("fb: {}x{} @ {:#010x}", fb.width, fb.height, fb.addr);
        }

        paging::init_kernel_mmu(KernelMmu::new(pd_phys));
        unsafe {
            crate::arch::x86::enable_paging(pd_phys);
        }

        // --- Kernel heap ---
        let heap_pages = KERNEL_HEAP_SIZE / PAGE_SIZE;
        let heap_phys = frame_alloc::alloc_frames(heap_pages)?;
        unsafe {
            heap::init(heap_phys as *mut u8, KERNEL_HEAP_SIZE as usize)?;
        }
        log_info!("heap: {} MiB at {:#010x}", KERNEL_HEAP_SIZE >> 20, heap_phys);

        Ok(())
    }

    /// Identity-map enough low RAM to cover the highest usable frame,
    /// rounded up to a 4 MiB boundary and capped below the kernel half.
    fn identity_span(boot: &BootInfo) -> u32 {
        let mut top: u64 = 16 * 1024 * 1024;
        for entry in boot.mmap.iter().filter(|e| e.is_available()) {
            let end = entry.base + entry.length;
            if end > top && entry.base < u64::from(KERNEL_VIRTUAL_BASE) {
                top = end.min(u64::from(KERNEL_VIRTUAL_BASE));
            }
        }
        let top = top as u32;
        (top + LARGE_PAGE_SIZE - 1) & !(LARGE_PAGE_SIZE - 1)
    }
}

#[cfg(target_arch = "x86")]
pub use init_x86::init;
