//! Virtual memory manager.
//!
//! Per-process address spaces over the 2-level MMU: each owns a page
//! directory that shares the kernel's upper gigabyte by PDE reference and
//! carries private user regions (code, data, heap, stack) below 3 GiB.

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::memory::layout::{
    page_align_down, page_align_up, PhysAddr, VirtAddr, KERNEL_PD_START, PAGE_SIZE,
    USER_HEAP_BASE, USER_SPACE_END, USER_STACK_TOP,
};
use crate::memory::paging::{self, MmuEnv, PageFlags, PageTable};
use crate::memory::MemError;

bitflags! {
    /// Region classification, kept alongside the page flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionKind: u32 {
        const CODE   = 0x01;
        const DATA   = 0x02;
        const HEAP   = 0x04;
        const STACK  = 0x08;
        const GUARD  = 0x10;
    }
}

/// A mapped user region, page-granular, physically backed.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub virt_start: VirtAddr,
    pub virt_end: VirtAddr,
    pub phys_start: PhysAddr,
    pub flags: PageFlags,
    pub kind: RegionKind,
}

impl Region {
    pub fn pages(&self) -> u32 {
        (self.virt_end - self.virt_start) / PAGE_SIZE
    }

    fn overlaps(&self, other: &Region) -> bool {
        !(self.virt_end <= other.virt_start || self.virt_start >= other.virt_end)
    }
}

/// One user address space.
pub struct AddressSpace {
    pub pd_phys: PhysAddr,
    regions: Vec<Region>,
    pub heap_start: VirtAddr,
    pub heap_current: VirtAddr,
    pub stack_start: VirtAddr,
    pub stack_size: u32,
}

impl AddressSpace {
    /// Allocate a page directory and copy the kernel's upper-gigabyte
    /// entries (768..1024) by reference.
    pub fn create(env: &mut impl MmuEnv, kernel_pd: PhysAddr) -> Result<AddressSpace, MemError> {
        let pd_phys = env.alloc_table_frame().ok_or(MemError::OutOfMemory)?;
        unsafe {
            core::ptr::write_bytes(env.frame_ptr(pd_phys), 0, PAGE_SIZE as usize);
        }

        let kernel_entries: [u32; 256] = {
            let kpd = unsafe { &*(env.frame_ptr(kernel_pd) as *const PageTable) };
            let mut buf = [0u32; 256];
            buf.copy_from_slice(&kpd.0[KERNEL_PD_START..]);
            buf
        };
        let upd = unsafe { &mut *(env.frame_ptr(pd_phys) as *mut PageTable) };
        upd.0[KERNEL_PD_START..].copy_from_slice(&kernel_entries);

        let mut space = AddressSpace {
            pd_phys,
            regions: Vec::new(),
            heap_start: 0,
            heap_current: 0,
            stack_start: 0,
            stack_size: 0,
        };

        // Page zero stays unmapped; record it so nothing else lands there.
        space.regions.push(Region {
            virt_start: 0,
            virt_end: PAGE_SIZE,
            phys_start: 0,
            flags: PageFlags::empty(),
            kind: RegionKind::GUARD,
        });

        Ok(space)
    }

    fn insert_region(&mut self, region: Region) -> Result<(), MemError> {
        if self.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(MemError::MappingConflict);
        }
        let pos = self
            .regions
            .iter()
            .position(|r| r.virt_start > region.virt_start)
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, region);
        Ok(())
    }

    /// Allocate frames and map a user region. The region list and page
    /// tables stay unchanged on failure.
    pub fn map_region(
        &mut self,
        env: &mut impl MmuEnv,
        frames: &mut impl FrameSupply,
        virt_start: VirtAddr,
        size: u32,
        flags: PageFlags,
        kind: RegionKind,
    ) -> Result<(), MemError> {
        if size == 0 {
            return Err(MemError::BadAddress);
        }
        let start = page_align_down(virt_start);
        let end = page_align_up(virt_start.saturating_add(size));
        if end > USER_SPACE_END {
            return Err(MemError::BadAddress);
        }
        let pages = (end - start) / PAGE_SIZE;

        let flags = flags | PageFlags::PRESENT | PageFlags::USER;
        let region = Region { virt_start: start, virt_end: end, phys_start: 0, flags, kind };
        if self.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(MemError::MappingConflict);
        }

        let phys = frames.alloc_contiguous(pages)?;
        if let Err(e) = paging::map_region(env, self.pd_phys, start, phys, end - start, flags) {
            frames.free_contiguous(phys, pages);
            return Err(e);
        }

        let region = Region { phys_start: phys, ..region };
        // Overlap was checked above; insertion cannot fail now.
        self.insert_region(region)?;
        Ok(())
    }

    /// Unmap a region by its start address, returning its frames.
    pub fn unmap_region(
        &mut self,
        env: &mut impl MmuEnv,
        frames: &mut impl FrameSupply,
        virt_start: VirtAddr,
    ) -> Result<(), MemError> {
        let start = page_align_down(virt_start);
        let idx = self
            .regions
            .iter()
            .position(|r| r.virt_start <= start && start < r.virt_end && r.kind != RegionKind::GUARD)
            .ok_or(MemError::BadAddress)?;
        let region = self.regions.remove(idx);
        paging::unmap_region(env, self.pd_phys, region.virt_start, region.virt_end - region.virt_start);
        frames.free_contiguous(region.phys_start, region.pages());
        Ok(())
    }

    /// Reserve the fixed-size stack at the top of user space.
    pub fn allocate_stack(
        &mut self,
        env: &mut impl MmuEnv,
        frames: &mut impl FrameSupply,
        size: u32,
    ) -> Result<(), MemError> {
        let aligned = page_align_up(size);
        let bottom = USER_STACK_TOP - aligned + 1;
        self.map_region(
            env,
            frames,
            bottom,
            aligned,
            PageFlags::RW,
            RegionKind::STACK,
        )?;
        self.stack_start = bottom;
        self.stack_size = aligned;
        Ok(())
    }

    /// Set up the initial user heap at its fixed base.
    pub fn allocate_heap(
        &mut self,
        env: &mut impl MmuEnv,
        frames: &mut impl FrameSupply,
        initial: u32,
    ) -> Result<(), MemError> {
        let aligned = page_align_up(initial);
        self.map_region(env, frames, USER_HEAP_BASE, aligned, PageFlags::RW, RegionKind::HEAP)?;
        self.heap_start = USER_HEAP_BASE;
        self.heap_current = USER_HEAP_BASE + aligned;
        Ok(())
    }

    /// brk-style heap break move. `None` queries the current break.
    pub fn brk(
        &mut self,
        env: &mut impl MmuEnv,
        frames: &mut impl FrameSupply,
        addr: Option<VirtAddr>,
    ) -> Result<VirtAddr, MemError> {
        let Some(addr) = addr else {
            return Ok(self.heap_current);
        };
        let new_brk = page_align_up(addr);
        if new_brk < self.heap_start {
            return Err(MemError::BadAddress);
        }
        let old_brk = self.heap_current;
        if new_brk > old_brk {
            self.map_region(env, frames, old_brk, new_brk - old_brk, PageFlags::RW, RegionKind::HEAP)?;
            self.heap_current = new_brk;
        } else if new_brk < old_brk {
            // Shrink: release whole heap regions that lie past the new break.
            let doomed: Vec<VirtAddr> = self
                .regions
                .iter()
                .filter(|r| r.kind == RegionKind::HEAP && r.virt_start >= new_brk)
                .map(|r| r.virt_start)
                .collect();
            for start in doomed {
                self.unmap_region(env, frames, start)?;
            }
            self.heap_current = new_brk;
        }
        Ok(self.heap_current)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Tear down every user mapping and the page directory itself.
    /// The caller must have switched CR3 away from this space already.
    pub fn destroy(mut self, env: &mut impl MmuEnv, frames: &mut impl FrameSupply) {
        let owned: Vec<Region> = self
            .regions
            .drain(..)
            .filter(|r| r.kind != RegionKind::GUARD)
            .collect();
        for region in owned {
            paging::unmap_region(
                env,
                self.pd_phys,
                region.virt_start,
                region.virt_end - region.virt_start,
            );
            frames.free_contiguous(region.phys_start, region.pages());
        }

        // Free user-half page tables (kernel-half tables are shared).
        let user_pts: Vec<PhysAddr> = {
            let pd = unsafe { &*(env.frame_ptr(self.pd_phys) as *const PageTable) };
            pd.0[..KERNEL_PD_START]
                .iter()
                .filter(|&&e| {
                    e & PageFlags::PRESENT.bits() != 0 && e & PageFlags::PAGE_4MB.bits() == 0
                })
                .map(|&e| e & 0xFFFF_F000)
                .collect()
        };
        for pt in user_pts {
            env.free_table_frame(pt);
        }
        env.free_table_frame(self.pd_phys);
    }
}

/// User-region frame supply. The kernel wires this to the PMM; tests use a
/// counter-backed fake.
pub trait FrameSupply {
    fn alloc_contiguous(&mut self, pages: u32) -> Result<PhysAddr, MemError>;
    fn free_contiguous(&mut self, phys: PhysAddr, pages: u32);
}

/// Frame supply backed by the global frame allocator.
pub struct PmmSupply;

impl FrameSupply for PmmSupply {
    fn alloc_contiguous(&mut self, pages: u32) -> Result<PhysAddr, MemError> {
        crate::memory::frame_alloc::alloc_frames(pages)
    }

    fn free_contiguous(&mut self, phys: PhysAddr, pages: u32) {
        crate::memory::frame_alloc::free_frames(phys, pages);
    }
}
