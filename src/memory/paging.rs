//! Paging MMU.
//!
//! Two-level 32-bit paging: a 1024-entry page directory whose entries are
//! empty, map a 4 MiB large page, or point at a 1024-entry page table.
//! The kernel image is mapped at identity and higher half; individual
//! mappings go through `map_page`/`unmap_page` with explicit TLB
//! invalidation.
//!
//! Table walks run against an [`MmuEnv`] that supplies frames and turns a
//! physical frame address into a kernel-visible pointer. On hardware that
//! is the frame allocator plus the identity window; tests provide a fake
//! RAM environment, so every path here is host-checkable.

use bitflags::bitflags;
use spin::Mutex;

use crate::memory::layout::{
    page_align_down, pd_index, pt_index, PhysAddr, VirtAddr, LARGE_PAGE_SIZE, MMIO_WINDOW_BASE,
    PAGE_SIZE,
};
use crate::memory::MemError;

bitflags! {
    /// Page directory / table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 0x001;
        const RW            = 0x002;
        const USER          = 0x004;
        const WRITETHROUGH  = 0x008;
        const CACHE_DISABLE = 0x010;
        const ACCESSED      = 0x020;
        const DIRTY         = 0x040;
        const PAGE_4MB      = 0x080;
    }
}

const ENTRY_COUNT: usize = 1024;
const ADDR_MASK: u32 = 0xFFFF_F000;
const LARGE_ADDR_MASK: u32 = 0xFFC0_0000;

/// One page directory or page table: 1024 32-bit entries.
#[repr(C, align(4096))]
pub struct PageTable(pub [u32; ENTRY_COUNT]);

impl PageTable {
    pub const fn zeroed() -> PageTable {
        PageTable([0; ENTRY_COUNT])
    }
}

/// Frame supply and physical-memory visibility for table walks.
pub trait MmuEnv {
    /// A zeroed 4 KiB frame for a new page table.
    fn alloc_table_frame(&mut self) -> Option<PhysAddr>;
    fn free_table_frame(&mut self, phys: PhysAddr);
    /// Kernel-visible pointer to a physical frame.
    fn frame_ptr(&mut self, phys: PhysAddr) -> *mut u8;
    /// Invalidate one TLB entry. No-op off hardware.
    fn invlpg(&mut self, _virt: VirtAddr) {}
}

fn table<'a>(env: &mut impl MmuEnv, phys: PhysAddr) -> &'a mut PageTable {
    unsafe { &mut *(env.frame_ptr(phys) as *mut PageTable) }
}

/// Map one 4 KiB page. Remapping the same physical target updates flags;
/// a different target is a conflict. Allocates and zero-fills a page table
/// on demand.
pub fn map_page(
    env: &mut impl MmuEnv,
    pd_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageFlags,
) -> Result<(), MemError> {
    let virt = page_align_down(virt);
    let phys = page_align_down(phys);
    let pdi = pd_index(virt);

    let pd = table(env, pd_phys);
    let pde = pd.0[pdi];

    if pde & PageFlags::PAGE_4MB.bits() != 0 {
        return Err(MemError::MappingConflict);
    }

    let pt_phys = if pde & PageFlags::PRESENT.bits() != 0 {
        pde & ADDR_MASK
    } else {
        let new_pt = env.alloc_table_frame().ok_or(MemError::OutOfMemory)?;
        unsafe {
            core::ptr::write_bytes(env.frame_ptr(new_pt), 0, PAGE_SIZE as usize);
        }
        // PDE stays permissive; the PTE is what restricts access.
        let mut pde_flags = PageFlags::PRESENT | PageFlags::RW;
        if flags.contains(PageFlags::USER) {
            pde_flags |= PageFlags::USER;
        }
        table(env, pd_phys).0[pdi] = new_pt | pde_flags.bits();
        new_pt
    };

    // A user mapping under a PDE created kernel-only must widen the PDE.
    if flags.contains(PageFlags::USER) {
        let pd = table(env, pd_phys);
        pd.0[pdi] |= PageFlags::USER.bits();
    }

    let pt = table(env, pt_phys);
    let pte = pt.0[pt_index(virt)];
    if pte & PageFlags::PRESENT.bits() != 0 {
        if pte & ADDR_MASK != phys {
            return Err(MemError::MappingConflict);
        }
        // Same target: refresh flags only.
    }
    pt.0[pt_index(virt)] = phys | (flags | PageFlags::PRESENT).bits();
    env.invlpg(virt);
    Ok(())
}

/// Map one 4 MiB page directly in the directory.
pub fn map_large_page(
    env: &mut impl MmuEnv,
    pd_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageFlags,
) -> Result<(), MemError> {
    let virt = virt & LARGE_ADDR_MASK;
    let phys = phys & LARGE_ADDR_MASK;
    let pd = table(env, pd_phys);
    let pde = pd.0[pd_index(virt)];
    if pde & PageFlags::PRESENT.bits() != 0 {
        let same = pde & PageFlags::PAGE_4MB.bits() != 0 && pde & LARGE_ADDR_MASK == phys;
        if !same {
            return Err(MemError::MappingConflict);
        }
    }
    pd.0[pd_index(virt)] = phys | (flags | PageFlags::PRESENT | PageFlags::PAGE_4MB).bits();
    // A PDE flip covers the whole 4 MiB range.
    let mut v = virt;
    loop {
        env.invlpg(v);
        v = v.wrapping_add(PAGE_SIZE);
        if v == virt.wrapping_add(LARGE_PAGE_SIZE) || v < virt {
            break;
        }
    }
    Ok(())
}

/// Unmap one 4 KiB page. Fails inside a 4 MiB mapping and on pages that
/// were never mapped.
pub fn unmap_page(env: &mut impl MmuEnv, pd_phys: PhysAddr, virt: VirtAddr) -> Result<(), MemError> {
    let virt = page_align_down(virt);
    let pd = table(env, pd_phys);
    let pde = pd.0[pd_index(virt)];
    if pde & PageFlags::PRESENT.bits() == 0 {
        return Err(MemError::BadAddress);
    }
    if pde & PageFlags::PAGE_4MB.bits() != 0 {
        return Err(MemError::MappingConflict);
    }
    let pt = table(env, pde & ADDR_MASK);
    let pte = &mut pt.0[pt_index(virt)];
    if *pte & PageFlags::PRESENT.bits() == 0 {
        return Err(MemError::BadAddress);
    }
    *pte = 0;
    env.invlpg(virt);
    Ok(())
}

/// Resolve a virtual address, honoring 4 MiB pages.
pub fn virt_to_phys(env: &mut impl MmuEnv, pd_phys: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let pd = table(env, pd_phys);
    let pde = pd.0[pd_index(virt)];
    if pde & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    if pde & PageFlags::PAGE_4MB.bits() != 0 {
        return Some((pde & LARGE_ADDR_MASK) | (virt & !LARGE_ADDR_MASK));
    }
    let pt = table(env, pde & ADDR_MASK);
    let pte = pt.0[pt_index(virt)];
    if pte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some((pte & ADDR_MASK) | (virt & 0xFFF))
}

pub fn is_mapped(env: &mut impl MmuEnv, pd_phys: PhysAddr, virt: VirtAddr) -> bool {
    virt_to_phys(env, pd_phys, virt).is_some()
}

/// Flags of the entry covering `virt`, if present. Syscall pointer
/// validation keys off this.
pub fn entry_flags(env: &mut impl MmuEnv, pd_phys: PhysAddr, virt: VirtAddr) -> Option<PageFlags> {
    let pd = table(env, pd_phys);
    let pde = pd.0[pd_index(virt)];
    if pde & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    if pde & PageFlags::PAGE_4MB.bits() != 0 {
        return Some(PageFlags::from_bits_truncate(pde & 0xFFF));
    }
    let pt = table(env, pde & ADDR_MASK);
    let pte = pt.0[pt_index(virt)];
    if pte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some(PageFlags::from_bits_truncate(pte & 0xFFF))
}

/// Update flags of an existing mapping.
pub fn set_flags(
    env: &mut impl MmuEnv,
    pd_phys: PhysAddr,
    virt: VirtAddr,
    flags: PageFlags,
) -> Result<(), MemError> {
    let virt = page_align_down(virt);
    let phys = virt_to_phys(env, pd_phys, virt).ok_or(MemError::BadAddress)?;
    map_page(env, pd_phys, virt, page_align_down(phys), flags)
}

/// Map a contiguous region. On partial failure every page inserted by this
/// call is unwound, leaving the address space unchanged.
pub fn map_region(
    env: &mut impl MmuEnv,
    pd_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    size: u32,
    flags: PageFlags,
) -> Result<(), MemError> {
    let start = page_align_down(virt);
    let end = crate::memory::layout::page_align_up(virt.saturating_add(size));
    let phys_start = page_align_down(phys);

    let mut mapped = 0u32;
    let pages = (end - start) / PAGE_SIZE;
    while mapped < pages {
        let v = start + mapped * PAGE_SIZE;
        let p = phys_start + mapped * PAGE_SIZE;
        if let Err(e) = map_page(env, pd_phys, v, p, flags) {
            for i in 0..mapped {
                let _ = unmap_page(env, pd_phys, start + i * PAGE_SIZE);
            }
            return Err(e);
        }
        mapped += 1;
    }
    Ok(())
}

pub fn unmap_region(env: &mut impl MmuEnv, pd_phys: PhysAddr, virt: VirtAddr, size: u32) {
    let start = page_align_down(virt);
    let end = crate::memory::layout::page_align_up(virt.saturating_add(size));
    let mut v = start;
    while v < end {
        let _ = unmap_page(env, pd_phys, v);
        v += PAGE_SIZE;
    }
}

// ===== Kernel environment and singleton =====

/// MMU environment on real hardware: frames from the PMM, physical memory
/// reached through the identity window, real INVLPG.
#[cfg(target_arch = "x86")]
pub struct KernelEnv;

#[cfg(target_arch = "x86")]
impl MmuEnv for KernelEnv {
    fn alloc_table_frame(&mut self) -> Option<PhysAddr> {
        crate::memory::frame_alloc::alloc_frame().ok()
    }

    fn free_table_frame(&mut self, phys: PhysAddr) {
        crate::memory::frame_alloc::free_frame(phys);
    }

    fn frame_ptr(&mut self, phys: PhysAddr) -> *mut u8 {
        // Low RAM stays identity mapped; tables are always allocated there.
        phys as *mut u8
    }

    fn invlpg(&mut self, virt: VirtAddr) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
        }
    }
}

/// Kernel address-space state: its page directory plus the bump cursor for
/// MMIO windows.
pub struct KernelMmu {
    pub pd_phys: PhysAddr,
    next_mmio: VirtAddr,
}

impl KernelMmu {
    pub fn new(pd_phys: PhysAddr) -> KernelMmu {
        KernelMmu { pd_phys, next_mmio: MMIO_WINDOW_BASE }
    }

    /// Map an arbitrary physical range (device registers, ACPI tables)
    /// into a fresh kernel window, uncached. Returns the virtual address
    /// corresponding to `phys`.
    pub fn ensure_physical_accessible(
        &mut self,
        env: &mut impl MmuEnv,
        phys: PhysAddr,
        size: u32,
    ) -> Result<VirtAddr, MemError> {
        let phys_base = page_align_down(phys);
        let offset = phys - phys_base;
        let span = crate::memory::layout::page_align_up(size + offset);

        let virt = self.next_mmio;
        map_region(
            env,
            self.pd_phys,
            virt,
            phys_base,
            span,
            PageFlags::PRESENT | PageFlags::RW | PageFlags::CACHE_DISABLE,
        )?;
        self.next_mmio += span;
        Ok(virt + offset)
    }
}

static KERNEL_MMU: Mutex<Option<KernelMmu>> = Mutex::new(None);

pub fn init_kernel_mmu(mmu: KernelMmu) {
    *KERNEL_MMU.lock() = Some(mmu);
}

pub fn kernel_pd() -> Option<PhysAddr> {
    KERNEL_MMU.lock().as_ref().map(|m| m.pd_phys)
}

pub fn with_kernel_mmu<R>(f: impl FnOnce(&mut KernelMmu) -> R) -> Option<R> {
    KERNEL_MMU.lock().as_mut().map(f)
}

#[cfg(test)]
pub mod testenv {
    //! Fake RAM for host-side table walks.

    use super::*;
    use std::collections::BTreeMap;

    #[repr(C, align(4096))]
    pub struct Frame(pub [u8; PAGE_SIZE as usize]);

    /// Frames handed out at ascending fake physical addresses.
    pub struct FakeRam {
        frames: BTreeMap<PhysAddr, Box<Frame>>,
        next_phys: PhysAddr,
        pub invalidations: Vec<VirtAddr>,
    }

    impl FakeRam {
        pub fn new() -> FakeRam {
            FakeRam { frames: BTreeMap::new(), next_phys: 0x0010_0000, invalidations: Vec::new() }
        }

        pub fn frame_count(&self) -> usize {
            self.frames.len()
        }
    }

    impl MmuEnv for FakeRam {
        fn alloc_table_frame(&mut self) -> Option<PhysAddr> {
            let phys = self.next_phys;
            self.next_phys += PAGE_SIZE;
            self.frames.insert(phys, Box::new(Frame([0; PAGE_SIZE as usize])));
            Some(phys)
        }

        fn free_table_frame(&mut self, phys: PhysAddr) {
            self.frames.remove(&phys);
        }

        fn frame_ptr(&mut self, phys: PhysAddr) -> *mut u8 {
            self.frames
                .get_mut(&phys)
                .map(|f| f.0.as_mut_ptr())
                .expect("touch of unallocated fake frame")
        }

        fn invlpg(&mut self, virt: VirtAddr) {
            self.invalidations.push(virt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testenv::FakeRam;
    use super::*;

    fn fresh_pd(ram: &mut FakeRam) -> PhysAddr {
        ram.alloc_table_frame().unwrap()
    }

    #[test]
    fn map_resolve_unmap_round_trip() {
        let mut ram = FakeRam::new();
        let pd = fresh_pd(&mut ram);

        map_page(&mut ram, pd, 0x0040_0000, 0x0080_0000, PageFlags::RW).unwrap();
        assert!(is_mapped(&mut ram, pd, 0x0040_0000));
        assert_eq!(virt_to_phys(&mut ram, pd, 0x0040_0123), Some(0x0080_0123));

        unmap_page(&mut ram, pd, 0x0040_0000).unwrap();
        assert!(!is_mapped(&mut ram, pd, 0x0040_0000));
    }

    #[test]
    fn remap_same_target_updates_flags_only() {
        let mut ram = FakeRam::new();
        let pd = fresh_pd(&mut ram);

        map_page(&mut ram, pd, 0x1000, 0x5000, PageFlags::RW).unwrap();
        map_page(&mut ram, pd, 0x1000, 0x5000, PageFlags::RW | PageFlags::USER).unwrap();
        let flags = entry_flags(&mut ram, pd, 0x1000).unwrap();
        assert!(flags.contains(PageFlags::USER));
        assert_eq!(virt_to_phys(&mut ram, pd, 0x1000), Some(0x5000));
    }

    #[test]
    fn remap_different_target_is_conflict() {
        let mut ram = FakeRam::new();
        let pd = fresh_pd(&mut ram);

        map_page(&mut ram, pd, 0x1000, 0x5000, PageFlags::RW).unwrap();
        assert_eq!(
            map_page(&mut ram, pd, 0x1000, 0x6000, PageFlags::RW),
            Err(MemError::MappingConflict)
        );
        // The original mapping survives.
        assert_eq!(virt_to_phys(&mut ram, pd, 0x1000), Some(0x5000));
    }

    #[test]
    fn large_page_resolves_and_blocks_small_unmap() {
        let mut ram = FakeRam::new();
        let pd = fresh_pd(&mut ram);

        map_large_page(&mut ram, pd, 0x0040_0000, 0x0040_0000, PageFlags::RW).unwrap();
        assert_eq!(virt_to_phys(&mut ram, pd, 0x0040_1234), Some(0x0040_1234));
        assert_eq!(
            unmap_page(&mut ram, pd, 0x0040_1000),
            Err(MemError::MappingConflict)
        );
        assert_eq!(
            map_page(&mut ram, pd, 0x0040_2000, 0x9000, PageFlags::RW),
            Err(MemError::MappingConflict)
        );
    }

    #[test]
    fn map_page_invalidates_tlb_entry() {
        let mut ram = FakeRam::new();
        let pd = fresh_pd(&mut ram);
        map_page(&mut ram, pd, 0x7000, 0x8000, PageFlags::RW).unwrap();
        assert!(ram.invalidations.contains(&0x7000));
    }

    #[test]
    fn failed_region_map_unwinds() {
        let mut ram = FakeRam::new();
        let pd = fresh_pd(&mut ram);

        // Pre-existing conflicting mapping in the middle of the region.
        map_page(&mut ram, pd, 0x3000, 0xdead_0000, PageFlags::RW).unwrap();

        let err = map_region(&mut ram, pd, 0x1000, 0x0010_0000, 4 * PAGE_SIZE, PageFlags::RW);
        assert_eq!(err, Err(MemError::MappingConflict));

        // Pages the failed call inserted are gone; the old one remains.
        assert!(!is_mapped(&mut ram, pd, 0x1000));
        assert!(!is_mapped(&mut ram, pd, 0x2000));
        assert_eq!(virt_to_phys(&mut ram, pd, 0x3000), Some(0xdead_0000));
    }

    #[test]
    fn unmapping_never_mapped_page_fails() {
        let mut ram = FakeRam::new();
        let pd = fresh_pd(&mut ram);
        assert_eq!(unmap_page(&mut ram, pd, 0x4000), Err(MemError::BadAddress));
    }

    #[test]
    fn mmio_windows_bump_and_offset() {
        let mut ram = FakeRam::new();
        let pd = fresh_pd(&mut ram);
        let mut mmu = KernelMmu::new(pd);

        let v1 = mmu.ensure_physical_accessible(&mut ram, 0xFEBC_0010, 0x80).unwrap();
        assert_eq!(v1, MMIO_WINDOW_BASE + 0x10);
        let flags = entry_flags(&mut ram, pd, v1).unwrap();
        assert!(flags.contains(PageFlags::CACHE_DISABLE));

        let v2 = mmu.ensure_physical_accessible(&mut ram, 0xFEE0_0000, 0x1000).unwrap();
        assert!(v2 > v1);
    }
}
