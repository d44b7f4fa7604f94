//! Vesper memory layout (x86, 2-level paging, higher-half kernel).
//! Single source of truth for all address windows and region bounds.

/// Physical address on this machine (32-bit).
pub type PhysAddr = u32;
/// Virtual address.
pub type VirtAddr = u32;

pub const PAGE_SIZE: u32 = 4096;
pub const LARGE_PAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Kernel image is mapped at identity and here (higher half).
pub const KERNEL_VIRTUAL_BASE: VirtAddr = 0xC000_0000;

/// First PD index owned by the kernel (3 GiB boundary).
pub const KERNEL_PD_START: usize = 768;

/// Linear framebuffer remap window.
pub const FRAMEBUFFER_BASE: VirtAddr = 0xE000_0000;

/// MMIO windows (NIC registers, LAPIC, ...) are handed out from here.
pub const MMIO_WINDOW_BASE: VirtAddr = 0xF000_0000;

/// Static kernel heap region size: 16 MiB.
pub const KERNEL_HEAP_SIZE: u32 = 0x0100_0000;

/// User space: strictly below the kernel half.
pub const USER_SPACE_END: VirtAddr = KERNEL_VIRTUAL_BASE;
pub const USER_CODE_BASE: VirtAddr = 0x0800_0000;
pub const USER_HEAP_BASE: VirtAddr = 0x1000_0000;
pub const USER_STACK_TOP: VirtAddr = 0xBFFF_FFFF;

#[inline]
pub const fn align_down(addr: u32, align: u32) -> u32 {
    addr & !(align - 1)
}

#[inline]
pub const fn align_up(addr: u32, align: u32) -> u32 {
    (addr + align - 1) & !(align - 1)
}

#[inline]
pub const fn page_align_down(addr: u32) -> u32 {
    align_down(addr, PAGE_SIZE)
}

#[inline]
pub const fn page_align_up(addr: u32) -> u32 {
    align_up(addr, PAGE_SIZE)
}

/// Page-directory index for a virtual address (top 10 bits).
#[inline]
pub const fn pd_index(virt: VirtAddr) -> usize {
    (virt >> 22) as usize
}

/// Page-table index for a virtual address (middle 10 bits).
#[inline]
pub const fn pt_index(virt: VirtAddr) -> usize {
    ((virt >> 12) & 0x3FF) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(page_align_down(0x1234), 0x1000);
        assert_eq!(page_align_up(0x1234), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
        assert_eq!(align_up(7, 8), 8);
        assert_eq!(align_down(7, 8), 0);
    }

    #[test]
    fn table_indices() {
        assert_eq!(pd_index(0), 0);
        assert_eq!(pd_index(KERNEL_VIRTUAL_BASE), KERNEL_PD_START);
        assert_eq!(pd_index(0x0040_0000), 1);
        assert_eq!(pt_index(0x0000_1000), 1);
        assert_eq!(pt_index(0x003F_F000), 1023);
    }
}
