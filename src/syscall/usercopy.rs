//! User-pointer validation and the only kernel paths that touch user
//! memory.
//!
//! A range is acceptable when it lies strictly below the kernel half,
//! does not wrap, and every touched page is present and user-accessible
//! (and writable for writes). Validation runs over a page-lookup trait,
//! so the rules are host-tested against fake page tables.

use crate::memory::layout::{page_align_down, VirtAddr, PAGE_SIZE, USER_SPACE_END};
use crate::memory::paging::PageFlags;
use crate::syscall::Errno;

/// Page-table view of the calling task's address space.
pub trait UserPages {
    fn flags_of(&mut self, virt: VirtAddr) -> Option<PageFlags>;
}

/// Check a user range for reading (`write = false`) or writing.
pub fn validate_range(
    pages: &mut impl UserPages,
    base: VirtAddr,
    len: u32,
    write: bool,
) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    let last = base.checked_add(len - 1).ok_or(Errno::EFAULT)?;
    if last >= USER_SPACE_END {
        return Err(Errno::EFAULT);
    }

    let mut page = page_align_down(base);
    loop {
        let flags = pages.flags_of(page).ok_or(Errno::EFAULT)?;
        if !flags.contains(PageFlags::PRESENT | PageFlags::USER) {
            return Err(Errno::EFAULT);
        }
        if write && !flags.contains(PageFlags::RW) {
            return Err(Errno::EFAULT);
        }
        if page_align_down(last) == page {
            return Ok(());
        }
        page += PAGE_SIZE;
    }
}

/// Copy `dst.len()` bytes out of user memory. The current CR3 must map
/// the calling task's address space.
#[cfg(target_arch = "x86")]
pub fn copy_from_user(
    pages: &mut impl UserPages,
    src: VirtAddr,
    dst: &mut [u8],
) -> Result<(), Errno> {
    validate_range(pages, src, dst.len() as u32, false)?;
    unsafe {
        core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
    }
    Ok(())
}

/// Copy bytes into user memory.
#[cfg(target_arch = "x86")]
pub fn copy_to_user(pages: &mut impl UserPages, dst: VirtAddr, src: &[u8]) -> Result<(), Errno> {
    validate_range(pages, dst, src.len() as u32, true)?;
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
    }
    Ok(())
}

/// Copy a NUL-terminated user string, at most `max` bytes of content.
/// Validates page by page so a string may end right at a mapping edge.
#[cfg(target_arch = "x86")]
pub fn copy_string_from_user(
    pages: &mut impl UserPages,
    src: VirtAddr,
    buf: &mut [u8],
) -> Result<usize, Errno> {
    let max = buf.len();
    let mut n = 0usize;
    while n < max {
        let addr = src.checked_add(n as u32).ok_or(Errno::EFAULT)?;
        validate_range(pages, addr, 1, false)?;
        let byte = unsafe { (addr as *const u8).read() };
        if byte == 0 {
            return Ok(n);
        }
        buf[n] = byte;
        n += 1;
    }
    // No terminator within bounds.
    Err(Errno::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FakePages(BTreeMap<VirtAddr, PageFlags>);

    impl UserPages for FakePages {
        fn flags_of(&mut self, virt: VirtAddr) -> Option<PageFlags> {
            self.0.get(&page_align_down(virt)).copied()
        }
    }

    fn user_rw(pagev: &[VirtAddr]) -> FakePages {
        let mut m = BTreeMap::new();
        for &p in pagev {
            m.insert(p, PageFlags::PRESENT | PageFlags::USER | PageFlags::RW);
        }
        FakePages(m)
    }

    #[test]
    fn in_bounds_user_range_passes() {
        let mut pages = user_rw(&[0x0800_0000, 0x0800_1000]);
        assert!(validate_range(&mut pages, 0x0800_0F00, 0x200, true).is_ok());
    }

    #[test]
    fn kernel_half_is_rejected_even_if_mapped() {
        let mut pages = user_rw(&[0xC000_0000]);
        assert_eq!(validate_range(&mut pages, 0xC000_0000, 4, false), Err(Errno::EFAULT));
        // Straddling the boundary fails too.
        let mut pages = user_rw(&[0xBFFF_F000, 0xC000_0000]);
        assert_eq!(validate_range(&mut pages, 0xBFFF_FFF0, 0x20, false), Err(Errno::EFAULT));
    }

    #[test]
    fn wrapping_range_is_rejected() {
        let mut pages = user_rw(&[0xBFFF_F000]);
        assert_eq!(
            validate_range(&mut pages, 0xBFFF_F000, u32::MAX, false),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn unmapped_hole_is_rejected() {
        let mut pages = user_rw(&[0x0800_0000, 0x0800_2000]);
        assert_eq!(validate_range(&mut pages, 0x0800_0000, 0x3000, false), Err(Errno::EFAULT));
    }

    #[test]
    fn write_needs_writable_pages() {
        let mut m = BTreeMap::new();
        m.insert(0x0800_0000u32, PageFlags::PRESENT | PageFlags::USER);
        let mut pages = FakePages(m);
        assert!(validate_range(&mut pages, 0x0800_0000, 16, false).is_ok());
        assert_eq!(validate_range(&mut pages, 0x0800_0000, 16, true), Err(Errno::EFAULT));
    }

    #[test]
    fn kernel_only_pages_are_invisible_to_users() {
        let mut m = BTreeMap::new();
        m.insert(0x0800_0000u32, PageFlags::PRESENT | PageFlags::RW);
        let mut pages = FakePages(m);
        assert_eq!(validate_range(&mut pages, 0x0800_0000, 4, false), Err(Errno::EFAULT));
    }

    #[test]
    fn zero_length_is_trivially_fine() {
        let mut pages = user_rw(&[]);
        assert!(validate_range(&mut pages, 0x0800_0000, 0, true).is_ok());
    }
}
