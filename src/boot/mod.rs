//! Boot information intake.
//!
//! The boot shim hands the kernel a multiboot2 tagged blob; this module
//! parses out the pieces the core needs (memory map, framebuffer,
//! command line, boot modules).

pub mod multiboot;

pub use multiboot::{
    parse_bytes, BootInfo, FramebufferInfo, MemMapEntry, Module, MULTIBOOT2_MAGIC,
};

/// Parse the boot blob the shim passed in registers.
///
/// # Safety
/// `mbi` must point to a valid multiboot2 information block whose first
/// word holds its total size.
#[cfg(target_arch = "x86")]
pub unsafe fn parse(magic: u32, mbi: *const u8) -> Result<BootInfo, &'static str> {
    if magic != MULTIBOOT2_MAGIC {
        return Err("bad multiboot2 magic");
    }
    if mbi.is_null() || (mbi as usize) & 0x7 != 0 {
        return Err("unaligned boot info pointer");
    }
    let total_size = unsafe { (mbi as *const u32).read() } as usize;
    if total_size < 8 {
        return Err("boot info too small");
    }
    let blob = unsafe { core::slice::from_raw_parts(mbi, total_size) };
    parse_bytes(blob)
}
