//! `#[global_allocator]` backed by the kernel heap.
//!
//! The heap hands out 8-byte-aligned blocks. Larger alignments are served
//! by over-allocating and stashing the real block pointer in the word just
//! below the aligned address, so dealloc can recover it.

use core::alloc::{GlobalAlloc, Layout};

use crate::memory::heap;

struct KernelAllocator;

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

const NATIVE_ALIGN: usize = 8;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= NATIVE_ALIGN {
            return heap::kmalloc(layout.size().max(1)).unwrap_or(core::ptr::null_mut());
        }

        let span = layout.size() + layout.align() + core::mem::size_of::<usize>();
        let Some(raw) = heap::kmalloc(span) else {
            return core::ptr::null_mut();
        };
        let base = raw as usize + core::mem::size_of::<usize>();
        let aligned = (base + layout.align() - 1) & !(layout.align() - 1);
        unsafe {
            ((aligned - core::mem::size_of::<usize>()) as *mut usize).write(raw as usize);
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        if layout.align() <= NATIVE_ALIGN {
            heap::kfree(ptr);
            return;
        }
        let raw = unsafe { ((ptr as usize - core::mem::size_of::<usize>()) as *const usize).read() };
        heap::kfree(raw as *mut u8);
    }
}
