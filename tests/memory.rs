//! Physical frame allocator and kernel heap, end to end.

use vesper_kernel::boot::multiboot::MemMapEntry;
use vesper_kernel::memory::frame_alloc::{collect_ranges, FrameAllocator};
use vesper_kernel::memory::heap::Heap;
use vesper_kernel::memory::layout::PAGE_SIZE;
use vesper_kernel::memory::MemError;

fn available(base: u64, length: u64) -> MemMapEntry {
    MemMapEntry { base, length, kind: 1 }
}

fn reserved(base: u64, length: u64) -> MemMapEntry {
    MemMapEntry { base, length, kind: 2 }
}

fn allocator_with_pages(bitmap: &mut Vec<u32>, pages: u32) -> FrameAllocator<'_> {
    let mmap = [available(0x0010_0000, u64::from(pages) * u64::from(PAGE_SIZE))];
    let ranges = collect_ranges(&mmap);
    bitmap.resize(((pages as usize) + 31) / 32, 0);
    FrameAllocator::new(ranges, bitmap.as_mut_slice()).expect("allocator builds")
}

#[test]
fn frame_round_trip_restores_free_count() {
    let mut bitmap = Vec::new();
    let mut pmm = allocator_with_pages(&mut bitmap, 128);
    let initial = pmm.stats().free_pages;

    let a = pmm.alloc_page().expect("single");
    let b = pmm.alloc_pages(8).expect("contiguous run");
    let c = pmm.alloc_page().expect("single");
    assert_eq!(pmm.stats().free_pages, initial - 10);

    pmm.free_page(a);
    pmm.free_pages(b, 8);
    pmm.free_page(c);
    assert_eq!(pmm.stats().free_pages, initial);
}

#[test]
fn no_frame_is_handed_out_twice() {
    let mut bitmap = Vec::new();
    let mut pmm = allocator_with_pages(&mut bitmap, 64);
    let mut seen = std::collections::HashSet::new();
    while let Ok(frame) = pmm.alloc_page() {
        assert!(seen.insert(frame), "frame {frame:#x} returned twice");
    }
    assert_eq!(seen.len(), 64);
}

#[test]
fn reserved_regions_never_produce_frames() {
    let mmap = [
        available(0x0010_0000, 16 * u64::from(PAGE_SIZE)),
        reserved(0x0020_0000, 16 * u64::from(PAGE_SIZE)),
    ];
    let ranges = collect_ranges(&mmap);
    let mut bitmap = vec![0u32; 4];
    let mut pmm = FrameAllocator::new(ranges, bitmap.as_mut_slice()).expect("builds");
    while let Ok(frame) = pmm.alloc_page() {
        assert!(
            frame < 0x0020_0000,
            "frame {frame:#x} came from a reserved region"
        );
    }
}

#[test]
fn exclude_removes_kernel_image_frames() {
    let mut bitmap = Vec::new();
    let mut pmm = allocator_with_pages(&mut bitmap, 64);
    let before = pmm.stats().free_pages;
    pmm.exclude(0x0010_0000, 4 * PAGE_SIZE);
    assert_eq!(pmm.stats().free_pages, before - 4);
    while let Ok(frame) = pmm.alloc_page() {
        assert!(frame >= 0x0010_0000 + 4 * PAGE_SIZE);
    }
}

fn fresh_heap(storage: &mut Vec<u8>) -> Heap {
    // Over-allocate so the base can be 8-aligned.
    storage.resize(64 * 1024 + 8, 0);
    let base = unsafe {
        let raw = storage.as_mut_ptr();
        raw.add(raw.align_offset(8))
    };
    unsafe { Heap::new(base, 64 * 1024).expect("heap builds") }
}

#[test]
fn heap_alloc_free_conserves_bytes() {
    let mut storage = Vec::new();
    let mut heap = fresh_heap(&mut storage);
    let total = heap.stats().total;

    let p1 = heap.alloc(100).expect("alloc");
    let p2 = heap.alloc(2048).expect("alloc");
    let p3 = heap.alloc(64).expect("alloc");
    assert_eq!(heap.stats().total, total);

    heap.free(p2).expect("free");
    heap.free(p1).expect("free");
    heap.free(p3).expect("free");
    heap.defragment();

    let stats = heap.stats();
    assert_eq!(stats.total, total);
    assert_eq!(stats.used, 0);
    assert_eq!(stats.largest_free, stats.free);
}

#[test]
fn double_free_reports_corruption_and_changes_nothing() {
    let mut storage = Vec::new();
    let mut heap = fresh_heap(&mut storage);

    let p = heap.alloc(64).expect("alloc");
    heap.free(p).expect("first free");
    let snapshot = heap.stats();

    assert_eq!(heap.free(p), Err(MemError::Corruption));
    assert_eq!(heap.stats(), snapshot);
}

#[test]
fn realloc_preserves_contents() {
    let mut storage = Vec::new();
    let mut heap = fresh_heap(&mut storage);

    let p = heap.alloc(16).expect("alloc");
    unsafe {
        core::ptr::copy_nonoverlapping(b"vesper!!".as_ptr(), p, 8);
    }
    let q = heap.realloc(p, 4096).expect("realloc");
    let mut out = [0u8; 8];
    unsafe {
        core::ptr::copy_nonoverlapping(q, out.as_mut_ptr(), 8);
    }
    assert_eq!(&out, b"vesper!!");
    heap.free(q).expect("free");
}

#[test]
fn exhaustion_is_an_error_not_a_crash() {
    let mut storage = Vec::new();
    let mut heap = fresh_heap(&mut storage);
    let mut blocks = Vec::new();
    while let Some(p) = heap.alloc(1024) {
        blocks.push(p);
    }
    assert!(!blocks.is_empty());
    for p in blocks {
        heap.free(p).expect("free");
    }
    heap.defragment();
    assert_eq!(heap.stats().used, 0);
}
