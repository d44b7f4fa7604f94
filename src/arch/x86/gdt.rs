//! GDT and TSS.
//!
//! Flat 4 GiB segmentation: kernel and user code/data segments plus one
//! TSS whose `esp0` is repointed at every switch to a user task so Ring 3
//! interrupts land on that task's kernel stack.

/// Segment selectors. User selectors carry RPL 3.
pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1B;
pub const USER_DS: u16 = 0x23;
pub const TSS_SEL: u16 = 0x28;

pub const ACCESS_KERNEL_CODE: u8 = 0x9A;
pub const ACCESS_KERNEL_DATA: u8 = 0x92;
pub const ACCESS_USER_CODE: u8 = 0xFA;
pub const ACCESS_USER_DATA: u8 = 0xF2;
pub const ACCESS_TSS: u8 = 0x89;

/// 4 KiB granularity, 32-bit operand size.
pub const GRAN_FLAT: u8 = 0xC0;
/// TSS gets byte granularity, the 0x40 size bit only.
pub const GRAN_TSS: u8 = 0x40;

/// Encode one 8-byte segment descriptor. `gran` is the high nibble of the
/// granularity byte, already shifted.
pub const fn encode_descriptor(base: u32, limit: u32, access: u8, gran: u8) -> u64 {
    let limit_low = (limit & 0xFFFF) as u64;
    let base_low = (base & 0xFFFF) as u64;
    let base_mid = ((base >> 16) & 0xFF) as u64;
    let gran_byte = (((limit >> 16) & 0x0F) as u64) | ((gran as u64) & 0xF0);
    let base_high = ((base >> 24) & 0xFF) as u64;

    limit_low
        | (base_low << 16)
        | (base_mid << 32)
        | ((access as u64) << 40)
        | (gran_byte << 48)
        | (base_high << 56)
}

/// 32-bit task state segment. Only `esp0`/`ss0` are live; everything else
/// stays zero (no hardware task switching).
#[repr(C, packed)]
pub struct TaskStateSegment {
    pub prev_task_link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldtr: u32,
    pub iomap_base: u32,
}

impl TaskStateSegment {
    pub const fn zeroed() -> TaskStateSegment {
        TaskStateSegment {
            prev_task_link: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldtr: 0,
            iomap_base: 0,
        }
    }
}

#[cfg(target_arch = "x86")]
mod install {
    use super::*;
    use core::arch::asm;
    use core::cell::UnsafeCell;

    const GDT_ENTRIES: usize = 6;

    #[repr(C, packed)]
    struct GdtPointer {
        limit: u16,
        base: u32,
    }

    struct GdtCell(UnsafeCell<[u64; GDT_ENTRIES]>);
    unsafe impl Sync for GdtCell {}

    struct TssCell(UnsafeCell<TaskStateSegment>);
    unsafe impl Sync for TssCell {}

    static GDT: GdtCell = GdtCell(UnsafeCell::new([0; GDT_ENTRIES]));
    static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment::zeroed()));

    /// Build and load the GDT, reload segment registers, load the TSS.
    /// Called once, before interrupts are enabled.
    pub fn init() {
        let tss_base = TSS.0.get() as u32;
        let tss_limit = (core::mem::size_of::<TaskStateSegment>() - 1) as u32;

        unsafe {
            let tss = &mut *TSS.0.get();
            tss.ss0 = KERNEL_DS as u32;
            tss.iomap_base = core::mem::size_of::<TaskStateSegment>() as u32;

            let gdt = &mut *GDT.0.get();
            gdt[0] = 0;
            gdt[1] = encode_descriptor(0, 0xFFFFF, ACCESS_KERNEL_CODE, GRAN_FLAT);
            gdt[2] = encode_descriptor(0, 0xFFFFF, ACCESS_KERNEL_DATA, GRAN_FLAT);
            gdt[3] = encode_descriptor(0, 0xFFFFF, ACCESS_USER_CODE, GRAN_FLAT);
            gdt[4] = encode_descriptor(0, 0xFFFFF, ACCESS_USER_DATA, GRAN_FLAT);
            gdt[5] = encode_descriptor(tss_base, tss_limit, ACCESS_TSS, GRAN_TSS);

            let ptr = GdtPointer {
                limit: (GDT_ENTRIES * 8 - 1) as u16,
                base: GDT.0.get() as u32,
            };

            asm!(
                "lgdt [{ptr}]",
                "mov ax, {kds}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "mov ss, ax",
                "push {kcs}",
                "lea eax, [2f]",
                "push eax",
                "retf",
                "2:",
                "mov ax, {tss}",
                "ltr ax",
                ptr = in(reg) &ptr,
                kds = const KERNEL_DS as u32,
                kcs = const KERNEL_CS as u32,
                tss = const TSS_SEL as u32,
                out("eax") _,
            );
        }
        log_info!("[GDT] loaded, tss at {:#010x}", tss_base);
    }

    /// Point the TSS kernel stack at `esp0`. Ring 3 interrupt entry pushes
    /// its frame there.
    pub fn set_kernel_stack(esp0: u32) {
        unsafe {
            (*TSS.0.get()).esp0 = esp0;
        }
    }
}

#[cfg(target_arch = "x86")]
pub use install::{init, set_kernel_stack};
