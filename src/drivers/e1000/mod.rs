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

//! Intel 8254x (E1000) Ethernet driver.

pub mod constants;
pub mod descriptors;
pub mod device;

pub use constants::{E1000_DEVICE_IDS, INTEL_VENDOR_ID};
pub use device::{DmaAllocator, DmaChunk, E1000, Mmio, NicStats};

#[cfg(target_arch = "x86")]
mod kernel {
    use super::device::{DmaAllocator, DmaChunk, E1000, Mmio};
    use crate::memory::frame_alloc;
    use crate::memory::layout::{page_align_up, PAGE_SIZE};
    use crate::memory::paging;
    use spin::Mutex;

    /// BAR0 register window, 128 KiB, mapped uncached.
    const MMIO_SPAN: u32 = 0x2_0000;

    pub struct MmioWindow {
        base: u32,
    }

    impl Mmio for MmioWindow {
        fn read(&self, offset: u32) -> u32 {
            unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
        }

        fn write(&mut self, offset: u32, value: u32) {
            unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
        }
    }

    /// DMA memory from the frame allocator. Low frames are identity
    /// mapped, so the physical address doubles as the kernel pointer.
    struct FrameDma;

    impl DmaAllocator for FrameDma {
        fn alloc(&mut self, size: usize, _align: usize) -> Result<DmaChunk, &'static str> {
            let pages = page_align_up(size as u32) / PAGE_SIZE;
            let phys = frame_alloc::alloc_frames(pages).map_err(|_| "e1000: out of dma frames")?;
            unsafe {
                core::ptr::write_bytes(phys as *mut u8, 0, (pages * PAGE_SIZE) as usize);
            }
            Ok(DmaChunk { phys: u64::from(phys), ptr: phys as *mut u8 })
        }
    }

    static NIC: Mutex<Option<E1000<MmioWindow>>> = Mutex::new(None);

    fn irq_handler() {
        if let Some(nic) = NIC.lock().as_mut() {
            nic.handle_interrupt();
        }
    }

    /// Find the NIC on PCI, map its registers, and bring it up.
    pub fn init() -> Result<(), &'static str> {
        let pci_dev = crate::drivers::pci::find_e1000().ok_or("e1000: no device found")?;
        crate::drivers::pci::enable_bus_master(&pci_dev);

        let bar0 = pci_dev.mmio_base().ok_or("e1000: BAR0 is not MMIO")?;
        let mut env = paging::KernelEnv;
        let base = paging::with_kernel_mmu(|mmu| {
            mmu.ensure_physical_accessible(&mut env, bar0, MMIO_SPAN)
        })
        .ok_or("e1000: kernel mmu not initialized")?
        .map_err(|_| "e1000: mmio mapping failed")?;

        let dev = E1000::init(MmioWindow { base }, &mut FrameDma)?;
        *NIC.lock() = Some(dev);

        crate::interrupts::register_irq_handler(pci_dev.irq_line, irq_handler);
        log_info!(
            "[E1000] {:02x}:{:02x}.{} irq {} mmio {:#010x}",
            pci_dev.bus,
            pci_dev.device,
            pci_dev.function,
            pci_dev.irq_line,
            bar0
        );
        Ok(())
    }

    pub fn present() -> bool {
        NIC.lock().is_some()
    }

    pub fn with_nic<R>(f: impl FnOnce(&mut E1000<MmioWindow>) -> R) -> Option<R> {
        NIC.lock().as_mut().map(f)
    }
}

#[cfg(target_arch = "x86")]
pub use kernel::{init, present, with_nic, MmioWindow};
