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

//! PCI configuration space, legacy port mechanism #1.

/// Config space reads and writes, 32 bits at a time. `offset` must be
/// dword aligned.
pub trait ConfigAccess {
    fn read(&mut self, bus: u8, device: u8, function: u8, offset: u8) -> u32;
    fn write(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u32);
}

/// CONFIG_ADDRESS encoding for port 0xCF8.
pub fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | (u32::from(bus) << 16)
        | (u32::from(device & 0x1F) << 11)
        | (u32::from(function & 0x07) << 8)
        | u32::from(offset & 0xFC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub irq_line: u8,
    pub bar0: u32,
}

impl PciDevice {
    /// BAR0 base when it is a memory BAR. IO BARs have bit 0 set.
    pub fn mmio_base(&self) -> Option<u32> {
        if self.bar0 & 1 == 0 {
            Some(self.bar0 & !0xF)
        } else {
            None
        }
    }
}

fn probe(access: &mut impl ConfigAccess, bus: u8, device: u8, function: u8) -> Option<PciDevice> {
    let id = access.read(bus, device, function, 0x00);
    let vendor_id = id as u16;
    if vendor_id == 0xFFFF {
        return None;
    }
    let irq_line = access.read(bus, device, function, 0x3C) as u8;
    let bar0 = access.read(bus, device, function, 0x10);
    Some(PciDevice {
        bus,
        device,
        function,
        vendor_id,
        device_id: (id >> 16) as u16,
        irq_line,
        bar0,
    })
}

fn is_multifunction(access: &mut impl ConfigAccess, bus: u8, device: u8) -> bool {
    let header = access.read(bus, device, 0, 0x0C);
    header & 0x0080_0000 != 0
}

/// Walk bus 0 (QEMU puts everything there) calling `visit` per function.
pub fn scan_bus(access: &mut impl ConfigAccess, mut visit: impl FnMut(&PciDevice)) {
    for device in 0..32 {
        let Some(dev) = probe(access, 0, device, 0) else {
            continue;
        };
        visit(&dev);
        if is_multifunction(access, 0, device) {
            for function in 1..8 {
                if let Some(dev) = probe(access, 0, device, function) {
                    visit(&dev);
                }
            }
        }
    }
}

/// First device the E1000 driver claims.
pub fn find_e1000_on(access: &mut impl ConfigAccess) -> Option<PciDevice> {
    let mut found = None;
    scan_bus(access, |dev| {
        if found.is_none()
            && dev.vendor_id == super::e1000::INTEL_VENDOR_ID
            && super::e1000::E1000_DEVICE_IDS.contains(&dev.device_id)
        {
            found = Some(*dev);
        }
    });
    found
}

/// Set Bus Master and Memory Space in the command register so the NIC
/// can DMA.
pub fn enable_bus_master_on(access: &mut impl ConfigAccess, dev: &PciDevice) {
    let cmd = access.read(dev.bus, dev.device, dev.function, 0x04);
    access.write(dev.bus, dev.device, dev.function, 0x04, cmd | 0x6);
}

#[cfg(target_arch = "x86")]
mod ports {
    use super::ConfigAccess;
    use crate::arch::x86::port::{inl, outl};

    const CONFIG_ADDRESS: u16 = 0xCF8;
    const CONFIG_DATA: u16 = 0xCFC;

    pub struct PortConfig;

    impl ConfigAccess for PortConfig {
        fn read(&mut self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
            unsafe {
                outl(CONFIG_ADDRESS, super::config_address(bus, device, function, offset));
                inl(CONFIG_DATA)
            }
        }

        fn write(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u32) {
            unsafe {
                outl(CONFIG_ADDRESS, super::config_address(bus, device, function, offset));
                outl(CONFIG_DATA, value);
            }
        }
    }

    pub fn find_e1000() -> Option<super::PciDevice> {
        super::find_e1000_on(&mut PortConfig)
    }

    pub fn enable_bus_master(dev: &super::PciDevice) {
        super::enable_bus_master_on(&mut PortConfig, dev);
    }
}

#[cfg(target_arch = "x86")]
pub use ports::{enable_bus_master, find_e1000, PortConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeBus {
        regs: BTreeMap<(u8, u8, u8, u8), u32>,
    }

    impl FakeBus {
        fn add_device(&mut self, device: u8, vendor: u16, id: u16, irq: u8, bar0: u32) {
            self.regs
                .insert((0, device, 0, 0x00), u32::from(vendor) | (u32::from(id) << 16));
            self.regs.insert((0, device, 0, 0x3C), u32::from(irq));
            self.regs.insert((0, device, 0, 0x10), bar0);
        }
    }

    impl ConfigAccess for FakeBus {
        fn read(&mut self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
            *self.regs.get(&(bus, device, function, offset)).unwrap_or(&0xFFFF_FFFF)
        }

        fn write(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u32) {
            self.regs.insert((bus, device, function, offset), value);
        }
    }

    #[test]
    fn config_address_encoding() {
        assert_eq!(config_address(0, 0, 0, 0), 0x8000_0000);
        assert_eq!(config_address(0, 3, 0, 0x10), 0x8000_1810);
        assert_eq!(config_address(1, 2, 1, 0x3C), 0x8001_113C);
        // Low two offset bits are dropped.
        assert_eq!(config_address(0, 0, 0, 0x3E), config_address(0, 0, 0, 0x3C));
    }

    #[test]
    fn scan_finds_e1000_and_skips_others() {
        let mut bus = FakeBus::default();
        bus.regs.insert((0, 0, 0, 0x0C), 0); // host bridge header
        bus.add_device(0, 0x8086, 0x1237, 0, 0);
        bus.regs.insert((0, 2, 0, 0x0C), 0);
        bus.add_device(2, 0x8086, 0x100E, 11, 0xFEBC_0000);

        let dev = find_e1000_on(&mut bus).expect("nic present");
        assert_eq!(dev.device, 2);
        assert_eq!(dev.device_id, 0x100E);
        assert_eq!(dev.irq_line, 11);
        assert_eq!(dev.mmio_base(), Some(0xFEBC_0000));
    }

    #[test]
    fn io_bar_is_not_mmio() {
        let dev = PciDevice {
            bus: 0,
            device: 2,
            function: 0,
            vendor_id: 0x8086,
            device_id: 0x100E,
            irq_line: 11,
            bar0: 0xC001,
        };
        assert_eq!(dev.mmio_base(), None);
    }

    #[test]
    fn bus_master_sets_command_bits() {
        let mut bus = FakeBus::default();
        bus.regs.insert((0, 2, 0, 0x0C), 0);
        bus.add_device(2, 0x8086, 0x100E, 11, 0xFEBC_0000);
        bus.regs.insert((0, 2, 0, 0x04), 0x0001);

        let dev = find_e1000_on(&mut bus).expect("nic present");
        enable_bus_master_on(&mut bus, &dev);
        assert_eq!(bus.read(0, 2, 0, 0x04), 0x0007);
    }
}
