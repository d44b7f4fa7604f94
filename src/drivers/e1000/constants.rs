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

pub const INTEL_VENDOR_ID: u16 = 0x8086;
/// Devices this driver claims: classic 8254x parts plus the QEMU/82574
/// variants commonly seen in virtual machines.
pub const E1000_DEVICE_IDS: &[u16] = &[0x100E, 0x1004, 0x100F, 0x10D3, 0x10EA, 0x1502];

pub mod reg {
    pub const CTRL: u32 = 0x0000;
    pub const STATUS: u32 = 0x0008;
    pub const EERD: u32 = 0x0014;
    pub const ICR: u32 = 0x00C0;
    pub const IMS: u32 = 0x00D0;
    pub const IMC: u32 = 0x00D8;
    pub const RCTL: u32 = 0x0100;
    pub const TCTL: u32 = 0x0400;
    pub const TIPG: u32 = 0x0410;
    pub const RDBAL: u32 = 0x2800;
    pub const RDBAH: u32 = 0x2804;
    pub const RDLEN: u32 = 0x2808;
    pub const RDH: u32 = 0x2810;
    pub const RDT: u32 = 0x2818;
    pub const TDBAL: u32 = 0x3800;
    pub const TDBAH: u32 = 0x3804;
    pub const TDLEN: u32 = 0x3808;
    pub const TDH: u32 = 0x3810;
    pub const TDT: u32 = 0x3818;
    pub const RAL0: u32 = 0x5400;
    pub const RAH0: u32 = 0x5404;
    pub const MTA: u32 = 0x5200;
}

pub mod ctrl {
    pub const ASDE: u32 = 1 << 5;
    pub const SLU: u32 = 1 << 6;
    pub const RST: u32 = 1 << 26;
}

pub mod status {
    pub const LU: u32 = 1 << 1;
}

pub mod rctl {
    pub const EN: u32 = 1 << 1;
    pub const UPE: u32 = 1 << 3;
    pub const LPE: u32 = 1 << 5;
    pub const BAM: u32 = 1 << 15;
    pub const BSIZE_2048: u32 = 0 << 16;
    pub const SECRC: u32 = 1 << 26;
}

pub mod tctl {
    pub const EN: u32 = 1 << 1;
    pub const PSP: u32 = 1 << 3;
    pub const CT_SHIFT: u32 = 4;
    pub const COLD_SHIFT: u32 = 12;
}

pub mod int {
    pub const TXDW: u32 = 1 << 0;
    pub const LSC: u32 = 1 << 2;
    pub const RXO: u32 = 1 << 6;
    pub const RXT0: u32 = 1 << 7;
}

pub mod tx_cmd {
    pub const EOP: u8 = 1 << 0;
    pub const IFCS: u8 = 1 << 1;
    pub const RS: u8 = 1 << 3;
}

pub const RX_DESC_COUNT: usize = 32;
pub const TX_DESC_COUNT: usize = 32;
pub const BUFFER_SIZE: usize = 2048;
pub const MIN_FRAME_SIZE: usize = 14;
pub const DESC_ALIGNMENT: usize = 128;
pub const DEFAULT_TIPG: u32 = 0x0060_200A;
pub const COLLISION_THRESHOLD: u32 = 0x10;
pub const COLLISION_DISTANCE: u32 = 0x40;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_ids_include_qemu_default() {
        assert!(E1000_DEVICE_IDS.contains(&0x100E));
        assert!(E1000_DEVICE_IDS.contains(&0x10D3));
    }

    #[test]
    fn ring_register_offsets() {
        assert_eq!(reg::RDBAL, 0x2800);
        assert_eq!(reg::TDBAL, 0x3800);
        assert_eq!(reg::RAL0, 0x5400);
    }
}
