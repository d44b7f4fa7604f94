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

//! Legacy descriptor layouts, 16 bytes each, shared with the hardware.

#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct RxDesc {
    pub buffer_addr: u64,
    pub length: u16,
    pub checksum: u16,
    pub status: u8,
    pub errors: u8,
    pub special: u16,
}

impl RxDesc {
    pub const STATUS_DD: u8 = 0x01;
    pub const STATUS_EOP: u8 = 0x02;

    #[inline]
    pub fn is_done(&self) -> bool {
        self.status & Self::STATUS_DD != 0
    }

    #[inline]
    pub fn is_eop(&self) -> bool {
        self.status & Self::STATUS_EOP != 0
    }

    #[inline]
    pub fn has_error(&self) -> bool {
        self.errors != 0
    }

    /// Hand the descriptor back to hardware.
    pub fn reset(&mut self) {
        self.length = 0;
        self.checksum = 0;
        self.status = 0;
        self.errors = 0;
        self.special = 0;
    }
}

#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct TxDesc {
    pub buffer_addr: u64,
    pub length: u16,
    pub cso: u8,
    pub cmd: u8,
    pub status: u8,
    pub css: u8,
    pub special: u16,
}

impl TxDesc {
    pub const STATUS_DD: u8 = 0x01;

    #[inline]
    pub fn is_done(&self) -> bool {
        self.status & Self::STATUS_DD != 0
    }

    pub fn setup(&mut self, buffer_phys: u64, len: u16, cmd: u8) {
        self.buffer_addr = buffer_phys;
        self.length = len;
        self.cso = 0;
        self.cmd = cmd;
        self.status = 0;
        self.css = 0;
        self.special = 0;
    }
}

const _: () = {
    assert!(core::mem::size_of::<RxDesc>() == 16);
    assert!(core::mem::size_of::<TxDesc>() == 16);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_status_bits() {
        let mut desc = RxDesc::default();
        assert!(!desc.is_done());
        desc.status = RxDesc::STATUS_DD | RxDesc::STATUS_EOP;
        assert!(desc.is_done());
        assert!(desc.is_eop());
        desc.reset();
        assert!(!desc.is_done());
    }

    #[test]
    fn tx_setup_clears_status() {
        let mut desc = TxDesc { status: TxDesc::STATUS_DD, ..Default::default() };
        desc.setup(0x1000, 64, 0x0B);
        assert!(!desc.is_done());
        assert_eq!(desc.cmd, 0x0B);
        assert_eq!(desc.length, 64);
    }
}
