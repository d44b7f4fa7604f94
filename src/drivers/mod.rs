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

//! Device drivers.

pub mod e1000;
pub mod pci;
#[cfg(target_arch = "x86")]
pub mod serial;

/// Bring up the hardware drivers. The NIC being absent is not fatal;
/// the network stack just stays down.
#[cfg(target_arch = "x86")]
pub fn init() {
    serial::init();
    if let Some(logger) = crate::log::try_get_logger() {
        logger.add_sink(serial::log_sink);
    }
    crate::syscall::register_console_sink(serial::console_sink);

    match e1000::init() {
        Ok(()) => log_info!("[DRIVERS] e1000 online"),
        Err(e) => log_warn!("[DRIVERS] {}", e),
    }
}
