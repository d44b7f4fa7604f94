//! COM1 serial output, 16550-compatible.
//!
//! The port is the kernel's log sink: whatever the logger emits ends up
//! on the emulator's stdio or a real null-modem cable.

#![cfg(target_arch = "x86")]

use crate::arch::x86::port::{inb, outb};
use spin::Mutex;

const COM1: u16 = 0x3F8;

static COM1_LOCK: Mutex<()> = Mutex::new(());

/// 115200 baud, 8N1, FIFO on.
pub fn init() {
    let _guard = COM1_LOCK.lock();
    unsafe {
        outb(COM1 + 1, 0x00); // interrupts off, we poll
        outb(COM1 + 3, 0x80); // DLAB
        outb(COM1, 0x01); // divisor 1 = 115200
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x03); // 8N1
        outb(COM1 + 2, 0xC7); // FIFO, 14-byte threshold
        outb(COM1 + 4, 0x0B); // DTR | RTS | OUT2
    }
}

fn transmit_ready() -> bool {
    unsafe { inb(COM1 + 5) & 0x20 != 0 }
}

fn put_byte(b: u8) {
    while !transmit_ready() {
        core::hint::spin_loop();
    }
    unsafe { outb(COM1, b) };
}

pub fn write_bytes(bytes: &[u8]) {
    let _guard = COM1_LOCK.lock();
    for &b in bytes {
        if b == b'\n' {
            put_byte(b'\r');
        }
        put_byte(b);
    }
}

/// Logger sink adapter.
pub fn log_sink(severity: crate::log::Severity, msg: &str) {
    let tag = match severity {
        crate::log::Severity::Debug => "DEBUG",
        crate::log::Severity::Info => "INFO ",
        crate::log::Severity::Warn => "WARN ",
        crate::log::Severity::Error => "ERROR",
        crate::log::Severity::Fatal => "FATAL",
    };
    write_bytes(b"[");
    write_bytes(tag.as_bytes());
    write_bytes(b"] ");
    write_bytes(msg.as_bytes());
    write_bytes(b"\n");
}

/// Console sink for SYS_WRITE fd 1 and 2.
pub fn console_sink(bytes: &[u8]) {
    write_bytes(bytes);
}
