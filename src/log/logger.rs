//! Kernel logger.
//!
//! Severity-filtered logger with a fixed-capacity ring buffer of recent
//! entries and pluggable output sinks (serial console on hardware, capture
//! buffers in tests).

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use alloc::vec::Vec;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Fatal = 4,
}

/// One retained log line.
#[derive(Clone)]
pub struct LogEntry {
    pub sequence: u64,
    pub tick: u64,
    pub severity: Severity,
    pub message: heapless::String<256>,
}

/// Ring buffer capacity for retained entries.
const LOG_BUFFER_SIZE: usize = 512;

/// Output sink: called for every line that passes the severity filter.
pub type Sink = fn(Severity, &str);

pub struct Logger {
    entries: Mutex<heapless::Deque<LogEntry, LOG_BUFFER_SIZE>>,
    sinks: Mutex<Vec<Sink>>,
    sequence: AtomicU64,
    panic_mode: AtomicBool,
    min_level: Mutex<Severity>,
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            entries: Mutex::new(heapless::Deque::new()),
            sinks: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            panic_mode: AtomicBool::new(false),
            min_level: Mutex::new(Severity::Debug),
        }
    }
}

static LOGGER: Logger = Logger::new();

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the logging subsystem. Idempotent.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
}

/// Get logger if initialized
pub fn try_get_logger() -> Option<&'static Logger> {
    if INITIALIZED.load(Ordering::Relaxed) {
        Some(&LOGGER)
    } else {
        None
    }
}

impl Logger {
    pub fn log(&self, severity: Severity, msg: &str) {
        if severity < *self.min_level.lock() {
            return;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let tick = crate::time::ticks() as u64;

        let mut message = heapless::String::new();
        let _ = message.push_str(msg);

        let entry = LogEntry { sequence, tick, severity, message };

        // In panic mode skip the ring buffer: go straight to the sinks.
        if !self.panic_mode.load(Ordering::Relaxed) {
            let mut entries = self.entries.lock();
            if entries.is_full() {
                let _ = entries.pop_front();
            }
            let _ = entries.push_back(entry);
        }

        for sink in self.sinks.lock().iter() {
            sink(severity, msg);
        }
    }

    /// Register an output sink.
    pub fn add_sink(&self, sink: Sink) {
        self.sinks.lock().push(sink);
    }

    pub fn set_min_level(&self, level: Severity) {
        *self.min_level.lock() = level;
    }

    /// Enter panic mode: bypass the ring buffer so the final lines always
    /// reach the sinks.
    pub fn enter_panic_mode(&self) {
        self.panic_mode.store(true, Ordering::SeqCst);
    }

    /// Export the most recent `count` entries.
    pub fn export_recent(&self, count: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let start = entries.len().saturating_sub(count);
        entries.iter().skip(start).cloned().collect()
    }
}

// ===== Convenience Macros =====

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::log::try_get_logger() {
            let msg = $crate::format!($($arg)*);
            logger.log($crate::log::Severity::Info, &msg);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::log::try_get_logger() {
            let msg = $crate::format!($($arg)*);
            logger.log($crate::log::Severity::Warn, &msg);
        }
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::log::try_get_logger() {
            let msg = $crate::format!($($arg)*);
            logger.log($crate::log::Severity::Error, &msg);
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::log::try_get_logger() {
            let msg = $crate::format!($($arg)*);
            logger.log($crate::log::Severity::Debug, &msg);
        }
    };
}

#[macro_export]
macro_rules! log_fatal {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::log::try_get_logger() {
            let msg = $crate::format!($($arg)*);
            logger.log($crate::log::Severity::Fatal, &msg);
        }
    };
}

/// Helper to enter panic mode
pub fn enter_panic_mode() {
    if let Some(logger) = try_get_logger() {
        logger.enter_panic_mode();
    }
}
