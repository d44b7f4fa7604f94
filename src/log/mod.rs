//! Kernel logging subsystem.

#[macro_use]
pub mod logger;

pub use logger::{enter_panic_mode, init, try_get_logger, LogEntry, Logger, Severity};
