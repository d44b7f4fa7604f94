//! Architecture support. Only x86 (32-bit) is wired up; the pure parts
//! (descriptor encoding, frame layouts) also build on the host for tests.

pub mod x86;
