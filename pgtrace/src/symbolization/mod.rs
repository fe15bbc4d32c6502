//! # Symbol Resolution and Address Translation
//!
//! Stack ids captured by the probe side are just keys into a table of raw
//! instruction pointers. Turning those into `WaitOnLock` at
//! `lock.c:1832` takes three steps:
//!
//! 1. `/proc/<pid>/maps` gives the runtime base of the (PIE) postgres
//!    binary, so runtime addresses can be rebased to file-relative ones.
//! 2. DWARF debug info (via `addr2line`/`gimli`) resolves rebased
//!    addresses to function, file and line — available when the server was
//!    built with `--enable-debug`.
//! 3. Without DWARF, the ELF symbol table (via `object`) still yields
//!    `function+offset` style frames.
//!
//! Resolution is lazy and cached: stacks are only symbolized when an event
//! that carries one is rendered.

pub mod memory_maps;
pub mod stack_resolver;
pub mod symbolizer;

pub use memory_maps::{executable_range, MemoryRange};
pub use stack_resolver::StackResolver;
pub use symbolizer::Symbolizer;
