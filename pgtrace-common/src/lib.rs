//! # Shared Decode Engine (eBPF ↔ Userspace)
//!
//! Everything the probe programs and the userspace tracer agree on lives in
//! this crate: the wire event records, the per-version struct layout tables,
//! the calling-convention argument accessor, and the event encoders that turn
//! a firing probe into a fixed-size record.
//!
//! The decode logic is deliberately written against four small traits —
//! [`abi::CallSite`], [`mem::MemoryReader`], [`stacks::StackCapture`] and
//! [`sink::EventSink`] — so the exact same encoder bodies run inside the BPF
//! virtual machine (backed by `bpf_probe_read_user` and a ring buffer) and on
//! the host under `cargo test` (backed by literal register files and byte
//! images). Offsets into PostgreSQL's internals cannot be checked at runtime;
//! the tests in this crate are the only guard rail.
//!
//! ## Key Types
//!
//! - [`events`] — `#[repr(C)]` event records and `EVENT_*` kind constants
//! - [`layout::LayoutDescriptor`] — per-version field offset table, resolved
//!   once at attach time and shipped to the BPF side through a map
//! - [`abi::AbiProfile`] — register count and stack slot geometry of the
//!   target's calling convention
//! - [`encode::EventEncoder`] — one decode method per instrumentation point

#![no_std]
// Decoding is deliberate narrowing: register words become Oids, modes and
// flags of the widths the wire format declares.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

#[cfg(test)]
extern crate std;

pub mod abi;
pub mod config;
pub mod encode;
pub mod events;
pub mod layout;
pub mod mem;
pub mod sink;
pub mod stacks;

#[cfg(test)]
pub(crate) mod testutil;

pub use abi::{AbiProfile, CallSite, SYSTEM_V_AMD64};
pub use config::{StackSites, TraceFamilies};
pub use encode::EventEncoder;
pub use layout::{LayoutDescriptor, LayoutError, PostgresVersion};
pub use mem::{MemoryReader, ReadFault};
pub use sink::{ChannelFull, EventSink, Record};
pub use stacks::{NoStacks, StackCapture, StackSite};
