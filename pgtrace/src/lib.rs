//! # pgtrace - eBPF-based PostgreSQL Lock Tracer
//!
//! pgtrace attaches uprobes to a running, unmodified PostgreSQL server and
//! streams typed events describing heavyweight lock traffic, row-level
//! lock contention, lightweight-lock tracepoints, spin-wait delays,
//! transaction boundaries and query execution. PostgreSQL exposes no USDT
//! probes for its heavyweight locks, so the tracer decodes function
//! arguments and server-internal structures directly, driven by
//! per-version layout tables.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                PostgreSQL backends (unmodified)             │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ uprobes / stapsdt sites
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                eBPF programs (pgtrace-ebpf)                 │
//! │   decode via pgtrace-common: layout tables + ABI accessor   │
//! │   + bounded memory reads  →  fixed-size records             │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ ring buffer (lossy, non-blocking)
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    pgtrace (this crate)                     │
//! │   attach / configure → drain → render (human | JSON)        │
//! │   statistics, stack symbolization (DWARF / symtab)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`cli`]: command-line argument parsing
//! - [`probes`]: eBPF object loading, layout/config publication, uprobe
//!   and stapsdt attachment
//! - [`output`]: human and JSON renderers plus lock statistics
//! - [`symbolization`]: stack id resolution against DWARF or the ELF
//!   symbol table
//! - [`preflight`]: privilege, kernel and pid/binary sanity checks
//! - [`domain`]: newtypes and structured errors

pub mod cli;
pub mod domain;
pub mod output;
pub mod preflight;
pub mod probes;
pub mod symbolization;
