//! Structured error types for pgtrace
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Failed to load eBPF program: {0}")]
    EbpfLoadFailed(String),

    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error("Pid {pid} does not belong to binary {expected} (executable is {actual})")]
    PidBinaryMismatch { pid: Pid, expected: String, actual: String },

    #[error("Failed to attach {probe} to {binary}: {error}")]
    ProbeAttachFailed { probe: String, binary: String, error: String },

    #[error("{0}")]
    LayoutRejected(pgtrace_common::LayoutError),

    #[error("USDT probe {provider}:{name} not found in {binary}")]
    UsdtProbeNotFound { provider: String, name: String, binary: String },

    #[error("USDT probe {0} is semaphore-guarded; pgtrace never writes target memory")]
    UsdtSemaphoreGuarded(String),

    #[error("eBPF map {0} not found (wrong probe object?)")]
    MapNotFound(&'static str),

    #[error("Output file {0} already exists")]
    OutputFileExists(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),
}
