//! Pre-flight checks for pgtrace
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::domain::{Pid, TracerError};

/// Minimum kernel version for the eBPF features used here (BPF ring
/// buffer requires 5.8).
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading.
pub fn run_preflight_checks(binary_path: &str, pids: &[i32]) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary_exists(binary_path)?;
    for &pid in pids {
        check_pid_runs_binary(pid, binary_path)?;
    }
    Ok(())
}

/// Check if running with sufficient privileges for eBPF.
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    // Not root - CAP_BPF + CAP_PERFMON would also do, but probing
    // capabilities portably needs more machinery than it is worth here.
    bail!(
        "Permission denied: pgtrace requires root privileges to load eBPF programs.\n\n\
         Run with: sudo pgtrace ..."
    );
}

/// Check if the kernel version is sufficient for the features used.
fn check_kernel_version() -> Result<()> {
    let version_str = fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 5.15.0-generic ..." / "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let mut parts = release.split('.');
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts
        .next()
        .map(|s| s.chars().take_while(char::is_ascii_digit).collect::<String>())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if major == 0 {
        // Can't parse, assume it's fine
        return Ok(());
    }
    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel {release} is too old: pgtrace needs at least {}.{} for the BPF ring buffer",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1
        );
    }
    Ok(())
}

fn check_binary_exists(binary_path: &str) -> Result<()> {
    if !Path::new(binary_path).is_file() {
        bail!("Target binary {binary_path} does not exist");
    }
    Ok(())
}

/// Every traced pid must actually run the binary the probes attach to;
/// offsets resolved against the wrong executable decode garbage.
fn check_pid_runs_binary(pid: i32, binary_path: &str) -> Result<()> {
    let exe_link = format!("/proc/{pid}/exe");
    let actual = fs::read_link(&exe_link)
        .map_err(|_| TracerError::ProcessNotFound(Pid(pid)))?;
    // A deleted-but-running binary shows up as "path (deleted)".
    let actual = actual.to_string_lossy();
    let actual = actual.strip_suffix(" (deleted)").unwrap_or(&actual);
    if actual != binary_path {
        return Err(TracerError::PidBinaryMismatch {
            pid: Pid(pid),
            expected: binary_path.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }
    Ok(())
}
