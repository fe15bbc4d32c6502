//! `/proc/<pid>/maps` parsing.
//!
//! PIE executables land at a randomized base; captured stack addresses are
//! runtime addresses and must be rebased before a DWARF or symbol table
//! lookup. The range below spans every mapping of the target binary in
//! the observed process.

use anyhow::{Context, Result};
use log::info;
use std::fs;

/// Memory range of a loaded binary in a process's address space.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Rebase a runtime address to a file-relative one, passing through
    /// addresses outside the binary (shared libraries).
    #[must_use]
    pub fn rebase(&self, addr: u64) -> u64 {
        if self.contains(addr) {
            addr - self.start
        } else {
            addr
        }
    }
}

/// Find the memory range the target binary occupies in process `pid`.
///
/// All mappings whose pathname matches are folded into one min/max range;
/// text, rodata and data segments of the same binary map separately.
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` cannot be read or the binary is
/// not mapped in that process.
pub fn executable_range(pid: i32, binary_path: &str) -> Result<MemoryRange> {
    let maps_path = format!("/proc/{pid}/maps");
    let maps = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;
    let range = range_from_maps(&maps, binary_path)
        .with_context(|| format!("{binary_path} is not mapped in process {pid}"))?;
    info!(
        "Executable memory range: 0x{:x} - 0x{:x} (size: {} KB)",
        range.start,
        range.end,
        (range.end - range.start) / 1024
    );
    Ok(range)
}

fn range_from_maps(maps: &str, binary_path: &str) -> Option<MemoryRange> {
    let mut range: Option<MemoryRange> = None;

    for line in maps.lines() {
        // "start-end perms offset dev inode pathname"
        let mut parts = line.split_whitespace();
        let Some(span) = parts.next() else { continue };
        if parts.clone().last() != Some(binary_path) {
            continue;
        }
        let Some((start, end)) = span.split_once('-') else { continue };
        let (Ok(start), Ok(end)) =
            (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };
        range = Some(match range {
            None => MemoryRange { start, end },
            Some(r) => MemoryRange { start: r.start.min(start), end: r.end.max(end) },
        });
    }
    range
}
