//! stapsdt (USDT) note parsing.
//!
//! PostgreSQL servers built with `--enable-dtrace` carry their tracepoints
//! as `NT_STAPSDT` notes in the `.note.stapsdt` ELF section. Each note
//! names a provider and probe, the virtual address of the probe site, the
//! link-time address of the `.stapsdt.base` section (for prelink
//! adjustment) and an optional semaphore address.
//!
//! Semaphore-guarded probes would require writing a counter into target
//! memory to arm them; this tracer has no write path, so such probes are
//! refused outright. PostgreSQL's lwlock tracepoints carry no semaphores.

use object::{Object, ObjectSection, ObjectSegment};
use std::collections::HashMap;

use crate::domain::TracerError;

/// Provider name the server's tracepoints use.
pub const PROVIDER: &str = "postgresql";

const NT_STAPSDT: u32 = 3;
const STAPSDT_NAME: &[u8] = b"stapsdt\0";

/// One parsed `NT_STAPSDT` note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsdtNote {
    pub provider: String,
    pub name: String,
    /// Virtual address of the probe site (before prelink adjustment).
    pub address: u64,
    /// Link-time address of `.stapsdt.base`.
    pub base: u64,
    /// Semaphore address, 0 when the probe is always armed.
    pub semaphore: u64,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(at..at + 8)?.try_into().ok()?))
}

fn read_cstr(data: &[u8], at: usize) -> Option<(&str, usize)> {
    let rest = data.get(at..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&rest[..end]).ok()?;
    Some((s, at + end + 1))
}

/// Parse every stapsdt note out of the raw `.note.stapsdt` section bytes.
/// Notes that are malformed or of a different type are skipped, not fatal:
/// the section may legitimately interleave other note kinds.
#[must_use]
pub fn parse_notes(section: &[u8]) -> Vec<UsdtNote> {
    let mut notes = Vec::new();
    let mut at = 0usize;

    while at + 12 <= section.len() {
        let Some(namesz) = read_u32(section, at) else { break };
        let Some(descsz) = read_u32(section, at + 4) else { break };
        let Some(kind) = read_u32(section, at + 8) else { break };
        let name_at = at + 12;
        let desc_at = name_at + align4(namesz as usize);
        let next = desc_at + align4(descsz as usize);
        if next > section.len() {
            break;
        }

        if kind == NT_STAPSDT
            && section.get(name_at..name_at + namesz as usize) == Some(STAPSDT_NAME)
        {
            if let Some(note) = parse_desc(&section[desc_at..desc_at + descsz as usize]) {
                notes.push(note);
            }
        }
        at = next;
    }
    notes
}

fn parse_desc(desc: &[u8]) -> Option<UsdtNote> {
    let address = read_u64(desc, 0)?;
    let base = read_u64(desc, 8)?;
    let semaphore = read_u64(desc, 16)?;
    let (provider, next) = read_cstr(desc, 24)?;
    let (name, _next) = read_cstr(desc, next)?;
    // The argument format string follows; this tracer decodes arguments
    // through the ABI profile instead, so it is not retained.
    Some(UsdtNote {
        provider: provider.to_string(),
        name: name.to_string(),
        address,
        base,
        semaphore,
    })
}

/// Translate a virtual address to a file offset given loadable segments as
/// `(vaddr, file_offset, size)` triples.
fn vaddr_to_file_offset(
    vaddr: u64,
    segments: impl IntoIterator<Item = (u64, u64, u64)>,
) -> Option<u64> {
    segments.into_iter().find_map(|(seg_vaddr, file_offset, size)| {
        (vaddr >= seg_vaddr && vaddr < seg_vaddr + size)
            .then(|| vaddr - seg_vaddr + file_offset)
    })
}

/// Locate the `postgresql:lwlock__*` probe sites in `binary` and return a
/// map from probe name to the file offset a uprobe attaches at.
///
/// # Errors
/// - the binary has no `.note.stapsdt` section (server built without
///   `--enable-dtrace`)
/// - a matching probe carries a semaphore
pub fn lwlock_probe_offsets(
    binary: &[u8],
    binary_path: &str,
) -> Result<HashMap<String, u64>, TracerError> {
    let object = object::File::parse(binary).map_err(|e| {
        TracerError::EbpfLoadFailed(format!("cannot parse {binary_path}: {e}"))
    })?;

    let Some(section) = object.section_by_name(".note.stapsdt") else {
        return Err(TracerError::UsdtProbeNotFound {
            provider: PROVIDER.to_string(),
            name: "lwlock__*".to_string(),
            binary: binary_path.to_string(),
        });
    };
    let data = section.data().map_err(|e| {
        TracerError::EbpfLoadFailed(format!("cannot read .note.stapsdt: {e}"))
    })?;

    // Prelink moves the probe sites; the runtime delta is observable as the
    // movement of the .stapsdt.base section relative to its link-time
    // address recorded in each note.
    let sdt_base = object.section_by_name(".stapsdt.base").map(|s| s.address());

    let segments: Vec<(u64, u64, u64)> = object
        .segments()
        .map(|seg| {
            let (file_offset, _) = seg.file_range();
            (seg.address(), file_offset, seg.size())
        })
        .collect();

    let mut offsets = HashMap::new();
    for note in parse_notes(data) {
        if note.provider != PROVIDER || !note.name.starts_with("lwlock__") {
            continue;
        }
        if note.semaphore != 0 {
            return Err(TracerError::UsdtSemaphoreGuarded(format!(
                "{}:{}",
                note.provider, note.name
            )));
        }
        let adjusted = match sdt_base {
            Some(base_now) => note.address.wrapping_add(base_now.wrapping_sub(note.base)),
            None => note.address,
        };
        if let Some(file_offset) = vaddr_to_file_offset(adjusted, segments.iter().copied()) {
            offsets.insert(note.name, file_offset);
        }
    }

    if offsets.is_empty() {
        return Err(TracerError::UsdtProbeNotFound {
            provider: PROVIDER.to_string(),
            name: "lwlock__*".to_string(),
            binary: binary_path.to_string(),
        });
    }
    Ok(offsets)
}
