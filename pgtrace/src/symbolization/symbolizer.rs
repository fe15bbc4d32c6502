//! Address-to-symbol resolution.
//!
//! DWARF line info (when the server was built with `--enable-debug`) gives
//! file/line plus inlined frames; the ELF symbol table is the fallback and
//! still names the function. Results are cached — lock-heavy workloads
//! resolve the same few acquisition paths over and over.

use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use log::warn;
use object::{Object, ObjectSection, ObjectSymbol};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// One symbol table entry: [start, end) and its demangled name.
struct SymbolRange {
    start: u64,
    end: u64,
    name: String,
}

/// Symbolizer for resolving instruction pointers to source locations.
pub struct Symbolizer {
    /// DWARF context; `None` when the binary carries no debug info.
    dwarf: Option<Context<EndianRcSlice<RunTimeEndian>>>,
    /// Sorted function ranges from the ELF symbol table.
    symbols: Vec<SymbolRange>,
    /// Cache of resolved frames by file-relative address.
    cache: RefCell<HashMap<u64, String>>,
}

impl Symbolizer {
    /// Create a new symbolizer for the given binary.
    ///
    /// # Errors
    /// Returns an error if the binary cannot be read or parsed. Missing
    /// DWARF is not an error — resolution degrades to the symbol table.
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self> {
        let binary_data = fs::read(binary_path.as_ref()).context("Failed to read binary file")?;
        let obj_file = object::File::parse(&*binary_data).context("Failed to parse object file")?;

        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = match gimli::Dwarf::load(&load_section) {
            Ok(dwarf) => match Context::from_dwarf(dwarf) {
                Ok(ctx) => Some(ctx),
                Err(e) => {
                    warn!("No usable DWARF in target binary ({e}); using the symbol table");
                    None
                }
            },
            Err(e) => {
                warn!("Failed to load DWARF sections ({e}); using the symbol table");
                None
            }
        };

        let mut symbols: Vec<SymbolRange> = obj_file
            .symbols()
            .filter(|sym| sym.kind() == object::SymbolKind::Text && sym.size() > 0)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                Some(SymbolRange {
                    start: sym.address(),
                    end: sym.address() + sym.size(),
                    name: format!("{:#}", demangle(name)),
                })
            })
            .collect();
        symbols.sort_by_key(|s| s.start);

        Ok(Self { dwarf, symbols, cache: RefCell::new(HashMap::new()) })
    }

    /// Resolve one file-relative address to a display string.
    pub fn resolve(&self, addr: u64) -> String {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }
        let resolved = self
            .resolve_dwarf(addr)
            .or_else(|| self.resolve_symtab(addr))
            .unwrap_or_else(|| format!("0x{addr:x} <unknown>"));
        self.cache.borrow_mut().insert(addr, resolved.clone());
        resolved
    }

    fn resolve_dwarf(&self, addr: u64) -> Option<String> {
        let ctx = self.dwarf.as_ref()?;
        let mut frames = ctx.find_frames(addr).skip_all_loads().ok()?;
        // The innermost frame names the actual source position; outer
        // frames are inline callers.
        let frame = frames.next().ok()??;
        let function = frame
            .function
            .and_then(|f| f.demangle().ok().map(|s| s.to_string()))
            .unwrap_or_else(|| "<unknown>".to_string());
        let location = frame.location.map(|loc| {
            format!(
                " ({}:{})",
                loc.file.unwrap_or("?"),
                loc.line.map_or_else(|| "?".to_string(), |l| l.to_string())
            )
        });
        Some(format!("0x{addr:x} {function}{}", location.unwrap_or_default()))
    }

    fn resolve_symtab(&self, addr: u64) -> Option<String> {
        let idx = self.symbols.partition_point(|s| s.start <= addr).checked_sub(1)?;
        let sym = &self.symbols[idx];
        if addr >= sym.end {
            return None;
        }
        Some(format!("0x{addr:x} {}+0x{:x}", sym.name, addr - sym.start))
    }
}
