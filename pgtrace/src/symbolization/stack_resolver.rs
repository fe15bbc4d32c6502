//! Stack id -> rendered frame lines.

use anyhow::Result;
use aya::maps::{MapData, StackTraceMap};
use std::borrow::Borrow;

use super::{MemoryRange, Symbolizer};
use crate::domain::StackId;

/// Resolves captured stack ids against the probe-side stack table.
pub struct StackResolver<'a> {
    symbolizer: &'a Symbolizer,
    memory_range: Option<MemoryRange>,
}

impl<'a> StackResolver<'a> {
    pub fn new(symbolizer: &'a Symbolizer, memory_range: Option<MemoryRange>) -> Self {
        Self { symbolizer, memory_range }
    }

    /// Fetch and symbolize one stack. `None` means the id was valid but
    /// the probe-side table no longer holds it (overwritten or full).
    ///
    /// # Errors
    /// Returns an error only for map access failures, not missing stacks.
    pub fn resolve<T: Borrow<MapData>>(
        &self,
        stack_id: StackId,
        stack_traces: &StackTraceMap<T>,
    ) -> Result<Option<Vec<String>>> {
        if !stack_id.is_valid() {
            return Ok(None);
        }
        let Ok(trace) = stack_traces.get(&stack_id.as_map_key(), 0) else {
            return Ok(None);
        };

        let lines = trace
            .frames()
            .iter()
            .map(|frame| {
                let addr = match self.memory_range {
                    Some(range) => range.rebase(frame.ip),
                    None => frame.ip,
                };
                self.symbolizer.resolve(addr)
            })
            .collect();
        Ok(Some(lines))
    }
}
