//! Event rendering: name tables, human and JSON renderers, statistics.

pub mod human;
pub mod json;
pub mod statistics;

pub use statistics::Statistics;

use pgtrace_common::events::{self, Event};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::domain::TracerError;

/// Heavyweight lock mode names, from lockdefs.h. `NoLock` is a flag value,
/// not a mode, but it can surface on probes that pass it through.
#[must_use]
pub fn lock_mode_name(mode: i32) -> &'static str {
    match mode {
        0 => "NoLock",
        1 => "AccessShareLock",
        2 => "RowShareLock",
        3 => "RowExclusiveLock",
        4 => "ShareUpdateExclusiveLock",
        5 => "ShareLock",
        6 => "ShareRowExclusiveLock",
        7 => "ExclusiveLock",
        8 => "AccessExclusiveLock",
        _ => "UnknownLock",
    }
}

/// elog.h severity names for the levels the error probe can emit.
#[must_use]
pub fn severity_name(level: i32) -> &'static str {
    match level {
        21 => "ERROR",
        22 => "FATAL",
        23 => "PANIC",
        _ => "UNKNOWN",
    }
}

#[must_use]
pub fn lw_mode_name(mode: u32) -> &'static str {
    match mode {
        0 => "LW_EXCLUSIVE",
        1 => "LW_SHARED",
        2 => "LW_WAIT_UNTIL_FREE",
        _ => "LW_UNKNOWN",
    }
}

#[must_use]
pub fn tuple_mode_name(mode: u8) -> &'static str {
    match mode {
        0 => "LOCK_TUPLE_KEYSHARE",
        1 => "LOCK_TUPLE_SHARE",
        2 => "LOCK_TUPLE_NOKEYEXCLUSIVE",
        3 => "LOCK_TUPLE_EXCLUSIVE",
        _ => "LOCK_TUPLE_UNKNOWN",
    }
}

#[must_use]
pub fn wait_policy_name(policy: u8) -> &'static str {
    match policy {
        0 => "LOCK_WAIT_BLOCK",
        1 => "LOCK_WAIT_SKIP",
        2 => "LOCK_WAIT_ERROR",
        _ => "LOCK_WAIT_UNKNOWN",
    }
}

#[must_use]
pub fn tm_result_name(result: i32) -> &'static str {
    match result {
        0 => "TM_OK",
        1 => "TM_INVISIBLE",
        2 => "TM_SELFMODIFIED",
        3 => "TM_UPDATED",
        4 => "TM_DELETED",
        5 => "TM_BEINGMODIFIED",
        6 => "TM_WOULDBLOCK",
        _ => "TM_UNKNOWN",
    }
}

/// Wire kind -> stable name, used by the JSON renderer and diagnostics.
#[must_use]
pub fn kind_name(kind: u32) -> &'static str {
    use events as e;
    match kind {
        e::EVENT_TABLE_OPEN => "TABLE_OPEN",
        e::EVENT_TABLE_CLOSE => "TABLE_CLOSE",
        e::EVENT_ERROR => "ERROR",
        e::EVENT_TABLE_OPEN_RV => "TABLE_OPEN_RV",
        e::EVENT_TABLE_OPEN_RV_EXTENDED => "TABLE_OPEN_RV_EXTENDED",
        e::EVENT_QUERY_BEGIN => "QUERY_BEGIN",
        e::EVENT_QUERY_END => "QUERY_END",
        e::EVENT_LOCK_RELATION_OID => "LOCK_RELATION_OID",
        e::EVENT_LOCK_RELATION_OID_END => "LOCK_RELATION_OID_END",
        e::EVENT_UNLOCK_RELATION_OID => "UNLOCK_RELATION_OID",
        e::EVENT_LOCK_GRANTED => "LOCK_GRANTED",
        e::EVENT_LOCK_GRANTED_FASTPATH => "LOCK_GRANTED_FASTPATH",
        e::EVENT_LOCK_GRANTED_LOCAL => "LOCK_GRANTED_LOCAL",
        e::EVENT_LOCK_UNGRANTED => "LOCK_UNGRANTED",
        e::EVENT_LOCK_UNGRANTED_FASTPATH => "LOCK_UNGRANTED_FASTPATH",
        e::EVENT_LOCK_UNGRANTED_LOCAL => "LOCK_UNGRANTED_LOCAL",
        e::EVENT_TRANSACTION_BEGIN => "TRANSACTION_BEGIN",
        e::EVENT_TRANSACTION_COMMIT => "TRANSACTION_COMMIT",
        e::EVENT_TRANSACTION_ABORT => "TRANSACTION_ABORT",
        e::EVENT_INVALIDATION_ACCEPT => "INVALIDATION_ACCEPT",
        e::EVENT_LOCK_TUPLE => "LOCK_TUPLE",
        e::EVENT_LOCK_TUPLE_END => "LOCK_TUPLE_END",
        e::EVENT_LWLOCK_ACQUIRE => "LWLOCK_ACQUIRE",
        e::EVENT_LWLOCK_RELEASE => "LWLOCK_RELEASE",
        e::EVENT_LWLOCK_WAIT_START => "LWLOCK_WAIT_START",
        e::EVENT_LWLOCK_WAIT_DONE => "LWLOCK_WAIT_DONE",
        e::EVENT_LWLOCK_COND_ACQUIRE => "LWLOCK_COND_ACQUIRE",
        e::EVENT_LWLOCK_COND_ACQUIRE_FAIL => "LWLOCK_COND_ACQUIRE_FAIL",
        e::EVENT_LWLOCK_ACQUIRE_OR_WAIT => "LWLOCK_ACQUIRE_OR_WAIT",
        e::EVENT_LWLOCK_ACQUIRE_OR_WAIT_FAIL => "LWLOCK_ACQUIRE_OR_WAIT_FAIL",
        e::EVENT_SPIN_DELAY => "SPIN_DELAY",
        e::EVENT_DEADLOCK => "DEADLOCK",
        _ => "UNKNOWN",
    }
}

/// How the captured stack renders alongside an event.
pub enum StackRender<'a> {
    /// Capture was off for this event.
    None,
    /// An id was captured but the probe-side table had no room.
    Missing,
    Frames(&'a [String]),
}

/// Where rendered lines go. Refuses to clobber an existing output file.
#[derive(Debug)]
pub enum OutputSink {
    Stdout(io::Stdout),
    File(BufWriter<File>),
}

impl OutputSink {
    pub fn stdout() -> Self {
        OutputSink::Stdout(io::stdout())
    }

    pub fn file(path: &Path) -> Result<Self, TracerError> {
        if path.exists() {
            return Err(TracerError::OutputFileExists(path.display().to_string()));
        }
        Ok(OutputSink::File(BufWriter::new(File::create(path)?)))
    }

    pub fn line(&mut self, line: &str) -> io::Result<()> {
        match self {
            OutputSink::Stdout(out) => writeln!(out, "{line}"),
            OutputSink::File(out) => writeln!(out, "{line}"),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Stdout(out) => out.flush(),
            OutputSink::File(out) => out.flush(),
        }
    }
}

/// Render one event into zero or more output lines.
pub fn render_event(
    json: bool,
    event: &Event,
    lock_wait_ns: Option<u64>,
    stack: &StackRender<'_>,
) -> Vec<String> {
    if json {
        vec![json::format_event(event, lock_wait_ns, stack).to_string()]
    } else {
        human::format_event(event, lock_wait_ns, stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_file_must_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.out");

        let mut sink = OutputSink::file(&path).unwrap();
        sink.line("a line").unwrap();
        sink.flush().unwrap();

        let err = OutputSink::file(&path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a line\n");
    }

    #[test]
    fn unknown_enum_values_have_stable_names() {
        assert_eq!(lock_mode_name(99), "UnknownLock");
        assert_eq!(severity_name(1), "UNKNOWN");
        assert_eq!(kind_name(424_242), "UNKNOWN");
    }
}
