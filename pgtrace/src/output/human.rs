//! Line-oriented human-readable rendering.

use super::{
    lock_mode_name, lw_mode_name, severity_name, tm_result_name, tuple_mode_name,
    wait_policy_name, StackRender,
};
use pgtrace_common::events::{self, cstr_field, Event, LockEvent};

fn lwlock_phase_verb(kind: u32) -> &'static str {
    match kind {
        events::EVENT_LWLOCK_ACQUIRE => "Acquired",
        events::EVENT_LWLOCK_RELEASE => "Released",
        events::EVENT_LWLOCK_WAIT_START => "Wait for",
        events::EVENT_LWLOCK_WAIT_DONE => "Wait done for",
        events::EVENT_LWLOCK_COND_ACQUIRE => "Conditionally acquired",
        events::EVENT_LWLOCK_COND_ACQUIRE_FAIL => "Failed to conditionally acquire",
        events::EVENT_LWLOCK_ACQUIRE_OR_WAIT => "Acquired or waited for",
        events::EVENT_LWLOCK_ACQUIRE_OR_WAIT_FAIL => "Failed to acquire or wait for",
        _ => "Touched",
    }
}

fn lock_line(prefix: &str, event: &LockEvent, lock_wait_ns: Option<u64>) -> Option<String> {
    use events as e;
    let mode = lock_mode_name(event.mode);
    let oid = event.object;
    let line = match event.header.kind {
        e::EVENT_TABLE_OPEN => format!("{prefix} Table open {oid} {mode}"),
        e::EVENT_TABLE_OPEN_RV | e::EVENT_TABLE_OPEN_RV_EXTENDED => {
            let schema = cstr_field(&event.payload1);
            let table = cstr_field(&event.payload2);
            format!("{prefix} Table open {schema}.{table} {mode}")
        }
        e::EVENT_TABLE_CLOSE => format!("{prefix} Table close {oid} {mode}"),
        e::EVENT_LOCK_RELATION_OID => format!("{prefix} Lock object {oid} {mode}"),
        e::EVENT_LOCK_RELATION_OID_END => match lock_wait_ns {
            Some(ns) => format!("{prefix} Lock was acquired in {ns} ns"),
            None => format!("{prefix} Lock was acquired"),
        },
        e::EVENT_UNLOCK_RELATION_OID => format!("{prefix} Unlock relation {oid} {mode}"),
        e::EVENT_LOCK_GRANTED => {
            format!("{prefix} Lock granted {oid} {mode} (Requested locks {})", event.requested)
        }
        e::EVENT_LOCK_GRANTED_FASTPATH => {
            format!("{prefix} Lock granted (fastpath) {oid} {mode}")
        }
        e::EVENT_LOCK_GRANTED_LOCAL => format!(
            "{prefix} Lock granted (local) {oid} {mode} (Already hold local {})",
            event.local_hold
        ),
        e::EVENT_LOCK_UNGRANTED => {
            format!("{prefix} Lock ungranted {oid} {mode} (Requested locks {})", event.requested)
        }
        e::EVENT_LOCK_UNGRANTED_FASTPATH => {
            format!("{prefix} Lock ungranted (fastpath) {oid} {mode}")
        }
        e::EVENT_LOCK_UNGRANTED_LOCAL => format!(
            "{prefix} Lock ungranted (local) {oid} {mode} (Hold local {})",
            event.local_hold
        ),
        e::EVENT_ERROR => {
            format!("{prefix} Error occurred severity: {}", severity_name(event.mode))
        }
        e::EVENT_QUERY_BEGIN => {
            format!("{prefix} Query begin '{}'", cstr_field(&event.payload1))
        }
        e::EVENT_QUERY_END => format!("{prefix} Query done\n"),
        e::EVENT_TRANSACTION_BEGIN => format!("{prefix} Transaction begin"),
        e::EVENT_TRANSACTION_COMMIT => format!("{prefix} Transaction commit"),
        e::EVENT_TRANSACTION_ABORT => format!("{prefix} Transaction abort"),
        e::EVENT_INVALIDATION_ACCEPT => format!("{prefix} Invalidation messages accepted"),
        e::EVENT_DEADLOCK => format!("{prefix} DEADLOCK DETECTED"),
        _ => return None,
    };
    Some(line)
}

/// Render one event into output lines (the event line plus any stack
/// frames). Unknown kinds render nothing.
#[must_use]
pub fn format_event(
    event: &Event,
    lock_wait_ns: Option<u64>,
    stack: &StackRender<'_>,
) -> Vec<String> {
    let header = event.header();
    let prefix = format!("{} [Pid {}]", header.timestamp_ns, header.pid);

    let line = match event {
        Event::Lock(lock) => lock_line(&prefix, lock, lock_wait_ns),
        Event::RowLock(row) => Some(match header.kind {
            events::EVENT_LOCK_TUPLE => format!(
                "{prefix} Row lock {}/{}/{} block {} offset {} {} {}",
                row.tablespace,
                row.database,
                row.relation,
                row.block,
                row.offset,
                tuple_mode_name(row.tuple_mode),
                wait_policy_name(row.wait_policy),
            ),
            _ => format!("{prefix} Row lock result {}", tm_result_name(row.result)),
        }),
        Event::LwLock(lw) => {
            let verb = lwlock_phase_verb(header.kind);
            let tranche = cstr_field(&lw.tranche);
            Some(if header.kind == events::EVENT_LWLOCK_RELEASE {
                format!("{prefix} {verb} {tranche}")
            } else {
                format!("{prefix} {verb} {tranche} / mode {}", lw_mode_name(lw.mode))
            })
        }
        Event::SpinDelay(spin) => Some(format!(
            "{prefix} Spin delay {} spins {} delays (cur delay {} us) at {}:{} in {}",
            spin.spins,
            spin.delays,
            spin.cur_delay,
            cstr_field(&spin.file),
            spin.line,
            cstr_field(&spin.func),
        )),
    };

    let Some(line) = line else { return Vec::new() };
    let mut lines = vec![line];
    match stack {
        StackRender::None => {}
        StackRender::Missing => lines.push(
            "\tError stack is missing. Try to increase the stack trace map size.".to_string(),
        ),
        StackRender::Frames(frames) => {
            lines.extend(frames.iter().map(|f| format!("\t{f}")));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgtrace_common::events::{
        EventHeader, RowLockEvent, EVENT_LOCK_GRANTED_LOCAL, EVENT_LOCK_TUPLE,
    };

    fn header(kind: u32) -> EventHeader {
        EventHeader { pid: 77, timestamp_ns: 123456, kind }
    }

    #[test]
    fn local_grant_line_includes_hold_count() {
        let mut event = LockEvent::new(header(EVENT_LOCK_GRANTED_LOCAL));
        event.object = 16384;
        event.mode = 1;
        event.local_hold = 3;
        let lines = format_event(&Event::Lock(event), None, &StackRender::None);
        assert_eq!(
            lines,
            vec![
                "123456 [Pid 77] Lock granted (local) 16384 AccessShareLock (Already hold local 3)"
            ]
        );
    }

    #[test]
    fn row_lock_line_names_mode_and_policy() {
        let mut event = RowLockEvent::new(header(EVENT_LOCK_TUPLE));
        event.tablespace = 1663;
        event.database = 5;
        event.relation = 16384;
        event.block = 0x0001_0002;
        event.offset = 4;
        event.tuple_mode = 3;
        event.wait_policy = 1;
        let lines = format_event(&Event::RowLock(event), None, &StackRender::None);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("1663/5/16384"));
        assert!(lines[0].contains("block 65538"));
        assert!(lines[0].contains("LOCK_TUPLE_EXCLUSIVE"));
        assert!(lines[0].contains("LOCK_WAIT_SKIP"));
    }

    #[test]
    fn stack_frames_render_indented() {
        let event = LockEvent::new(header(pgtrace_common::events::EVENT_DEADLOCK));
        let frames = vec!["0x1234 WaitOnLock+0x40".to_string()];
        let lines =
            format_event(&Event::Lock(event), None, &StackRender::Frames(&frames));
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with('\t'));
    }
}
