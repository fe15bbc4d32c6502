//! Lock statistics, printed at exit with `--statistics`.
//!
//! Relation lock latency pairs `LOCK_RELATION_OID` with its return event
//! per pid; a missing partner simply produces no latency sample.

use pgtrace_common::events::{self, Event};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use super::{lock_mode_name, tm_result_name, tuple_mode_name, wait_policy_name};

#[derive(Default)]
struct RelationEntry {
    lock_count: u64,
    total_wait_ns: u64,
}

#[derive(Serialize)]
pub struct RelationSummary {
    pub oid: u32,
    pub requests: u64,
    pub total_wait_ns: u64,
}

/// Machine-readable statistics summary.
#[derive(Serialize)]
pub struct StatisticsSummary {
    pub relations: Vec<RelationSummary>,
    pub lock_modes: BTreeMap<String, u64>,
    pub row_lock_results: BTreeMap<String, u64>,
}

/// Aggregated per-run counters.
#[derive(Default)]
pub struct Statistics {
    relations: HashMap<u32, RelationEntry>,
    /// Requested lock counts per heavyweight mode.
    modes: BTreeMap<i32, u64>,
    /// pid -> (request timestamp, oid) of the lock acquisition in flight.
    pending_lock: HashMap<u32, (u64, u32)>,
    row_modes: BTreeMap<u8, u64>,
    row_policies: BTreeMap<u8, u64>,
    row_results: BTreeMap<i32, u64>,
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one event. Returns the lock acquisition latency when the
    /// event completes a `LOCK_RELATION_OID` pair.
    pub fn observe(&mut self, event: &Event) -> Option<u64> {
        match event {
            Event::Lock(lock) => match lock.header.kind {
                events::EVENT_LOCK_RELATION_OID => {
                    let entry = self.relations.entry(lock.object).or_default();
                    entry.lock_count += 1;
                    *self.modes.entry(lock.mode).or_default() += 1;
                    self.pending_lock
                        .insert(lock.header.pid, (lock.header.timestamp_ns, lock.object));
                    None
                }
                events::EVENT_LOCK_RELATION_OID_END => {
                    let (started, oid) = self.pending_lock.remove(&lock.header.pid)?;
                    let wait = lock.header.timestamp_ns.saturating_sub(started);
                    self.relations.entry(oid).or_default().total_wait_ns += wait;
                    Some(wait)
                }
                _ => None,
            },
            Event::RowLock(row) => {
                match row.header.kind {
                    events::EVENT_LOCK_TUPLE => {
                        *self.row_modes.entry(row.tuple_mode).or_default() += 1;
                        *self.row_policies.entry(row.wait_policy).or_default() += 1;
                    }
                    _ => {
                        *self.row_results.entry(row.result).or_default() += 1;
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// The summary in a machine-readable shape, for `--json --statistics`.
    #[must_use]
    pub fn summary(&self) -> StatisticsSummary {
        let mut relations: Vec<RelationSummary> = self
            .relations
            .iter()
            .map(|(oid, entry)| RelationSummary {
                oid: *oid,
                requests: entry.lock_count,
                total_wait_ns: entry.total_wait_ns,
            })
            .collect();
        relations.sort_by(|a, b| b.requests.cmp(&a.requests).then(a.oid.cmp(&b.oid)));
        StatisticsSummary {
            relations,
            lock_modes: self
                .modes
                .iter()
                .map(|(mode, count)| (lock_mode_name(*mode).to_string(), *count))
                .collect(),
            row_lock_results: self
                .row_results
                .iter()
                .map(|(result, count)| (tm_result_name(*result).to_string(), *count))
                .collect(),
        }
    }

    /// Render the statistics tables. Empty sections are skipped.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("\nLock statistics:\n================\n");

        if !self.relations.is_empty() {
            let _ = writeln!(out, "\nLocks per OID");
            let _ = writeln!(out, "{:>10}  {:>10}  {:>24}", "OID", "Requests", "Total wait (ns)");
            let mut rows: Vec<_> = self.relations.iter().collect();
            rows.sort_by(|a, b| b.1.lock_count.cmp(&a.1.lock_count));
            for (oid, entry) in rows {
                let _ = writeln!(
                    out,
                    "{:>10}  {:>10}  {:>24}",
                    oid, entry.lock_count, entry.total_wait_ns
                );
            }
        }

        if !self.modes.is_empty() {
            let _ = writeln!(out, "\nLock types");
            let _ = writeln!(out, "{:<28}  {:>10}", "Lock", "Requests");
            for (mode, count) in &self.modes {
                let _ = writeln!(out, "{:<28}  {:>10}", lock_mode_name(*mode), count);
            }
        }

        if !self.row_modes.is_empty() || !self.row_results.is_empty() {
            let _ = writeln!(out, "\nRow locks");
            for (mode, count) in &self.row_modes {
                let _ = writeln!(out, "{:<28}  {:>10}", tuple_mode_name(*mode), count);
            }
            for (policy, count) in &self.row_policies {
                let _ = writeln!(out, "{:<28}  {:>10}", wait_policy_name(*policy), count);
            }
            for (result, count) in &self.row_results {
                let _ = writeln!(out, "{:<28}  {:>10}", tm_result_name(*result), count);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgtrace_common::events::{
        EventHeader, LockEvent, RowLockEvent, EVENT_LOCK_RELATION_OID,
        EVENT_LOCK_RELATION_OID_END, EVENT_LOCK_TUPLE, EVENT_LOCK_TUPLE_END,
    };

    fn lock_event(pid: u32, ts: u64, kind: u32, oid: u32, mode: i32) -> Event {
        let mut event = LockEvent::new(EventHeader { pid, timestamp_ns: ts, kind });
        event.object = oid;
        event.mode = mode;
        Event::Lock(event)
    }

    #[test]
    fn lock_latency_pairs_per_pid() {
        let mut stats = Statistics::new();
        assert_eq!(stats.observe(&lock_event(1, 100, EVENT_LOCK_RELATION_OID, 42, 1)), None);
        // Another backend's request does not disturb pid 1's pairing.
        assert_eq!(stats.observe(&lock_event(2, 150, EVENT_LOCK_RELATION_OID, 42, 1)), None);
        assert_eq!(
            stats.observe(&lock_event(1, 300, EVENT_LOCK_RELATION_OID_END, 0, 0)),
            Some(200)
        );
        // No pending request -> no latency sample.
        assert_eq!(stats.observe(&lock_event(1, 400, EVENT_LOCK_RELATION_OID_END, 0, 0)), None);

        let rendered = stats.render();
        assert!(rendered.contains("42"));
        assert!(rendered.contains("AccessShareLock"));

        let summary = stats.summary();
        assert_eq!(summary.relations.len(), 1);
        assert_eq!(summary.relations[0].oid, 42);
        assert_eq!(summary.relations[0].requests, 2);
        assert_eq!(summary.relations[0].total_wait_ns, 200);
        assert_eq!(summary.lock_modes.get("AccessShareLock"), Some(&2));
    }

    #[test]
    fn row_lock_counters_accumulate() {
        let mut stats = Statistics::new();
        let mut row = RowLockEvent::new(EventHeader {
            pid: 1,
            timestamp_ns: 10,
            kind: EVENT_LOCK_TUPLE,
        });
        row.tuple_mode = 3;
        row.wait_policy = 0;
        stats.observe(&Event::RowLock(row));

        let mut end = RowLockEvent::new(EventHeader {
            pid: 1,
            timestamp_ns: 20,
            kind: EVENT_LOCK_TUPLE_END,
        });
        end.result = 6;
        stats.observe(&Event::RowLock(end));

        let rendered = stats.render();
        assert!(rendered.contains("LOCK_TUPLE_EXCLUSIVE"));
        assert!(rendered.contains("LOCK_WAIT_BLOCK"));
        assert!(rendered.contains("TM_WOULDBLOCK"));
    }
}
