//! JSON rendering, one object per line.

use super::{
    kind_name, lock_mode_name, lw_mode_name, severity_name, tm_result_name, tuple_mode_name,
    wait_policy_name, StackRender,
};
use pgtrace_common::events::{self, cstr_field, Event};
use serde_json::{json, Map, Value};

/// Render one event as a JSON object.
#[must_use]
pub fn format_event(event: &Event, lock_wait_ns: Option<u64>, stack: &StackRender<'_>) -> Value {
    let header = event.header();
    let mut map = Map::new();
    map.insert("timestamp".into(), json!(header.timestamp_ns));
    map.insert("pid".into(), json!(header.pid));
    map.insert("event".into(), json!(kind_name(header.kind)));

    match event {
        Event::Lock(lock) => {
            use events as e;
            let lock_kinds = [
                e::EVENT_TABLE_OPEN,
                e::EVENT_TABLE_OPEN_RV,
                e::EVENT_TABLE_OPEN_RV_EXTENDED,
                e::EVENT_TABLE_CLOSE,
                e::EVENT_LOCK_RELATION_OID,
                e::EVENT_UNLOCK_RELATION_OID,
                e::EVENT_LOCK_GRANTED,
                e::EVENT_LOCK_GRANTED_FASTPATH,
                e::EVENT_LOCK_GRANTED_LOCAL,
                e::EVENT_LOCK_UNGRANTED,
                e::EVENT_LOCK_UNGRANTED_FASTPATH,
                e::EVENT_LOCK_UNGRANTED_LOCAL,
            ];
            if lock_kinds.contains(&header.kind) {
                map.insert("lock_type".into(), json!(lock_mode_name(lock.mode)));
            }
            if lock.object != 0 {
                map.insert("oid".into(), json!(lock.object));
            }
            match header.kind {
                e::EVENT_TABLE_OPEN_RV | e::EVENT_TABLE_OPEN_RV_EXTENDED => {
                    map.insert("schema".into(), json!(cstr_field(&lock.payload1)));
                    map.insert("table".into(), json!(cstr_field(&lock.payload2)));
                }
                e::EVENT_ERROR => {
                    map.insert("severity".into(), json!(severity_name(lock.mode)));
                }
                e::EVENT_QUERY_BEGIN => {
                    map.insert("query".into(), json!(cstr_field(&lock.payload1)));
                }
                e::EVENT_LOCK_GRANTED | e::EVENT_LOCK_UNGRANTED => {
                    map.insert("requested".into(), json!(lock.requested));
                }
                e::EVENT_LOCK_GRANTED_LOCAL | e::EVENT_LOCK_UNGRANTED_LOCAL => {
                    map.insert("lock_local_hold".into(), json!(lock.local_hold));
                }
                e::EVENT_LOCK_RELATION_OID_END => {
                    if let Some(ns) = lock_wait_ns {
                        map.insert("lock_time".into(), json!(ns));
                    }
                }
                _ => {}
            }
        }
        Event::RowLock(row) => {
            map.insert("tablespace".into(), json!(row.tablespace));
            map.insert("database".into(), json!(row.database));
            map.insert("relation".into(), json!(row.relation));
            if header.kind == events::EVENT_LOCK_TUPLE {
                map.insert("block".into(), json!(row.block));
                map.insert("offset".into(), json!(row.offset));
                map.insert("lock_mode".into(), json!(tuple_mode_name(row.tuple_mode)));
                map.insert("wait_policy".into(), json!(wait_policy_name(row.wait_policy)));
            } else {
                map.insert("result".into(), json!(tm_result_name(row.result)));
            }
        }
        Event::LwLock(lw) => {
            map.insert("tranche".into(), json!(cstr_field(&lw.tranche)));
            if header.kind != events::EVENT_LWLOCK_RELEASE {
                map.insert("mode".into(), json!(lw_mode_name(lw.mode)));
            }
        }
        Event::SpinDelay(spin) => {
            map.insert("spins".into(), json!(spin.spins));
            map.insert("delays".into(), json!(spin.delays));
            map.insert("cur_delay".into(), json!(spin.cur_delay));
            map.insert("file".into(), json!(cstr_field(&spin.file)));
            map.insert("line".into(), json!(spin.line));
            map.insert("func".into(), json!(cstr_field(&spin.func)));
        }
    }

    match stack {
        StackRender::None => {}
        StackRender::Missing => {
            map.insert("stacktrace".into(), json!("MISSING"));
        }
        StackRender::Frames(frames) => {
            map.insert("stacktrace".into(), json!(frames.join(", ")));
        }
    }

    Value::Object(map)
}
