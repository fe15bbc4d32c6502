//! Wire event records and event-kind constants.
//!
//! Every record starts with the same [`EventHeader`] so userspace can route
//! on the kind without knowing the family up front. All types are
//! `#[repr(C)]` and fixed-size; bounded string fields are byte arrays that
//! are always NUL-terminated within their capacity.
//!
//! Kind numbering is part of the wire contract: values at or above
//! [`GLOBAL_EVENT_THRESHOLD`] bypass the userspace pid filter (a deadlock
//! report is interesting no matter which backend raised it).

/// Capacity of the generic payload strings (schema, relation, query text).
pub const PAYLOAD_STR_CAP: usize = 127;

/// Capacity of a lightweight-lock tranche name.
pub const TRANCHE_NAME_CAP: usize = 255;

/// Capacity of the spin-delay source file / function names.
pub const SRC_NAME_CAP: usize = 128;

// ============================================================================
// Event kinds
// ============================================================================

pub const EVENT_TABLE_OPEN: u32 = 0;
pub const EVENT_TABLE_CLOSE: u32 = 1;
pub const EVENT_ERROR: u32 = 2;
pub const EVENT_TABLE_OPEN_RV: u32 = 3;
pub const EVENT_TABLE_OPEN_RV_EXTENDED: u32 = 4;

pub const EVENT_QUERY_BEGIN: u32 = 20;
pub const EVENT_QUERY_END: u32 = 21;

pub const EVENT_LOCK_RELATION_OID: u32 = 30;
pub const EVENT_LOCK_RELATION_OID_END: u32 = 31;
pub const EVENT_UNLOCK_RELATION_OID: u32 = 32;
pub const EVENT_LOCK_GRANTED: u32 = 33;
pub const EVENT_LOCK_GRANTED_FASTPATH: u32 = 34;
pub const EVENT_LOCK_GRANTED_LOCAL: u32 = 35;
pub const EVENT_LOCK_UNGRANTED: u32 = 36;
pub const EVENT_LOCK_UNGRANTED_FASTPATH: u32 = 37;
pub const EVENT_LOCK_UNGRANTED_LOCAL: u32 = 38;

pub const EVENT_TRANSACTION_BEGIN: u32 = 40;
pub const EVENT_TRANSACTION_COMMIT: u32 = 41;
pub const EVENT_TRANSACTION_ABORT: u32 = 42;
pub const EVENT_INVALIDATION_ACCEPT: u32 = 43;

pub const EVENT_LOCK_TUPLE: u32 = 50;
pub const EVENT_LOCK_TUPLE_END: u32 = 51;

pub const EVENT_LWLOCK_ACQUIRE: u32 = 60;
pub const EVENT_LWLOCK_RELEASE: u32 = 61;
pub const EVENT_LWLOCK_WAIT_START: u32 = 62;
pub const EVENT_LWLOCK_WAIT_DONE: u32 = 63;
pub const EVENT_LWLOCK_COND_ACQUIRE: u32 = 64;
pub const EVENT_LWLOCK_COND_ACQUIRE_FAIL: u32 = 65;
pub const EVENT_LWLOCK_ACQUIRE_OR_WAIT: u32 = 66;
pub const EVENT_LWLOCK_ACQUIRE_OR_WAIT_FAIL: u32 = 67;

pub const EVENT_SPIN_DELAY: u32 = 70;

/// Kinds at or above this value are emitted regardless of any pid filter.
pub const GLOBAL_EVENT_THRESHOLD: u32 = 1000;

pub const EVENT_DEADLOCK: u32 = 1001;

/// Default severity floor for [`EVENT_ERROR`]: `ERROR` from elog.h.
/// (`FATAL` = 22, `PANIC` = 23.)
pub const DEFAULT_ERROR_THRESHOLD: i32 = 21;

// ============================================================================
// Records
// ============================================================================

/// Common header carried by every record.
///
/// `timestamp_ns` comes from `bpf_ktime_get_ns()` (monotonic, relative to
/// boot) and is never zero on an emitted event; `pid` is the tgid of the
/// backend the probe fired in.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventHeader {
    pub pid: u32,
    pub timestamp_ns: u64,
    pub kind: u32,
}

/// Heavyweight-lock family record.
///
/// One record type covers the table, query, error, relation-lock, grant,
/// transaction, invalidation and deadlock kinds; unused fields stay zero.
///
/// - `object`: relation OID (`Oid` is a `u32`); zero doubles as the
///   decode-failure sentinel
/// - `mode`: `LOCKMODE` for lock kinds, severity level for [`EVENT_ERROR`]
/// - `requested`: the shared lock manager's pending request count
/// - `local_hold`: signed per-backend hold count from the local lock table
/// - `payload1`/`payload2`: schema + relation name, or query text
/// - `stack_id`: stack-trace map id, 0 when capture is off, negative on a
///   failed capture
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LockEvent {
    pub header: EventHeader,
    pub object: u32,
    pub mode: i32,
    pub requested: u32,
    pub local_hold: i64,
    pub payload1: [u8; PAYLOAD_STR_CAP],
    pub payload2: [u8; PAYLOAD_STR_CAP],
    pub stack_id: i32,
}

impl LockEvent {
    #[must_use]
    pub fn new(header: EventHeader) -> Self {
        Self {
            header,
            object: 0,
            mode: 0,
            requested: 0,
            local_hold: 0,
            payload1: [0; PAYLOAD_STR_CAP],
            payload2: [0; PAYLOAD_STR_CAP],
            stack_id: 0,
        }
    }
}

/// Row-level (tuple) lock record.
///
/// The relation identity is the `RelFileLocator` triple; `block` is
/// reconstructed from the on-disk `BlockIdData` halves as
/// `hi << 16 | lo`. `result` is the `TM_Result` of the call, captured by
/// the paired return probe.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowLockEvent {
    pub header: EventHeader,
    pub tablespace: u32,
    pub database: u32,
    pub relation: u32,
    pub tuple_mode: u8,
    pub wait_policy: u8,
    pub offset: u16,
    pub block: u32,
    pub result: i32,
}

impl RowLockEvent {
    #[must_use]
    pub fn new(header: EventHeader) -> Self {
        Self {
            header,
            tablespace: 0,
            database: 0,
            relation: 0,
            tuple_mode: 0,
            wait_policy: 0,
            offset: 0,
            block: 0,
            result: 0,
        }
    }
}

/// Lightweight-lock record: tranche name plus `LWLockMode`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LwLockEvent {
    pub header: EventHeader,
    pub tranche: [u8; TRANCHE_NAME_CAP],
    pub mode: u32,
}

impl LwLockEvent {
    #[must_use]
    pub fn new(header: EventHeader) -> Self {
        Self { header, tranche: [0; TRANCHE_NAME_CAP], mode: 0 }
    }
}

/// Spin-delay sample decoded from a `SpinDelayStatus`.
///
/// Emitted even when the status pointer is NULL — the payload is then all
/// zeroes and only the header carries information.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SpinDelayEvent {
    pub header: EventHeader,
    pub spins: i32,
    pub delays: i32,
    pub cur_delay: i32,
    pub line: i32,
    pub file: [u8; SRC_NAME_CAP],
    pub func: [u8; SRC_NAME_CAP],
}

impl SpinDelayEvent {
    #[must_use]
    pub fn new(header: EventHeader) -> Self {
        Self {
            header,
            spins: 0,
            delays: 0,
            cur_delay: 0,
            line: 0,
            file: [0; SRC_NAME_CAP],
            func: [0; SRC_NAME_CAP],
        }
    }
}

// ============================================================================
// Parsing (collaborator side)
// ============================================================================

/// A record parsed back out of the raw channel bytes.
#[derive(Clone, Copy)]
pub enum Event {
    Lock(LockEvent),
    RowLock(RowLockEvent),
    LwLock(LwLockEvent),
    SpinDelay(SpinDelayEvent),
}

impl Event {
    #[must_use]
    pub fn header(&self) -> EventHeader {
        match self {
            Event::Lock(e) => e.header,
            Event::RowLock(e) => e.header,
            Event::LwLock(e) => e.header,
            Event::SpinDelay(e) => e.header,
        }
    }
}

/// Byte offset of `kind` within [`EventHeader`] (`pid` + alignment padding
/// + `timestamp_ns` precede it).
const KIND_OFFSET: usize = 16;

fn read_kind(bytes: &[u8]) -> Option<u32> {
    let raw = bytes.get(KIND_OFFSET..KIND_OFFSET + 4)?;
    Some(u32::from_ne_bytes(raw.try_into().ok()?))
}

// Reading a #[repr(C)] record back out of the byte stream it was written
// from. Size is checked; the source bytes came from the same build of this
// crate on the other side of the channel.
#[allow(unsafe_code)]
fn read_record<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < core::mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

/// Parse one channel record. Returns `None` for a truncated buffer or an
/// unknown kind — the drain loop skips such records rather than failing.
#[must_use]
pub fn parse(bytes: &[u8]) -> Option<Event> {
    let kind = read_kind(bytes)?;
    match kind {
        EVENT_LOCK_TUPLE | EVENT_LOCK_TUPLE_END => read_record(bytes).map(Event::RowLock),
        EVENT_LWLOCK_ACQUIRE..=EVENT_LWLOCK_ACQUIRE_OR_WAIT_FAIL => {
            read_record(bytes).map(Event::LwLock)
        }
        EVENT_SPIN_DELAY => read_record(bytes).map(Event::SpinDelay),
        EVENT_TABLE_OPEN..=EVENT_TABLE_OPEN_RV_EXTENDED
        | EVENT_QUERY_BEGIN
        | EVENT_QUERY_END
        | EVENT_LOCK_RELATION_OID..=EVENT_LOCK_UNGRANTED_LOCAL
        | EVENT_TRANSACTION_BEGIN..=EVENT_INVALIDATION_ACCEPT
        | EVENT_DEADLOCK => read_record(bytes).map(Event::Lock),
        _ => None,
    }
}

/// Decode a NUL-terminated bounded string field.
#[must_use]
pub fn cstr_field(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

#[cfg(feature = "user")]
mod user {
    use super::{LockEvent, LwLockEvent, RowLockEvent, SpinDelayEvent};
    use crate::layout::LayoutDescriptor;
    use aya::Pod;

    // These unsafe impls are required for eBPF <-> userspace communication.
    // Pod trait ensures types can be safely transmitted as plain bytes.
    #[allow(unsafe_code)]
    unsafe impl Pod for LockEvent {}

    #[allow(unsafe_code)]
    unsafe impl Pod for RowLockEvent {}

    #[allow(unsafe_code)]
    unsafe impl Pod for LwLockEvent {}

    #[allow(unsafe_code)]
    unsafe impl Pod for SpinDelayEvent {}

    #[allow(unsafe_code)]
    unsafe impl Pod for LayoutDescriptor {}
}
