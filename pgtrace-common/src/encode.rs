//! Per-probe event encoders.
//!
//! Each method turns one firing instrumentation point into at most one
//! fixed-size record: header fields from the call site, entity fields
//! through the layout descriptor and bounded memory reads, then a
//! non-blocking publish. A failed read zeroes the field it was for and the
//! rest of the record still decodes — the channel only ever sees a fully
//! formed record or nothing.
//!
//! Suppression on an all-zero lock identity is a per-probe policy, not a
//! blanket rule: `grant_lock`, `grant_local` and `ungrant_local` drop the
//! record (a zero OID there means the structure read failed or the record
//! was being torn down), while `ungrant_lock` and `fastpath_ungrant` always
//! emit. Keep it that way; the asymmetry is load-bearing for consumers
//! that pair grants with ungrants.

use crate::abi::{argument, AbiProfile, CallSite};
use crate::events::{
    EventHeader, LockEvent, LwLockEvent, RowLockEvent, SpinDelayEvent, EVENT_DEADLOCK,
    EVENT_ERROR, EVENT_INVALIDATION_ACCEPT, EVENT_LOCK_GRANTED, EVENT_LOCK_GRANTED_FASTPATH,
    EVENT_LOCK_GRANTED_LOCAL, EVENT_LOCK_RELATION_OID, EVENT_LOCK_RELATION_OID_END,
    EVENT_LOCK_TUPLE, EVENT_LOCK_TUPLE_END, EVENT_LOCK_UNGRANTED, EVENT_LOCK_UNGRANTED_FASTPATH,
    EVENT_LOCK_UNGRANTED_LOCAL, EVENT_LWLOCK_ACQUIRE, EVENT_LWLOCK_ACQUIRE_OR_WAIT,
    EVENT_LWLOCK_ACQUIRE_OR_WAIT_FAIL, EVENT_LWLOCK_COND_ACQUIRE,
    EVENT_LWLOCK_COND_ACQUIRE_FAIL, EVENT_LWLOCK_RELEASE, EVENT_LWLOCK_WAIT_DONE,
    EVENT_LWLOCK_WAIT_START, EVENT_QUERY_BEGIN, EVENT_QUERY_END, EVENT_TABLE_CLOSE,
    EVENT_TABLE_OPEN, EVENT_TABLE_OPEN_RV, EVENT_TABLE_OPEN_RV_EXTENDED,
    EVENT_TRANSACTION_ABORT, EVENT_TRANSACTION_BEGIN, EVENT_TRANSACTION_COMMIT,
    EVENT_UNLOCK_RELATION_OID,
};
use crate::layout::LayoutDescriptor;
use crate::mem::{read_cstr_or_empty, MemoryReader, StructImage};
use crate::sink::EventSink;
use crate::stacks::{StackCapture, StackSite};

// Snapshot capacities per entity; the layout descriptor's image_len is
// clamped to these. Sized to the largest audited layout with headroom for
// a field drifting outward a few words.
const LOCK_IMAGE_CAP: usize = 128;
const LOCAL_LOCK_IMAGE_CAP: usize = 64;
const RELATION_IMAGE_CAP: usize = 96;
const RANGE_VAR_IMAGE_CAP: usize = 40;
const REL_FILE_IMAGE_CAP: usize = 16;
const ITEM_POINTER_IMAGE_CAP: usize = 8;
const SPIN_STATUS_IMAGE_CAP: usize = 48;

/// The eight lightweight-lock tracepoint phases. All share one decode
/// routine; they differ only in the emitted kind and in whether the
/// tracepoint passes a mode after the tranche name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LwLockPhase {
    Acquire,
    Release,
    WaitStart,
    WaitDone,
    CondAcquire,
    CondAcquireFail,
    AcquireOrWait,
    AcquireOrWaitFail,
}

impl LwLockPhase {
    #[must_use]
    pub fn event_kind(self) -> u32 {
        match self {
            LwLockPhase::Acquire => EVENT_LWLOCK_ACQUIRE,
            LwLockPhase::Release => EVENT_LWLOCK_RELEASE,
            LwLockPhase::WaitStart => EVENT_LWLOCK_WAIT_START,
            LwLockPhase::WaitDone => EVENT_LWLOCK_WAIT_DONE,
            LwLockPhase::CondAcquire => EVENT_LWLOCK_COND_ACQUIRE,
            LwLockPhase::CondAcquireFail => EVENT_LWLOCK_COND_ACQUIRE_FAIL,
            LwLockPhase::AcquireOrWait => EVENT_LWLOCK_ACQUIRE_OR_WAIT,
            LwLockPhase::AcquireOrWaitFail => EVENT_LWLOCK_ACQUIRE_OR_WAIT_FAIL,
        }
    }

    /// Release passes only the tranche name; every other phase also passes
    /// the requested mode.
    #[must_use]
    pub fn argument_count(self) -> usize {
        match self {
            LwLockPhase::Release => 1,
            _ => 2,
        }
    }
}

/// One firing's decode context. Constructed per invocation, nothing here
/// outlives the handler.
pub struct EventEncoder<'a, C, M, K, S> {
    call: &'a C,
    mem: &'a M,
    abi: &'a AbiProfile,
    layout: &'a LayoutDescriptor,
    stacks: &'a K,
    sink: &'a S,
}

impl<'a, C, M, K, S> EventEncoder<'a, C, M, K, S>
where
    C: CallSite,
    M: MemoryReader,
    K: StackCapture,
    S: EventSink,
{
    pub fn new(
        call: &'a C,
        mem: &'a M,
        abi: &'a AbiProfile,
        layout: &'a LayoutDescriptor,
        stacks: &'a K,
        sink: &'a S,
    ) -> Self {
        Self { call, mem, abi, layout, stacks, sink }
    }

    fn header(&self, kind: u32) -> EventHeader {
        EventHeader {
            pid: self.call.process_id(),
            timestamp_ns: self.call.timestamp_ns(),
            kind,
        }
    }

    /// Logical argument `n`, zero on a faulted stack read.
    fn arg(&self, n: usize) -> u64 {
        argument(self.call, self.mem, self.abi, n).unwrap_or(0)
    }

    fn publish<R: crate::sink::Record>(&self, record: &R) {
        // Best effort by design: a saturated channel drops the record and
        // the observed process never notices.
        let _ = self.sink.publish(record);
    }

    // ========================================================================
    // Table / relation family
    // ========================================================================

    /// `table_open(Oid relationId, LOCKMODE lockmode)`
    pub fn table_open(&self) {
        let mut event = LockEvent::new(self.header(EVENT_TABLE_OPEN));
        event.object = self.arg(1) as u32;
        event.mode = self.arg(2) as i32;
        self.publish(&event);
    }

    /// `table_openrv(const RangeVar *relation, LOCKMODE lockmode)` and the
    /// `_extended` variant (its extra `missing_ok` flag is not decoded).
    /// The identity arrives as schema + relation name strings behind the
    /// range variable.
    pub fn table_open_rv(&self, extended: bool) {
        let kind = if extended { EVENT_TABLE_OPEN_RV_EXTENDED } else { EVENT_TABLE_OPEN_RV };
        let mut event = LockEvent::new(self.header(kind));

        let rv = self.layout.range_var;
        let image = StructImage::<RANGE_VAR_IMAGE_CAP>::read_from(self.mem, self.arg(1), rv.image_len)
            .unwrap_or_else(|_| StructImage::zeroed());
        read_cstr_or_empty(self.mem, image.ptr_at(rv.schema_name), &mut event.payload1);
        read_cstr_or_empty(self.mem, image.ptr_at(rv.rel_name), &mut event.payload2);
        event.mode = self.arg(2) as i32;
        self.publish(&event);
    }

    /// `table_close(Relation relation, LOCKMODE lockmode)` — the OID sits
    /// at a fixed offset inside the opened-relation structure.
    pub fn table_close(&self) {
        let mut event = LockEvent::new(self.header(EVENT_TABLE_CLOSE));
        let rel = self.layout.relation;
        let image = StructImage::<RELATION_IMAGE_CAP>::read_from(self.mem, self.arg(1), rel.image_len)
            .unwrap_or_else(|_| StructImage::zeroed());
        event.object = image.u32_at(rel.id);
        event.mode = self.arg(2) as i32;
        self.publish(&event);
    }

    // ========================================================================
    // Query / error family
    // ========================================================================

    /// `exec_simple_query(const char *query_string)` entry.
    pub fn query_begin(&self) {
        let mut event = LockEvent::new(self.header(EVENT_QUERY_BEGIN));
        read_cstr_or_empty(self.mem, self.arg(1), &mut event.payload1);
        self.publish(&event);
    }

    /// `exec_simple_query` return.
    pub fn query_end(&self) {
        self.publish(&LockEvent::new(self.header(EVENT_QUERY_END)));
    }

    /// `errstart(int elevel, ...)` — suppressed below the severity floor.
    pub fn error_raised(&self, threshold: i32) {
        let mut event = LockEvent::new(self.header(EVENT_ERROR));
        event.mode = self.arg(1) as i32;
        if event.mode >= threshold {
            self.publish(&event);
        }
    }

    // ========================================================================
    // Heavyweight lock family
    // ========================================================================

    /// `LockRelationOid(Oid relid, LOCKMODE lockmode)` entry.
    pub fn lock_relation_oid(&self) {
        let mut event = LockEvent::new(self.header(EVENT_LOCK_RELATION_OID));
        event.object = self.arg(1) as u32;
        event.mode = self.arg(2) as i32;
        event.stack_id = self.stacks.capture(StackSite::Acquire);
        self.publish(&event);
    }

    /// `LockRelationOid` return — pairs with the entry event for latency.
    pub fn lock_relation_oid_end(&self) {
        self.publish(&LockEvent::new(self.header(EVENT_LOCK_RELATION_OID_END)));
    }

    /// `UnlockRelationOid(Oid relid, LOCKMODE lockmode)`.
    pub fn unlock_relation_oid(&self) {
        let mut event = LockEvent::new(self.header(EVENT_UNLOCK_RELATION_OID));
        event.object = self.arg(1) as u32;
        event.mode = self.arg(2) as i32;
        self.publish(&event);
    }

    /// Decode identity + requested count out of a shared `LOCK` record.
    fn lock_record_fields(&self, addr: u64, event: &mut LockEvent) {
        let lock = self.layout.lock;
        let image = StructImage::<LOCK_IMAGE_CAP>::read_from(self.mem, addr, lock.image_len)
            .unwrap_or_else(|_| StructImage::zeroed());
        event.object = image.u32_at(lock.identity);
        event.requested = image.u32_at(lock.requested_count);
    }

    /// Decode identity, mode and hold count out of a `LOCALLOCK` record.
    fn local_lock_record_fields(&self, addr: u64, event: &mut LockEvent) {
        let local = self.layout.local_lock;
        let image = StructImage::<LOCAL_LOCK_IMAGE_CAP>::read_from(self.mem, addr, local.image_len)
            .unwrap_or_else(|_| StructImage::zeroed());
        event.object = image.u32_at(local.identity);
        event.mode = image.i32_at(local.mode);
        event.local_hold = image.i64_at(local.hold_count);
    }

    /// `GrantLock(LOCK *lock, PROCLOCK *proclock, LOCKMODE lockmode)`.
    /// Zero identity suppresses the event.
    pub fn grant_lock(&self) {
        let mut event = LockEvent::new(self.header(EVENT_LOCK_GRANTED));
        event.mode = self.arg(3) as i32;
        self.lock_record_fields(self.arg(1), &mut event);
        if event.object != 0 {
            self.publish(&event);
        }
    }

    /// `FastPathGrantRelationLock(Oid relid, LOCKMODE lockmode)` — identity
    /// comes straight from the arguments, so it is emitted unconditionally.
    pub fn fastpath_grant(&self) {
        let mut event = LockEvent::new(self.header(EVENT_LOCK_GRANTED_FASTPATH));
        event.object = self.arg(1) as u32;
        event.mode = self.arg(2) as i32;
        self.publish(&event);
    }

    /// `GrantLockLocal(LOCALLOCK *locallock, ResourceOwner owner)`.
    /// Zero identity suppresses the event.
    pub fn grant_local(&self) {
        let mut event = LockEvent::new(self.header(EVENT_LOCK_GRANTED_LOCAL));
        self.local_lock_record_fields(self.arg(1), &mut event);
        if event.object != 0 {
            self.publish(&event);
        }
    }

    /// `UnGrantLock(LOCK *lock, LOCKMODE lockmode)` — emits even on a zero
    /// identity so releases are never lost to a torn record.
    pub fn ungrant_lock(&self) {
        let mut event = LockEvent::new(self.header(EVENT_LOCK_UNGRANTED));
        event.mode = self.arg(2) as i32;
        self.lock_record_fields(self.arg(1), &mut event);
        event.stack_id = self.stacks.capture(StackSite::Release);
        self.publish(&event);
    }

    /// `FastPathUnGrantRelationLock(Oid relid, LOCKMODE lockmode)` — emits
    /// unconditionally.
    pub fn fastpath_ungrant(&self) {
        let mut event = LockEvent::new(self.header(EVENT_LOCK_UNGRANTED_FASTPATH));
        event.object = self.arg(1) as u32;
        event.mode = self.arg(2) as i32;
        event.stack_id = self.stacks.capture(StackSite::Release);
        self.publish(&event);
    }

    /// `RemoveLocalLock(LOCALLOCK *locallock)`. Zero identity suppresses.
    pub fn ungrant_local(&self) {
        let mut event = LockEvent::new(self.header(EVENT_LOCK_UNGRANTED_LOCAL));
        self.local_lock_record_fields(self.arg(1), &mut event);
        if event.object != 0 {
            self.publish(&event);
        }
    }

    /// `DeadLockReport()` — header plus an optional stack id.
    pub fn deadlock(&self) {
        let mut event = LockEvent::new(self.header(EVENT_DEADLOCK));
        event.stack_id = self.stacks.capture(StackSite::Deadlock);
        self.publish(&event);
    }

    // ========================================================================
    // Transaction / invalidation family (header-only)
    // ========================================================================

    pub fn transaction_begin(&self) {
        self.publish(&LockEvent::new(self.header(EVENT_TRANSACTION_BEGIN)));
    }

    pub fn transaction_commit(&self) {
        self.publish(&LockEvent::new(self.header(EVENT_TRANSACTION_COMMIT)));
    }

    pub fn transaction_abort(&self) {
        self.publish(&LockEvent::new(self.header(EVENT_TRANSACTION_ABORT)));
    }

    pub fn invalidation_accept(&self) {
        self.publish(&LockEvent::new(self.header(EVENT_INVALIDATION_ACCEPT)));
    }

    // ========================================================================
    // Row / tuple lock family
    // ========================================================================

    /// `heapam_tuple_lock(Relation relation, ItemPointer tid, ..., LockTupleMode
    /// mode, LockWaitPolicy wait_policy, uint8 flags, TM_FailureData *tmfd)`.
    ///
    /// The relation identity is the leading `RelFileLocator` of the
    /// relation struct; the tuple address packs its block number into two
    /// adjacent 16-bit halves. `mode` is the last register argument,
    /// `wait_policy` the first stack argument.
    pub fn tuple_lock(&self) {
        let mut event = RowLockEvent::new(self.header(EVENT_LOCK_TUPLE));

        let locator = self.layout.rel_file_locator;
        let image =
            StructImage::<REL_FILE_IMAGE_CAP>::read_from(self.mem, self.arg(1), locator.image_len)
                .unwrap_or_else(|_| StructImage::zeroed());
        event.tablespace = image.u32_at(locator.tablespace);
        event.database = image.u32_at(locator.database);
        event.relation = image.u32_at(locator.relation);

        let tid = self.layout.item_pointer;
        let image =
            StructImage::<ITEM_POINTER_IMAGE_CAP>::read_from(self.mem, self.arg(2), tid.image_len)
                .unwrap_or_else(|_| StructImage::zeroed());
        let hi = image.u16_at(tid.block_hi);
        let lo = image.u16_at(tid.block_lo);
        event.block = u32::from(hi) << 16 | u32::from(lo);
        event.offset = image.u16_at(tid.offset);

        event.tuple_mode = self.arg(6) as u8;
        event.wait_policy = self.arg(7) as u8;
        self.publish(&event);
    }

    /// `heapam_tuple_lock` return — the `TM_Result` of the attempt.
    pub fn tuple_lock_end(&self) {
        let mut event = RowLockEvent::new(self.header(EVENT_LOCK_TUPLE_END));
        event.result = self.call.return_value() as i32;
        self.publish(&event);
    }

    // ========================================================================
    // Lightweight lock family
    // ========================================================================

    /// Shared routine for all eight `lwlock__*` tracepoints: argument 1 is
    /// the tranche name, argument 2 (when the phase carries one) the mode.
    pub fn lwlock(&self, phase: LwLockPhase) {
        let mut event = LwLockEvent::new(self.header(phase.event_kind()));
        read_cstr_or_empty(self.mem, self.arg(1), &mut event.tranche);
        if phase.argument_count() > 1 {
            event.mode = self.arg(2) as u32;
        }
        self.publish(&event);
    }

    // ========================================================================
    // Spin delay
    // ========================================================================

    /// `perform_spin_delay(SpinDelayStatus *status)`.
    ///
    /// A NULL status still emits a header-only sample; no string read is
    /// attempted for it or for NULL file/function pointers.
    pub fn spin_delay(&self) {
        let mut event = SpinDelayEvent::new(self.header(crate::events::EVENT_SPIN_DELAY));

        let status_addr = self.arg(1);
        if status_addr != 0 {
            let spin = self.layout.spin_status;
            let image =
                StructImage::<SPIN_STATUS_IMAGE_CAP>::read_from(self.mem, status_addr, spin.image_len)
                    .unwrap_or_else(|_| StructImage::zeroed());
            event.spins = image.i32_at(spin.spins);
            event.delays = image.i32_at(spin.delays);
            event.cur_delay = image.i32_at(spin.cur_delay);
            event.line = image.i32_at(spin.line);
            read_cstr_or_empty(self.mem, image.ptr_at(spin.file), &mut event.file);
            read_cstr_or_empty(self.mem, image.ptr_at(spin.func), &mut event.func);
        }
        self.publish(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::SYSTEM_V_AMD64;
    use crate::config::TraceFamilies;
    use crate::events::{cstr_field, Event};
    use crate::layout::PostgresVersion;
    use crate::mem::ReadFault;
    use crate::stacks::NoStacks;
    use crate::testutil::{RecordingSink, SliceMemory, TestCallSite, TestStacks};
    use core::cell::Cell;
    use std::vec;
    use std::vec::Vec;

    const SP: u64 = 0x7ffc_0000;

    fn layout(version: PostgresVersion) -> LayoutDescriptor {
        LayoutDescriptor::resolve(version, TraceFamilies::all()).unwrap()
    }

    fn encode_with<'a>(
        call: &'a TestCallSite,
        mem: &'a SliceMemory<'a>,
        layout: &'a LayoutDescriptor,
        stacks: &'a TestStacks,
        sink: &'a RecordingSink,
    ) -> EventEncoder<'a, TestCallSite, SliceMemory<'a>, TestStacks, RecordingSink> {
        EventEncoder::new(call, mem, &SYSTEM_V_AMD64, layout, stacks, sink)
    }

    fn lock_events(sink: &RecordingSink) -> Vec<LockEvent> {
        sink.events()
            .into_iter()
            .map(|e| match e {
                Event::Lock(l) => l,
                _ => panic!("expected a heavyweight lock record"),
            })
            .collect()
    }

    /// A shared LOCK record image for the given descriptor: identity V,
    /// requested-count R at their version-specific offsets.
    fn lock_image(desc: &LayoutDescriptor, identity: u32, requested: u32) -> Vec<u8> {
        let mut image = vec![0u8; desc.lock.image_len as usize];
        let id_off = desc.lock.identity.offset as usize;
        image[id_off..id_off + 4].copy_from_slice(&identity.to_ne_bytes());
        let req_off = desc.lock.requested_count.offset as usize;
        image[req_off..req_off + 4].copy_from_slice(&requested.to_ne_bytes());
        image
    }

    #[test]
    fn every_event_carries_pid_and_nonzero_timestamp() {
        let desc = layout(PostgresVersion::V15);
        let call = TestCallSite::new(9911, [16384, 3, 0, 0, 0, 0], SP);
        let mem = SliceMemory::new(&[]);
        let stacks = TestStacks::new(0);
        let sink = RecordingSink::new();
        let enc = encode_with(&call, &mem, &desc, &stacks, &sink);

        enc.table_open();
        enc.transaction_begin();
        enc.query_end();
        enc.lock_relation_oid();

        for event in sink.events() {
            assert_eq!(event.header().pid, 9911);
            assert!(event.header().timestamp_ns > 0);
        }
    }

    #[test]
    fn lock_record_decodes_identity_and_requested_mask() {
        let desc = layout(PostgresVersion::V15);
        let image = lock_image(&desc, 0xbeef, 7);
        let call = TestCallSite::new(1, [0x5000, 0, 3, 0, 0, 0], SP);
        let regions: &[(u64, &[u8])] = &[(0x5000, &image)];
        let mem = SliceMemory::new(regions);
        let stacks = TestStacks::new(0);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).grant_lock();

        let events = lock_events(&sink);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].object, 0xbeef);
        assert_eq!(events[0].requested, 7);
        assert_eq!(events[0].mode, 3);
    }

    #[test]
    fn no_field_bleed_across_version_layouts() {
        // The same logical record laid out for two different versions;
        // each must decode with its own descriptor and garbage with the
        // other's would land in requested (104 vs 96).
        for version in [PostgresVersion::V15, PostgresVersion::V16] {
            let desc = layout(version);
            let image = lock_image(&desc, 42, 5);
            let call = TestCallSite::new(1, [0x5000, 0, 1, 0, 0, 0], SP);
            let regions: &[(u64, &[u8])] = &[(0x5000, &image)];
        let mem = SliceMemory::new(regions);
            let stacks = TestStacks::new(0);
            let sink = RecordingSink::new();
            encode_with(&call, &mem, &desc, &stacks, &sink).grant_lock();

            let events = lock_events(&sink);
            assert_eq!(events[0].object, 42, "{version}");
            assert_eq!(events[0].requested, 5, "{version}");
        }
    }

    #[test]
    fn zero_identity_policy_is_per_probe() {
        let desc = layout(PostgresVersion::V15);
        let zero_lock = lock_image(&desc, 0, 0);
        let zero_local = vec![0u8; desc.local_lock.image_len as usize];
        let regions: &[(u64, &[u8])] = &[(0x5000, &zero_lock), (0x6000, &zero_local)];
        let mem = SliceMemory::new(regions);
        let stacks = TestStacks::new(0);

        // Suppressing probes: shared grant and local grant.
        let call = TestCallSite::new(1, [0x5000, 0, 1, 0, 0, 0], SP);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).grant_lock();
        assert_eq!(sink.len(), 0, "grant_lock must suppress a zero identity");

        let call = TestCallSite::new(1, [0x6000, 0, 0, 0, 0, 0], SP);
        let sink = RecordingSink::new();
        let enc = encode_with(&call, &mem, &desc, &stacks, &sink);
        enc.grant_local();
        enc.ungrant_local();
        assert_eq!(sink.len(), 0, "local paths must suppress a zero identity");

        // Emitting probes: ungrant and fastpath ungrant.
        let call = TestCallSite::new(1, [0x5000, 2, 0, 0, 0, 0], SP);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).ungrant_lock();
        assert_eq!(sink.len(), 1, "ungrant_lock must emit on a zero identity");

        let call = TestCallSite::new(1, [0, 2, 0, 0, 0, 0], SP);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).fastpath_ungrant();
        assert_eq!(sink.len(), 1, "fastpath_ungrant must emit on a zero identity");
    }

    #[test]
    fn local_lock_record_decodes_mode_and_hold_count() {
        let desc = layout(PostgresVersion::V14);
        let local = desc.local_lock;
        let mut image = vec![0u8; local.image_len as usize];
        let off = local.identity.offset as usize;
        image[off..off + 4].copy_from_slice(&77u32.to_ne_bytes());
        let off = local.mode.offset as usize;
        image[off..off + 4].copy_from_slice(&8i32.to_ne_bytes());
        let off = local.hold_count.offset as usize;
        image[off..off + 8].copy_from_slice(&(-2i64).to_ne_bytes());

        let call = TestCallSite::new(1, [0x6000, 0, 0, 0, 0, 0], SP);
        let regions: &[(u64, &[u8])] = &[(0x6000, &image)];
        let mem = SliceMemory::new(regions);
        let stacks = TestStacks::new(0);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).grant_local();

        let events = lock_events(&sink);
        assert_eq!(events[0].object, 77);
        assert_eq!(events[0].mode, 8);
        assert_eq!(events[0].local_hold, -2);
    }

    #[test]
    fn table_close_reads_oid_inside_relation_struct() {
        let desc = layout(PostgresVersion::V15);
        let mut image = vec![0u8; desc.relation.image_len as usize];
        let off = desc.relation.id.offset as usize;
        image[off..off + 4].copy_from_slice(&16599u32.to_ne_bytes());

        let call = TestCallSite::new(1, [0x9000, 1, 0, 0, 0, 0], SP);
        let regions: &[(u64, &[u8])] = &[(0x9000, &image)];
        let mem = SliceMemory::new(regions);
        let stacks = TestStacks::new(0);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).table_close();

        let events = lock_events(&sink);
        assert_eq!(events[0].object, 16599);
        assert_eq!(events[0].mode, 1);
    }

    #[test]
    fn range_var_open_decodes_both_name_strings() {
        let desc = layout(PostgresVersion::V15);
        let mut rv = vec![0u8; desc.range_var.image_len as usize];
        rv[16..24].copy_from_slice(&0x4000u64.to_ne_bytes()); // schemaname
        rv[24..32].copy_from_slice(&0x4100u64.to_ne_bytes()); // relname
        let regions: &[(u64, &[u8])] =
            &[(0x3000, &rv), (0x4000, b"public\0"), (0x4100, b"metrics\0")];

        let call = TestCallSite::new(1, [0x3000, 4, 0, 0, 0, 0], SP);
        let mem = SliceMemory::new(regions);
        let stacks = TestStacks::new(0);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).table_open_rv(false);

        let events = lock_events(&sink);
        assert_eq!(cstr_field(&events[0].payload1), "public");
        assert_eq!(cstr_field(&events[0].payload2), "metrics");
        assert_eq!(events[0].mode, 4);
        assert_eq!(events[0].header.kind, EVENT_TABLE_OPEN_RV);
    }

    #[test]
    fn tuple_lock_reconstructs_block_number_and_stack_argument() {
        let desc = layout(PostgresVersion::V15);
        let locator: Vec<u8> = [1663u32, 5u32, 16384u32]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        // bi_hi = 0x0001, bi_lo = 0x0002, ip_posid = 9
        let mut tid = Vec::new();
        tid.extend_from_slice(&0x0001u16.to_ne_bytes());
        tid.extend_from_slice(&0x0002u16.to_ne_bytes());
        tid.extend_from_slice(&9u16.to_ne_bytes());
        // Entry frame: return address, then wait_policy in the first slot.
        let mut stack = Vec::new();
        stack.extend_from_slice(&0u64.to_ne_bytes());
        stack.extend_from_slice(&2u64.to_ne_bytes());

        let regions: &[(u64, &[u8])] = &[(0x1000, &locator), (0x2000, &tid), (SP, &stack)];
        let call = TestCallSite::new(7, [0x1000, 0x2000, 0, 0, 0, 3], SP);
        let mem = SliceMemory::new(regions);
        let stacks = TestStacks::new(0);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).tuple_lock();

        let Event::RowLock(event) = sink.events()[0] else {
            panic!("expected a row lock record");
        };
        assert_eq!(event.tablespace, 1663);
        assert_eq!(event.database, 5);
        assert_eq!(event.relation, 16384);
        assert_eq!(event.block, 0x0001_0002);
        assert_eq!(event.offset, 9);
        assert_eq!(event.tuple_mode, 3, "mode rides the sixth register");
        assert_eq!(event.wait_policy, 2, "wait policy rides the first stack slot");
    }

    #[test]
    fn tuple_lock_end_captures_the_return_code() {
        let desc = layout(PostgresVersion::V15);
        let mut call = TestCallSite::new(7, [0; 6], SP);
        call.ret = 6; // TM_WouldBlock
        let mem = SliceMemory::new(&[]);
        let stacks = TestStacks::new(0);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).tuple_lock_end();

        let Event::RowLock(event) = sink.events()[0] else {
            panic!("expected a row lock record");
        };
        assert_eq!(event.result, 6);
    }

    #[test]
    fn lwlock_phases_share_one_routine_with_per_phase_arity() {
        let desc = layout(PostgresVersion::V15);
        let regions: &[(u64, &[u8])] = &[(0x8000, b"WALWriteLock\0")];
        let mem = SliceMemory::new(regions);
        let stacks = TestStacks::new(0);

        // Acquire carries a mode.
        let call = TestCallSite::new(3, [0x8000, 1, 0, 0, 0, 0], SP);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).lwlock(LwLockPhase::Acquire);
        let Event::LwLock(event) = sink.events()[0] else {
            panic!("expected a lwlock record");
        };
        assert_eq!(cstr_field(&event.tranche), "WALWriteLock");
        assert_eq!(event.mode, 1);
        assert_eq!(event.header.kind, EVENT_LWLOCK_ACQUIRE);

        // Release takes the tranche only; a stale register must not leak
        // into the mode field.
        let call = TestCallSite::new(3, [0x8000, 0xdead, 0, 0, 0, 0], SP);
        let sink = RecordingSink::new();
        encode_with(&call, &mem, &desc, &stacks, &sink).lwlock(LwLockPhase::Release);
        let Event::LwLock(event) = sink.events()[0] else {
            panic!("expected a lwlock record");
        };
        assert_eq!(event.mode, 0);
        assert_eq!(event.header.kind, EVENT_LWLOCK_RELEASE);
    }

    /// Memory double that counts reads, to prove the NULL-status path never
    /// touches target memory.
    struct CountingMemory<'a> {
        inner: SliceMemory<'a>,
        reads: Cell<usize>,
    }

    impl MemoryReader for CountingMemory<'_> {
        fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadFault> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read_bytes(addr, dst)
        }

        fn read_cstr(&self, addr: u64, dst: &mut [u8]) -> Result<usize, ReadFault> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read_cstr(addr, dst)
        }
    }

    #[test]
    fn null_spin_status_emits_header_only_without_reading() {
        let desc = layout(PostgresVersion::V15);
        let call = TestCallSite::new(5, [0, 0, 0, 0, 0, 0], SP);
        let mem = CountingMemory { inner: SliceMemory::new(&[]), reads: Cell::new(0) };
        let stacks = NoStacks;
        let sink = RecordingSink::new();
        EventEncoder::new(&call, &mem, &SYSTEM_V_AMD64, &desc, &stacks, &sink).spin_delay();

        assert_eq!(mem.reads.get(), 0, "NULL status must not trigger any read");
        let Event::SpinDelay(event) = sink.events()[0] else {
            panic!("expected a spin delay record");
        };
        assert_eq!(event.header.pid, 5);
        assert_eq!(event.spins, 0);
        assert_eq!(cstr_field(&event.file), "");
    }

    #[test]
    fn spin_status_decodes_counters_and_source_strings() {
        let desc = layout(PostgresVersion::V15);
        let spin = desc.spin_status;
        let mut image = vec![0u8; spin.image_len as usize];
        image[0..4].copy_from_slice(&100i32.to_ne_bytes());
        image[4..8].copy_from_slice(&3i32.to_ne_bytes());
        image[8..12].copy_from_slice(&1000i32.to_ne_bytes());
        image[16..24].copy_from_slice(&0x4000u64.to_ne_bytes());
        image[24..28].copy_from_slice(&217i32.to_ne_bytes());
        image[32..40].copy_from_slice(&0x4100u64.to_ne_bytes());
        let regions: &[(u64, &[u8])] =
            &[(0x7000, &image), (0x4000, b"lwlock.c\0"), (0x4100, b"LWLockAcquire\0")];

        let call = TestCallSite::new(5, [0x7000, 0, 0, 0, 0, 0], SP);
        let mem = SliceMemory::new(regions);
        let sink = RecordingSink::new();
        EventEncoder::new(&call, &mem, &SYSTEM_V_AMD64, &desc, &NoStacks, &sink).spin_delay();

        let Event::SpinDelay(event) = sink.events()[0] else {
            panic!("expected a spin delay record");
        };
        assert_eq!(event.spins, 100);
        assert_eq!(event.delays, 3);
        assert_eq!(event.cur_delay, 1000);
        assert_eq!(event.line, 217);
        assert_eq!(cstr_field(&event.file), "lwlock.c");
        assert_eq!(cstr_field(&event.func), "LWLockAcquire");
    }

    #[test]
    fn error_events_respect_the_severity_floor() {
        let desc = layout(PostgresVersion::V15);
        let mem = SliceMemory::new(&[]);
        let sink = RecordingSink::new();

        let call = TestCallSite::new(1, [15, 0, 0, 0, 0, 0], SP); // WARNING-ish
        EventEncoder::new(&call, &mem, &SYSTEM_V_AMD64, &desc, &NoStacks, &sink)
            .error_raised(crate::events::DEFAULT_ERROR_THRESHOLD);
        assert_eq!(sink.len(), 0);

        let call = TestCallSite::new(1, [22, 0, 0, 0, 0, 0], SP); // FATAL
        EventEncoder::new(&call, &mem, &SYSTEM_V_AMD64, &desc, &NoStacks, &sink)
            .error_raised(crate::events::DEFAULT_ERROR_THRESHOLD);
        let events = lock_events(&sink);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].mode, 22);
    }

    #[test]
    fn query_text_truncates_at_capacity_with_terminator() {
        let desc = layout(PostgresVersion::V15);
        let long = [b'x'; 200];
        let regions: &[(u64, &[u8])] = &[(0x4000, &long)];
        let call = TestCallSite::new(1, [0x4000, 0, 0, 0, 0, 0], SP);
        let mem = SliceMemory::new(regions);
        let sink = RecordingSink::new();
        EventEncoder::new(&call, &mem, &SYSTEM_V_AMD64, &desc, &NoStacks, &sink).query_begin();

        let events = lock_events(&sink);
        let text = cstr_field(&events[0].payload1);
        assert_eq!(text.len(), crate::events::PAYLOAD_STR_CAP - 1);
        assert!(text.bytes().all(|b| b == b'x'));
    }

    #[test]
    fn stack_ids_attach_only_at_capture_sites() {
        let desc = layout(PostgresVersion::V15);
        let mem = SliceMemory::new(&[]);
        let stacks = TestStacks::new(41);
        let call = TestCallSite::new(1, [16384, 1, 0, 0, 0, 0], SP);
        let sink = RecordingSink::new();
        let enc = encode_with(&call, &mem, &desc, &stacks, &sink);

        enc.lock_relation_oid();
        enc.fastpath_ungrant();
        enc.deadlock();
        enc.table_open(); // no capture site

        let events = lock_events(&sink);
        assert_eq!(events[0].stack_id, 41);
        assert_eq!(events[1].stack_id, 41);
        assert_eq!(events[2].stack_id, 41);
        assert_eq!(events[3].stack_id, 0);
        assert_eq!(
            stacks.requested.borrow().as_slice(),
            &[StackSite::Acquire, StackSite::Release, StackSite::Deadlock]
        );
    }

    #[test]
    fn saturated_channel_never_faults_the_encoders() {
        let desc = layout(PostgresVersion::V15);
        let mem = SliceMemory::new(&[]);
        let call = TestCallSite::new(1, [1, 1, 0, 0, 0, 0], SP);
        let sink = RecordingSink::saturating_after(2);
        let enc = EventEncoder::new(&call, &mem, &SYSTEM_V_AMD64, &desc, &NoStacks, &sink);

        for _ in 0..10 {
            enc.transaction_begin();
            enc.fastpath_grant();
        }

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.dropped(), 18);
    }

    #[test]
    fn torn_lock_pointer_degrades_to_sentinel_fields() {
        let desc = layout(PostgresVersion::V15);
        // No mapping behind the LOCK pointer at all.
        let call = TestCallSite::new(1, [0xdead_0000, 5, 0, 0, 0, 0], SP);
        let mem = SliceMemory::new(&[]);
        let sink = RecordingSink::new();
        let enc = EventEncoder::new(&call, &mem, &SYSTEM_V_AMD64, &desc, &NoStacks, &sink);

        enc.grant_lock(); // zero identity after the fault -> suppressed
        assert_eq!(sink.len(), 0);

        enc.ungrant_lock(); // same fault -> still emitted, zero-filled
        let events = lock_events(&sink);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].object, 0);
        assert_eq!(events[0].requested, 0);
        assert_eq!(events[0].mode, 5, "register fields survive a memory fault");
    }
}
