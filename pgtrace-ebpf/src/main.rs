//! # eBPF Probe Programs
//!
//! One program per PostgreSQL instrumentation point. Each firing decodes a
//! typed event through the shared encoders in `pgtrace-common` and pushes
//! it into the ring buffer; userspace drains and renders.
//!
//! ## Programs
//!
//! - **Uprobes**: table open/close, relation locks, shared and local lock
//!   manager grants, tuple locks, spin delays, transactions, queries,
//!   errors, deadlock reports
//! - **Uretprobes**: query end, relation lock end, tuple lock end
//! - **USDT sites**: the eight `lwlock__*` tracepoints (attached by
//!   userspace at stapsdt note addresses)
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (4MB) for the event stream
//! - `STACK_TRACES` - Deduplicated user stacks by id
//! - `LAYOUT` - The resolved per-version layout descriptor (1 slot)
//! - `CONFIG` - Runtime configuration (stack sites, error threshold)
//!
//! ## Build
//!
//! Always compiled in release mode (debug includes incompatible formatting
//! code):
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
// Register access and target memory reads are inherently unsafe here; the
// decode logic itself lives in pgtrace-common and is tested on the host.
#![allow(unsafe_code)]

use aya_ebpf::{
    bindings::pt_regs,
    helpers::{
        bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_user_buf,
        bpf_probe_read_user_str_bytes,
    },
    macros::{map, uprobe, uretprobe},
    maps::{HashMap, RingBuf},
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use pgtrace_common::{
    config::CONFIG_ERROR_THRESHOLD, encode::LwLockPhase, events::DEFAULT_ERROR_THRESHOLD,
    AbiProfile, CallSite, ChannelFull, EventEncoder, EventSink, LayoutDescriptor, MemoryReader,
    ReadFault, Record, SYSTEM_V_AMD64,
};
#[cfg(feature = "stack-traces")]
use pgtrace_common::{config::CONFIG_STACK_SITES, StackSites};

/// The one calling convention this build decodes.
const ABI: AbiProfile = SYSTEM_V_AMD64;

// ============================================================================
// Maps
// ============================================================================

/// Ring buffer for sending events to userspace (lock-free, lossy).
///
/// A full buffer fails the publish; the encoder drops the record and the
/// observed backend never blocks.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(4 * 1024 * 1024, 0); // 4MB buffer

/// The layout descriptor resolved by userspace at attach time. Slot 0 is
/// written exactly once before any probe attaches; the decode path only
/// reads it.
#[map]
static LAYOUT: aya_ebpf::maps::Array<LayoutDescriptor> =
    aya_ebpf::maps::Array::with_max_entries(1, 0);

/// Runtime configuration: stack capture sites, error severity floor.
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

#[cfg(feature = "stack-traces")]
fn stack_sites() -> StackSites {
    let bits = unsafe { CONFIG.get(&CONFIG_STACK_SITES).copied().unwrap_or(0) };
    StackSites::from_bits(bits)
}

fn error_threshold() -> i32 {
    unsafe {
        CONFIG
            .get(&CONFIG_ERROR_THRESHOLD)
            .copied()
            .map_or(DEFAULT_ERROR_THRESHOLD, |v| v as i32)
    }
}

// ============================================================================
// Trait implementations over the BPF helpers
// ============================================================================

/// Register snapshot of the firing (x86-64).
struct UprobeSite<'a> {
    regs: &'a pt_regs,
}

impl<'a> UprobeSite<'a> {
    fn new(regs: &'a pt_regs) -> Self {
        Self { regs }
    }
}

impl CallSite for UprobeSite<'_> {
    fn process_id(&self) -> u32 {
        (unsafe { bpf_get_current_pid_tgid() } >> 32) as u32
    }

    fn timestamp_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    fn register_argument(&self, slot: usize) -> Option<u64> {
        // System V AMD64 integer argument registers, in order.
        match slot {
            0 => Some(self.regs.rdi),
            1 => Some(self.regs.rsi),
            2 => Some(self.regs.rdx),
            3 => Some(self.regs.rcx),
            4 => Some(self.regs.r8),
            5 => Some(self.regs.r9),
            _ => None,
        }
    }

    fn stack_pointer(&self) -> u64 {
        self.regs.rsp
    }

    fn return_value(&self) -> u64 {
        self.regs.rax
    }
}

/// Bounded reads of the observed backend's memory.
struct UserMemory;

impl MemoryReader for UserMemory {
    fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadFault> {
        unsafe { bpf_probe_read_user_buf(addr as *const u8, dst) }.map_err(|_| ReadFault)
    }

    fn read_cstr(&self, addr: u64, dst: &mut [u8]) -> Result<usize, ReadFault> {
        match unsafe { bpf_probe_read_user_str_bytes(addr as *const u8, dst) } {
            Ok(s) => Ok(s.len()),
            Err(_) => {
                if let Some(first) = dst.first_mut() {
                    *first = 0;
                }
                Err(ReadFault)
            }
        }
    }
}

/// Publish into the ring buffer; a full ring drops the record.
struct RingSink;

impl EventSink for RingSink {
    fn publish<R: Record>(&self, record: &R) -> Result<(), ChannelFull> {
        EVENTS.output(record, 0).map_err(|_| ChannelFull)
    }
}

// Two interchangeable stack capturers behind one interface: the map-backed
// one when the build carries stack tracing, a no-op otherwise.
#[cfg(feature = "stack-traces")]
mod stack_impl {
    use super::{map, stack_sites, EbpfContext, StackSites};
    use aya_ebpf::maps::StackTrace;
    use pgtrace_common::{StackCapture, StackSite};

    /// Stack capture flags for `bpf_get_stackid`:
    ///
    /// - BPF_F_USER_STACK (0x100): capture the user-space stack
    /// - BPF_F_FAST_STACK_CMP (0x200): hash-based dedup
    /// - BPF_F_REUSE_STACKID (0x400): overwrite on hash collision
    const STACK_FLAGS: u64 = 0x100 | 0x200 | 0x400;

    /// Deduplicated user stacks by id, resolved by userspace only.
    #[map]
    static STACK_TRACES: StackTrace = StackTrace::with_max_entries(4096, 0);

    pub struct ProbeStacks<'a, C: EbpfContext> {
        ctx: &'a C,
    }

    impl<'a, C: EbpfContext> ProbeStacks<'a, C> {
        pub fn new(ctx: &'a C) -> Self {
            Self { ctx }
        }
    }

    impl<C: EbpfContext> StackCapture for ProbeStacks<'_, C> {
        fn capture(&self, site: StackSite) -> i32 {
            let wanted = match site {
                StackSite::Acquire => StackSites::ACQUIRE,
                StackSite::Release => StackSites::RELEASE,
                StackSite::Deadlock => StackSites::DEADLOCK,
            };
            if !stack_sites().contains(wanted) {
                return 0;
            }
            match unsafe { STACK_TRACES.get_stackid(self.ctx, STACK_FLAGS) } {
                Ok(id) => id as i32,
                Err(e) => e as i32,
            }
        }
    }
}

#[cfg(not(feature = "stack-traces"))]
mod stack_impl {
    use super::EbpfContext;
    use pgtrace_common::{StackCapture, StackSite};

    pub struct ProbeStacks<'a, C: EbpfContext> {
        _ctx: core::marker::PhantomData<&'a C>,
    }

    impl<'a, C: EbpfContext> ProbeStacks<'a, C> {
        pub fn new(_ctx: &'a C) -> Self {
            Self { _ctx: core::marker::PhantomData }
        }
    }

    impl<C: EbpfContext> StackCapture for ProbeStacks<'_, C> {
        fn capture(&self, _site: StackSite) -> i32 {
            0
        }
    }
}

use stack_impl::ProbeStacks;

// ============================================================================
// Probe plumbing
// ============================================================================

type Encoder<'a, C> =
    EventEncoder<'a, UprobeSite<'a>, UserMemory, ProbeStacks<'a, C>, RingSink>;

/// Build the per-firing decode context and run one encoder method.
/// Failing to find the layout descriptor means userspace has not finished
/// configuring; the firing is dropped whole rather than half-decoded.
fn run_probe<C, F>(ctx: &C, regs: *mut pt_regs, decode: F) -> Result<(), i64>
where
    C: EbpfContext,
    F: FnOnce(&Encoder<'_, C>),
{
    let layout = LAYOUT.get(0).ok_or(1i64)?;
    let site = UprobeSite::new(unsafe { regs.as_ref() }.ok_or(1i64)?);
    let stacks = ProbeStacks::new(ctx);
    let mem = UserMemory;
    let sink = RingSink;
    let encoder = EventEncoder::new(&site, &mem, &ABI, layout, &stacks, &sink);
    decode(&encoder);
    Ok(())
}

fn run_uprobe<F>(ctx: &ProbeContext, decode: F) -> u32
where
    F: FnOnce(&Encoder<'_, ProbeContext>),
{
    match run_probe(ctx, ctx.regs, decode) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn run_uretprobe<F>(ctx: &RetProbeContext, decode: F) -> u32
where
    F: FnOnce(&Encoder<'_, RetProbeContext>),
{
    match run_probe(ctx, ctx.regs, decode) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// ============================================================================
// Table probes
// ============================================================================

/// PostgreSQL: `table_open(Oid relationId, LOCKMODE lockmode)`
#[uprobe]
pub fn table_open(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.table_open())
}

/// PostgreSQL: `table_openrv(const RangeVar *relation, LOCKMODE lockmode)`
#[uprobe]
pub fn table_openrv(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.table_open_rv(false))
}

/// PostgreSQL: `table_openrv_extended(const RangeVar *relation,
/// LOCKMODE lockmode, bool missing_ok)`
#[uprobe]
pub fn table_openrv_extended(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.table_open_rv(true))
}

/// PostgreSQL: `table_close(Relation relation, LOCKMODE lockmode)`
#[uprobe]
pub fn table_close(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.table_close())
}

// ============================================================================
// Query probes
// ============================================================================

/// PostgreSQL: `exec_simple_query(const char *query_string)`
#[uprobe]
pub fn query_begin(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.query_begin())
}

#[uretprobe]
pub fn query_end(ctx: RetProbeContext) -> u32 {
    run_uretprobe(&ctx, |enc| enc.query_end())
}

// ============================================================================
// Error probe
// ============================================================================

/// PostgreSQL: `errstart(int elevel, const char *domain)`
#[uprobe]
pub fn errstart(ctx: ProbeContext) -> u32 {
    let threshold = error_threshold();
    run_uprobe(&ctx, |enc| enc.error_raised(threshold))
}

// ============================================================================
// Heavyweight lock probes
// ============================================================================

/// PostgreSQL: `LockRelationOid(Oid relid, LOCKMODE lockmode)`
#[uprobe]
pub fn lock_relation_oid(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lock_relation_oid())
}

#[uretprobe]
pub fn lock_relation_oid_end(ctx: RetProbeContext) -> u32 {
    run_uretprobe(&ctx, |enc| enc.lock_relation_oid_end())
}

/// PostgreSQL: `UnlockRelationOid(Oid relid, LOCKMODE lockmode)`
#[uprobe]
pub fn unlock_relation_oid(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.unlock_relation_oid())
}

/// PostgreSQL: `GrantLock(LOCK *lock, PROCLOCK *proclock, LOCKMODE lockmode)`
#[uprobe]
pub fn grant_lock(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.grant_lock())
}

/// PostgreSQL: `FastPathGrantRelationLock(Oid relid, LOCKMODE lockmode)`
#[uprobe]
pub fn fastpath_grant(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.fastpath_grant())
}

/// PostgreSQL: `GrantLockLocal(LOCALLOCK *locallock, ResourceOwner owner)`
#[uprobe]
pub fn grant_lock_local(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.grant_local())
}

/// PostgreSQL: `UnGrantLock(LOCK *lock, LOCKMODE lockmode)`
#[uprobe]
pub fn ungrant_lock(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.ungrant_lock())
}

/// PostgreSQL: `FastPathUnGrantRelationLock(Oid relid, LOCKMODE lockmode)`
#[uprobe]
pub fn fastpath_ungrant(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.fastpath_ungrant())
}

/// PostgreSQL: `RemoveLocalLock(LOCALLOCK *locallock)`
#[uprobe]
pub fn remove_local_lock(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.ungrant_local())
}

/// PostgreSQL: `DeadLockReport(void)`
#[uprobe]
pub fn deadlock_report(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.deadlock())
}

// ============================================================================
// Transaction probes
// ============================================================================

/// PostgreSQL: `StartTransaction(void)`
#[uprobe]
pub fn transaction_begin(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.transaction_begin())
}

/// PostgreSQL: `CommitTransaction(void)`
#[uprobe]
pub fn transaction_commit(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.transaction_commit())
}

/// PostgreSQL: `AbortTransaction(void)`
#[uprobe]
pub fn transaction_abort(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.transaction_abort())
}

/// PostgreSQL: `AcceptInvalidationMessages(void)`
#[uprobe]
pub fn accept_invalidations(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.invalidation_accept())
}

// ============================================================================
// Row lock probes
// ============================================================================

/// PostgreSQL: `heapam_tuple_lock(Relation relation, ItemPointer tid, ...)`
#[uprobe]
pub fn tuple_lock(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.tuple_lock())
}

#[uretprobe]
pub fn tuple_lock_end(ctx: RetProbeContext) -> u32 {
    run_uretprobe(&ctx, |enc| enc.tuple_lock_end())
}

// ============================================================================
// Lightweight lock tracepoints (stapsdt sites, attached by address)
// ============================================================================

#[uprobe]
pub fn lwlock_acquire(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lwlock(LwLockPhase::Acquire))
}

#[uprobe]
pub fn lwlock_release(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lwlock(LwLockPhase::Release))
}

#[uprobe]
pub fn lwlock_wait_start(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lwlock(LwLockPhase::WaitStart))
}

#[uprobe]
pub fn lwlock_wait_done(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lwlock(LwLockPhase::WaitDone))
}

#[uprobe]
pub fn lwlock_cond_acquire(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lwlock(LwLockPhase::CondAcquire))
}

#[uprobe]
pub fn lwlock_cond_acquire_fail(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lwlock(LwLockPhase::CondAcquireFail))
}

#[uprobe]
pub fn lwlock_acquire_or_wait(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lwlock(LwLockPhase::AcquireOrWait))
}

#[uprobe]
pub fn lwlock_acquire_or_wait_fail(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.lwlock(LwLockPhase::AcquireOrWaitFail))
}

// ============================================================================
// Spin delay probe
// ============================================================================

/// PostgreSQL: `perform_spin_delay(SpinDelayStatus *status)`
#[uprobe]
pub fn spin_delay(ctx: ProbeContext) -> u32 {
    run_uprobe(&ctx, |enc| enc.spin_delay())
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
