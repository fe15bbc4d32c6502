//! # eBPF Program Loading and Attachment
//!
//! Loads the compiled probe object, publishes the resolved layout
//! descriptor and runtime configuration, and attaches one uprobe (or
//! uretprobe) per instrumentation point of the selected event families.
//!
//! Attachment is all-or-nothing per family: if any symbol of a selected
//! family cannot be found or attached, the run fails rather than silently
//! tracing a subset.

pub mod usdt;

use anyhow::Result;
use aya::{
    include_bytes_aligned,
    maps::{Array, HashMap},
    programs::UProbe,
    Ebpf,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use pgtrace_common::{
    config::{CONFIG_ERROR_THRESHOLD, CONFIG_STACK_SITES},
    LayoutDescriptor, StackSites, TraceFamilies,
};

use crate::domain::TracerError;
use usdt::lwlock_probe_offsets;

/// Whether a probe fires on function entry or return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProbeKind {
    Entry,
    Return,
}

/// One uprobe attachment: target symbol, program name, owning family.
struct ProbeSpec {
    symbol: &'static str,
    program: &'static str,
    family: TraceFamilies,
    kind: ProbeKind,
}

const fn entry(symbol: &'static str, program: &'static str, family: TraceFamilies) -> ProbeSpec {
    ProbeSpec { symbol, program, family, kind: ProbeKind::Entry }
}

const fn ret(symbol: &'static str, program: &'static str, family: TraceFamilies) -> ProbeSpec {
    ProbeSpec { symbol, program, family, kind: ProbeKind::Return }
}

/// Symbol-addressed probes. The lightweight-lock tracepoints are not here;
/// they attach at stapsdt note addresses (see [`usdt`]).
const UPROBES: &[ProbeSpec] = &[
    // Transaction probes
    entry("StartTransaction", "transaction_begin", TraceFamilies::TRANSACTION),
    entry("CommitTransaction", "transaction_commit", TraceFamilies::TRANSACTION),
    entry("AbortTransaction", "transaction_abort", TraceFamilies::TRANSACTION),
    entry("AcceptInvalidationMessages", "accept_invalidations", TraceFamilies::TRANSACTION),
    entry("DeadLockReport", "deadlock_report", TraceFamilies::TRANSACTION),
    // Query probes
    entry("exec_simple_query", "query_begin", TraceFamilies::QUERY),
    ret("exec_simple_query", "query_end", TraceFamilies::QUERY),
    // Table probes
    entry("table_open", "table_open", TraceFamilies::TABLE),
    entry("table_openrv", "table_openrv", TraceFamilies::TABLE),
    entry("table_openrv_extended", "table_openrv_extended", TraceFamilies::TABLE),
    entry("table_close", "table_close", TraceFamilies::TABLE),
    // Heavyweight lock probes
    entry("LockRelationOid", "lock_relation_oid", TraceFamilies::LOCK),
    ret("LockRelationOid", "lock_relation_oid_end", TraceFamilies::LOCK),
    entry("UnlockRelationOid", "unlock_relation_oid", TraceFamilies::LOCK),
    entry("GrantLock", "grant_lock", TraceFamilies::LOCK),
    entry("FastPathGrantRelationLock", "fastpath_grant", TraceFamilies::LOCK),
    entry("GrantLockLocal", "grant_lock_local", TraceFamilies::LOCK),
    entry("UnGrantLock", "ungrant_lock", TraceFamilies::LOCK),
    entry("FastPathUnGrantRelationLock", "fastpath_ungrant", TraceFamilies::LOCK),
    entry("RemoveLocalLock", "remove_local_lock", TraceFamilies::LOCK),
    // Error probes
    entry("errstart", "errstart", TraceFamilies::ERROR),
    // Row lock probes
    entry("heapam_tuple_lock", "tuple_lock", TraceFamilies::ROW_LOCK),
    ret("heapam_tuple_lock", "tuple_lock_end", TraceFamilies::ROW_LOCK),
    // Spin delay probe
    entry("perform_spin_delay", "spin_delay", TraceFamilies::SPIN_DELAY),
];

/// USDT tracepoints of the `postgresql` provider and the programs that
/// decode them.
pub const LWLOCK_PROBES: &[(&str, &str)] = &[
    ("lwlock__acquire", "lwlock_acquire"),
    ("lwlock__release", "lwlock_release"),
    ("lwlock__wait__start", "lwlock_wait_start"),
    ("lwlock__wait__done", "lwlock_wait_done"),
    ("lwlock__condacquire", "lwlock_cond_acquire"),
    ("lwlock__condacquire__fail", "lwlock_cond_acquire_fail"),
    ("lwlock__acquire__or__wait", "lwlock_acquire_or_wait"),
    ("lwlock__acquire__or__wait__fail", "lwlock_acquire_or_wait_fail"),
];

/// Load the eBPF program binary.
///
/// Always uses the release build because debug builds with recent Rust
/// nightlies pull in formatting code that is incompatible with BPF. The
/// release build uses LTO to eliminate dead code.
///
/// # Errors
/// Returns an error if the eBPF program binary cannot be loaded
pub fn load_ebpf_program() -> Result<Ebpf> {
    let bpf = Ebpf::load(include_bytes_aligned!(
        "../../../target/bpfel-unknown-none/release/pgtrace"
    ))?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Publish the resolved layout descriptor into the one-slot `LAYOUT` map.
/// Must happen before any probe attaches; the probe side drops firings
/// until the slot is populated.
pub fn publish_layout(bpf: &mut Ebpf, descriptor: &LayoutDescriptor) -> Result<(), TracerError> {
    let map = bpf.map_mut("LAYOUT").ok_or(TracerError::MapNotFound("LAYOUT"))?;
    let mut layout: Array<_, LayoutDescriptor> = Array::try_from(map)?;
    layout.set(0, *descriptor, 0)?;
    Ok(())
}

/// Publish runtime configuration: stack capture sites and the error
/// severity floor.
pub fn publish_config(
    bpf: &mut Ebpf,
    sites: StackSites,
    error_level: i32,
) -> Result<(), TracerError> {
    let map = bpf.map_mut("CONFIG").ok_or(TracerError::MapNotFound("CONFIG"))?;
    let mut config: HashMap<_, u32, u64> = HashMap::try_from(map)?;
    config.insert(CONFIG_STACK_SITES, sites.bits(), 0)?;
    config.insert(CONFIG_ERROR_THRESHOLD, error_level as u64, 0)?;
    Ok(())
}

/// Load one program and attach it, either at a symbol (with `fn_name`) or
/// at an absolute offset into the target (stapsdt sites). Whether the
/// program fires on entry or return is a property of the program itself.
fn load_and_attach(
    bpf: &mut Ebpf,
    program: &str,
    target: &str,
    fn_name: Option<&str>,
    offset: u64,
) -> Result<(), TracerError> {
    let prog = bpf
        .program_mut(program)
        .ok_or_else(|| attach_error(program, target, "program not found in object"))?;
    let prog: &mut UProbe =
        prog.try_into().map_err(|e: aya::programs::ProgramError| {
            attach_error(program, target, &e.to_string())
        })?;
    prog.load().map_err(|e| attach_error(program, target, &e.to_string()))?;
    prog.attach(fn_name, offset, target, None)
        .map_err(|e| attach_error(program, target, &e.to_string()))?;
    Ok(())
}

fn attach_error(probe: &str, binary: &str, error: &str) -> TracerError {
    TracerError::ProbeAttachFailed {
        probe: probe.to_string(),
        binary: binary.to_string(),
        error: error.to_string(),
    }
}

/// Attach every probe of the selected families to `target`.
///
/// Returns the number of attached programs. Probes attach binary-wide
/// (every backend running this executable fires them); pid filtering
/// happens in the drain loop, as events above the global threshold must
/// survive it anyway.
pub fn attach_probes(
    bpf: &mut Ebpf,
    families: TraceFamilies,
    target: &str,
) -> Result<usize, TracerError> {
    let mut attached = 0;

    for spec in UPROBES {
        if !families.contains(spec.family) {
            continue;
        }
        load_and_attach(bpf, spec.program, target, Some(spec.symbol), 0)?;
        debug!("Attached {} ({:?}) -> {}", spec.symbol, spec.kind, spec.program);
        attached += 1;
    }

    if families.contains(TraceFamilies::LW_LOCK) {
        attached += attach_lwlock_probes(bpf, target)?;
    }

    info!("✓ Attached {attached} probes to {target}");
    Ok(attached)
}

/// Attach the eight lightweight-lock programs at their stapsdt note
/// addresses. Requires a server built with `--enable-dtrace`.
fn attach_lwlock_probes(bpf: &mut Ebpf, target: &str) -> Result<usize, TracerError> {
    let binary = std::fs::read(target)
        .map_err(|e| attach_error("stapsdt", target, &e.to_string()))?;
    let offsets = lwlock_probe_offsets(&binary, target)?;

    let mut attached = 0;
    for (usdt_name, program) in LWLOCK_PROBES {
        let offset = offsets.get(*usdt_name).copied().ok_or_else(|| {
            TracerError::UsdtProbeNotFound {
                provider: usdt::PROVIDER.to_string(),
                name: (*usdt_name).to_string(),
                binary: target.to_string(),
            }
        })?;
        load_and_attach(bpf, program, target, None, offset)?;
        debug!("Attached usdt {usdt_name} at 0x{offset:x} -> {program}");
        attached += 1;
    }
    Ok(attached)
}
