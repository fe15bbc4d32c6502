//! Per-version struct layout registry.
//!
//! PostgreSQL gives no runtime way to ask where `LOCKTAG.locktag_field2` or
//! `LOCALLOCK.nLocks` live; the byte offsets below were taken from
//! `gdb ptype /o` dumps of the supported server builds and are the single
//! source of truth for every decode. A wrong value here corrupts events
//! silently, so the rules are strict:
//!
//! - offsets live only in this module, keyed by [`PostgresVersion`];
//! - [`LayoutDescriptor::resolve`] runs once at attach time — a missing
//!   `(struct, field)` pair for the requested version is a hard
//!   [`LayoutError`] and the affected probes must not be attached;
//! - the resolved descriptor is immutable for the run and is shipped to the
//!   BPF side through a one-slot array map, so the hot decode path never
//!   consults these tables.

use crate::config::TraceFamilies;

/// Server versions with audited layouts. The set is closed: anything else
/// must be rejected before attach, never guessed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PostgresVersion {
    V14,
    V15,
    V16,
    /// Known to exist, lock-manager layout not yet audited; resolving the
    /// lock family for V17 fails on purpose.
    V17,
}

impl PostgresVersion {
    #[must_use]
    pub fn major(self) -> u32 {
        match self {
            PostgresVersion::V14 => 14,
            PostgresVersion::V15 => 15,
            PostgresVersion::V16 => 16,
            PostgresVersion::V17 => 17,
        }
    }

    /// Parse a major version, tolerating a `major.minor` suffix
    /// (`"15"` and `"15.4"` both select V15).
    pub fn from_server_version(s: &str) -> Result<Self, LayoutError> {
        let major = s.split('.').next().unwrap_or(s);
        match major {
            "14" => Ok(PostgresVersion::V14),
            "15" => Ok(PostgresVersion::V15),
            "16" => Ok(PostgresVersion::V16),
            "17" => Ok(PostgresVersion::V17),
            _ => Err(LayoutError::UnknownVersion),
        }
    }
}

impl core::fmt::Display for PostgresVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PostgreSQL {}", self.major())
    }
}

/// Decoded structures. Names follow the server's own type names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructId {
    /// Shared lock manager record (`LOCK`).
    Lock,
    /// Per-backend lock table record (`LOCALLOCK`).
    LocalLock,
    /// Opened relation (`RelationData`).
    Relation,
    /// Parsed range variable (`RangeVar`).
    RangeVar,
    /// Physical relation identity (`RelFileNode`, `RelFileLocator` since 16).
    RelFileLocator,
    /// Tuple address (`ItemPointerData`).
    ItemPointer,
    /// Spin wait bookkeeping (`SpinDelayStatus`).
    SpinDelayStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldId {
    /// `LOCKTAG.locktag_field2` — the relation OID for relation locks.
    Identity,
    /// `LOCK.nRequested`.
    RequestedCount,
    /// `LOCALLOCKTAG.mode`.
    Mode,
    /// `LOCALLOCK.nLocks`.
    HoldCount,
    /// `RelationData.rd_id`.
    RelationId,
    /// `RangeVar.schemaname` (pointer).
    SchemaName,
    /// `RangeVar.relname` (pointer).
    RelName,
    /// `spcNode` / `spcOid`.
    Tablespace,
    /// `dbNode` / `dbOid`.
    Database,
    /// `relNode` / `relNumber`.
    Relation,
    /// `BlockIdData.bi_hi`.
    BlockHi,
    /// `BlockIdData.bi_lo`.
    BlockLo,
    /// `ItemPointerData.ip_posid`.
    TupleOffset,
    Spins,
    Delays,
    CurDelay,
    /// `SpinDelayStatus.file` (pointer).
    SourceFile,
    SourceLine,
    /// `SpinDelayStatus.func` (pointer).
    SourceFunc,
}

/// Byte offset and width of one field inside its parent struct.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FieldSpec {
    pub offset: u16,
    pub width: u16,
}

impl FieldSpec {
    #[must_use]
    pub const fn new(offset: u16, width: u16) -> Self {
        Self { offset, width }
    }

    #[must_use]
    pub const fn end(self) -> u16 {
        self.offset + self.width
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// No audited offset for this (struct, field) on this version.
    Unresolved { structure: StructId, field: FieldId, version: PostgresVersion },
    /// Version string outside the supported set.
    UnknownVersion,
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LayoutError::Unresolved { structure, field, version } => write!(
                f,
                "no audited offset for {structure:?}.{field:?} on {version}; refusing to attach"
            ),
            LayoutError::UnknownVersion => write!(f, "unsupported server version"),
        }
    }
}

/// The raw registry. One match arm per fact; version splits stay visible at
/// the point where layouts actually diverge.
fn field(
    version: PostgresVersion,
    structure: StructId,
    field: FieldId,
) -> Result<FieldSpec, LayoutError> {
    use FieldId as F;
    use PostgresVersion as V;
    use StructId as S;

    let spec = match (structure, field) {
        // LOCKTAG is 16 bytes and stable; locktag_field2 carries the
        // relation OID for LOCKTAG_RELATION tags.
        (S::Lock, F::Identity) => match version {
            V::V14 | V::V15 | V::V16 => FieldSpec::new(4, 4),
            V::V17 => return Err(unresolved(structure, field, version)),
        },
        // nRequested sits after tag, grantMask, waitMask, procLocks and
        // waitProcs plus requested[10]. The wait queues shrank in 16 when
        // PROC_QUEUE became a dclist_head.
        (S::Lock, F::RequestedCount) => match version {
            V::V14 | V::V15 => FieldSpec::new(104, 4),
            V::V16 => FieldSpec::new(96, 4),
            V::V17 => return Err(unresolved(structure, field, version)),
        },

        // LOCALLOCKTAG = { LOCKTAG lock; LOCKMODE mode; }
        (S::LocalLock, F::Identity) => FieldSpec::new(4, 4),
        (S::LocalLock, F::Mode) => FieldSpec::new(16, 4),
        (S::LocalLock, F::HoldCount) => FieldSpec::new(40, 8),

        // rd_id lands at 72 on every audited build: the subtransaction id
        // block before it changed names across versions but not width.
        (S::Relation, F::RelationId) => FieldSpec::new(72, 4),

        (S::RangeVar, F::SchemaName) => FieldSpec::new(16, 8),
        (S::RangeVar, F::RelName) => FieldSpec::new(24, 8),

        (S::RelFileLocator, F::Tablespace) => FieldSpec::new(0, 4),
        (S::RelFileLocator, F::Database) => FieldSpec::new(4, 4),
        (S::RelFileLocator, F::Relation) => FieldSpec::new(8, 4),

        (S::ItemPointer, F::BlockHi) => FieldSpec::new(0, 2),
        (S::ItemPointer, F::BlockLo) => FieldSpec::new(2, 2),
        (S::ItemPointer, F::TupleOffset) => FieldSpec::new(4, 2),

        (S::SpinDelayStatus, F::Spins) => FieldSpec::new(0, 4),
        (S::SpinDelayStatus, F::Delays) => FieldSpec::new(4, 4),
        (S::SpinDelayStatus, F::CurDelay) => FieldSpec::new(8, 4),
        (S::SpinDelayStatus, F::SourceFile) => FieldSpec::new(16, 8),
        (S::SpinDelayStatus, F::SourceLine) => FieldSpec::new(24, 4),
        (S::SpinDelayStatus, F::SourceFunc) => FieldSpec::new(32, 8),

        _ => return Err(unresolved(structure, field, version)),
    };
    Ok(spec)
}

fn unresolved(structure: StructId, field: FieldId, version: PostgresVersion) -> LayoutError {
    LayoutError::Unresolved { structure, field, version }
}

// ============================================================================
// Resolved descriptor (POD, shipped to the BPF side via a map)
// ============================================================================

/// Shared `LOCK` record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LockLayout {
    pub image_len: u16,
    pub identity: FieldSpec,
    pub requested_count: FieldSpec,
}

/// `LOCALLOCK` record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalLockLayout {
    pub image_len: u16,
    pub identity: FieldSpec,
    pub mode: FieldSpec,
    pub hold_count: FieldSpec,
}

/// `RelationData` (only the OID is decoded).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RelationLayout {
    pub image_len: u16,
    pub id: FieldSpec,
}

/// `RangeVar` string pointers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeVarLayout {
    pub image_len: u16,
    pub schema_name: FieldSpec,
    pub rel_name: FieldSpec,
}

/// `RelFileLocator` triple.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RelFileLocatorLayout {
    pub image_len: u16,
    pub tablespace: FieldSpec,
    pub database: FieldSpec,
    pub relation: FieldSpec,
}

/// `ItemPointerData`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ItemPointerLayout {
    pub image_len: u16,
    pub block_hi: FieldSpec,
    pub block_lo: FieldSpec,
    pub offset: FieldSpec,
}

/// `SpinDelayStatus`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SpinStatusLayout {
    pub image_len: u16,
    pub spins: FieldSpec,
    pub delays: FieldSpec,
    pub cur_delay: FieldSpec,
    pub file: FieldSpec,
    pub line: FieldSpec,
    pub func: FieldSpec,
}

/// Every field offset one run needs, resolved up front.
///
/// Entities belonging to families that were not requested stay zeroed;
/// their probes are never attached, so their layouts are never read.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LayoutDescriptor {
    pub lock: LockLayout,
    pub local_lock: LocalLockLayout,
    pub relation: RelationLayout,
    pub range_var: RangeVarLayout,
    pub rel_file_locator: RelFileLocatorLayout,
    pub item_pointer: ItemPointerLayout,
    pub spin_status: SpinStatusLayout,
}

impl LayoutDescriptor {
    /// Resolve every entity needed by `families` for `version`.
    ///
    /// Fails on the first unresolvable field; the caller must treat that as
    /// "do not attach these probes", not as a value to default.
    pub fn resolve(
        version: PostgresVersion,
        families: TraceFamilies,
    ) -> Result<Self, LayoutError> {
        let mut descriptor = LayoutDescriptor::default();

        if families.contains(TraceFamilies::LOCK) {
            let identity = field(version, StructId::Lock, FieldId::Identity)?;
            let requested_count = field(version, StructId::Lock, FieldId::RequestedCount)?;
            descriptor.lock = LockLayout {
                image_len: identity.end().max(requested_count.end()),
                identity,
                requested_count,
            };

            let identity = field(version, StructId::LocalLock, FieldId::Identity)?;
            let mode = field(version, StructId::LocalLock, FieldId::Mode)?;
            let hold_count = field(version, StructId::LocalLock, FieldId::HoldCount)?;
            descriptor.local_lock = LocalLockLayout {
                image_len: identity.end().max(mode.end()).max(hold_count.end()),
                identity,
                mode,
                hold_count,
            };
        }

        if families.contains(TraceFamilies::TABLE) {
            let id = field(version, StructId::Relation, FieldId::RelationId)?;
            descriptor.relation = RelationLayout { image_len: id.end(), id };

            let schema_name = field(version, StructId::RangeVar, FieldId::SchemaName)?;
            let rel_name = field(version, StructId::RangeVar, FieldId::RelName)?;
            descriptor.range_var = RangeVarLayout {
                image_len: schema_name.end().max(rel_name.end()),
                schema_name,
                rel_name,
            };
        }

        if families.contains(TraceFamilies::ROW_LOCK) {
            let tablespace = field(version, StructId::RelFileLocator, FieldId::Tablespace)?;
            let database = field(version, StructId::RelFileLocator, FieldId::Database)?;
            let relation = field(version, StructId::RelFileLocator, FieldId::Relation)?;
            descriptor.rel_file_locator = RelFileLocatorLayout {
                image_len: relation.end(),
                tablespace,
                database,
                relation,
            };

            let block_hi = field(version, StructId::ItemPointer, FieldId::BlockHi)?;
            let block_lo = field(version, StructId::ItemPointer, FieldId::BlockLo)?;
            let offset = field(version, StructId::ItemPointer, FieldId::TupleOffset)?;
            descriptor.item_pointer = ItemPointerLayout {
                image_len: offset.end(),
                block_hi,
                block_lo,
                offset,
            };
        }

        if families.contains(TraceFamilies::SPIN_DELAY) {
            let spins = field(version, StructId::SpinDelayStatus, FieldId::Spins)?;
            let delays = field(version, StructId::SpinDelayStatus, FieldId::Delays)?;
            let cur_delay = field(version, StructId::SpinDelayStatus, FieldId::CurDelay)?;
            let file = field(version, StructId::SpinDelayStatus, FieldId::SourceFile)?;
            let line = field(version, StructId::SpinDelayStatus, FieldId::SourceLine)?;
            let func = field(version, StructId::SpinDelayStatus, FieldId::SourceFunc)?;
            descriptor.spin_status = SpinStatusLayout {
                image_len: func.end(),
                spins,
                delays,
                cur_delay,
                file,
                line,
                func,
            };
        }

        Ok(descriptor)
    }
}
