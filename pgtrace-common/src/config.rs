//! Runtime configuration shared between userspace and the probe programs.
//!
//! Userspace writes plain `u64` values into the `CONFIG` map before
//! attaching; the probe side reads them on each firing. An absent key
//! means "use the default".

/// `CONFIG` slot holding the [`StackSites`] bitmask.
pub const CONFIG_STACK_SITES: u32 = 0;

/// `CONFIG` slot holding the error severity floor (defaults to
/// [`crate::events::DEFAULT_ERROR_THRESHOLD`] when unset).
pub const CONFIG_ERROR_THRESHOLD: u32 = 1;

/// Event families the tracer can attach. Selection happens entirely in
/// userspace (unselected families simply never get their probes attached),
/// but the set also drives which layout entities must resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceFamilies(u32);

impl TraceFamilies {
    pub const TRANSACTION: Self = Self(1 << 0);
    pub const QUERY: Self = Self(1 << 1);
    pub const TABLE: Self = Self(1 << 2);
    pub const LOCK: Self = Self(1 << 3);
    pub const ERROR: Self = Self(1 << 4);
    pub const ROW_LOCK: Self = Self(1 << 5);
    pub const LW_LOCK: Self = Self(1 << 6);
    pub const SPIN_DELAY: Self = Self(1 << 7);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn all() -> Self {
        Self(0xff)
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Probe sites where a user-space stack id is captured, as a bitmask
/// stored in `CONFIG[CONFIG_STACK_SITES]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackSites(u64);

impl StackSites {
    /// `LockRelationOid`.
    pub const ACQUIRE: Self = Self(1 << 0);
    /// `UnGrantLock` and `FastPathUnGrantRelationLock`.
    pub const RELEASE: Self = Self(1 << 1);
    /// `DeadLockReport`.
    pub const DEADLOCK: Self = Self(1 << 2);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & 0x7)
    }
}
