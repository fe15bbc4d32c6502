//! Core domain newtypes.

use std::fmt;

/// A traced backend process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stack id captured by the probe side.
///
/// Zero means capture was off for the firing; negative values carry the
/// probe-side error code (usually a full stack map).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackId(pub i32);

impl StackId {
    #[must_use]
    pub fn is_captured(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    /// Key into the probe-side stack trace map.
    #[must_use]
    pub fn as_map_key(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
