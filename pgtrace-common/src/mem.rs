//! Bounded, fault-tolerant reads of target process memory.
//!
//! The observed server may be mid-update, may hand us a torn pointer, or a
//! page may simply not be mapped. Every read is therefore bounded by the
//! caller and every failure is recoverable: the field that failed decodes
//! to a zero sentinel and the encoder keeps going. There is no write path.

use crate::layout::FieldSpec;

/// One field's read failed. Never fatal; the owning field defaults to zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadFault;

impl core::fmt::Display for ReadFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "target memory read failed")
    }
}

/// Read-only access to the target's address space.
pub trait MemoryReader {
    /// Copy exactly `dst.len()` bytes from `addr`.
    fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadFault>;

    /// Copy a NUL-terminated string of at most `dst.len() - 1` bytes.
    ///
    /// On success `dst` holds the (possibly truncated) string followed by a
    /// NUL; the returned value is the string length. Truncation is
    /// deterministic: the first `dst.len() - 1` source bytes survive.
    /// Implementations must leave `dst[0]` NUL on failure.
    fn read_cstr(&self, addr: u64, dst: &mut [u8]) -> Result<usize, ReadFault>;
}

/// Copy a bounded string field, tolerating NULL pointers and faults. A
/// NULL `addr` skips the read entirely; event buffers start zeroed, so the
/// field stays NUL-terminated either way.
pub fn read_cstr_or_empty<M: MemoryReader>(mem: &M, addr: u64, dst: &mut [u8]) {
    if addr != 0 {
        let _ = mem.read_cstr(addr, dst);
    }
}

/// A bounded snapshot of one target struct.
///
/// The probe copies the struct's prefix once (`image_len` from the layout
/// descriptor, capped by `CAP`), then all field extraction is local and
/// infallible — an out-of-range [`FieldSpec`] yields the zero sentinel
/// instead of a second trip to target memory.
pub struct StructImage<const CAP: usize> {
    buf: [u8; CAP],
    len: usize,
}

impl<const CAP: usize> StructImage<CAP> {
    /// Snapshot `len` bytes at `addr`. A faulted copy fails the whole
    /// image; callers decide whether that suppresses the event or just
    /// zeroes its fields.
    pub fn read_from<M: MemoryReader>(mem: &M, addr: u64, len: u16) -> Result<Self, ReadFault> {
        let len = (len as usize).min(CAP);
        let mut buf = [0u8; CAP];
        mem.read_bytes(addr, &mut buf[..len])?;
        Ok(Self { buf, len })
    }

    /// An all-zero image, for callers that degrade instead of suppressing.
    #[must_use]
    pub fn zeroed() -> Self {
        Self { buf: [0u8; CAP], len: CAP }
    }

    fn field(&self, spec: FieldSpec, width: usize) -> Option<&[u8]> {
        if spec.width as usize != width {
            return None;
        }
        let start = spec.offset as usize;
        self.buf.get(start..start + width).filter(|_| start + width <= self.len)
    }

    #[must_use]
    pub fn u16_at(&self, spec: FieldSpec) -> u16 {
        self.field(spec, 2)
            .and_then(|b| b.try_into().ok())
            .map_or(0, u16::from_ne_bytes)
    }

    #[must_use]
    pub fn u32_at(&self, spec: FieldSpec) -> u32 {
        self.field(spec, 4)
            .and_then(|b| b.try_into().ok())
            .map_or(0, u32::from_ne_bytes)
    }

    #[must_use]
    pub fn i32_at(&self, spec: FieldSpec) -> i32 {
        self.u32_at(spec) as i32
    }

    #[must_use]
    pub fn i64_at(&self, spec: FieldSpec) -> i64 {
        self.field(spec, 8)
            .and_then(|b| b.try_into().ok())
            .map_or(0, i64::from_ne_bytes)
    }

    /// Pointer-width field (the target is 64-bit by definition of the
    /// modeled ABI).
    #[must_use]
    pub fn ptr_at(&self, spec: FieldSpec) -> u64 {
        self.i64_at(spec) as u64
    }
}
