//! Logical call arguments under the target's calling convention.
//!
//! Probes see a register snapshot, not a prototype. Mapping "argument 7 of
//! `heapam_tuple_lock`" onto that snapshot is pure convention: the first N
//! arguments live in registers, the rest on the caller's stack at fixed
//! slots above the return address. Nothing at runtime will tell us if the
//! mapping is wrong — a bad slot reads *something* and the event is
//! silently garbage — so this module is data-driven and tested against
//! literal register files and stack images rather than trusted by review.

use crate::mem::{MemoryReader, ReadFault};

/// The register/stack snapshot of one probe firing, plus the firing
/// process identity and clock. Implemented over `pt_regs` on the BPF side
/// and over plain arrays in tests.
pub trait CallSite {
    /// Process (tgid) the probe fired in.
    fn process_id(&self) -> u32;

    /// Monotonic nanoseconds at the firing. Always non-zero.
    fn timestamp_ns(&self) -> u64;

    /// The `slot`th (0-based) argument register, `None` beyond the
    /// platform's register-argument count.
    fn register_argument(&self, slot: usize) -> Option<u64>;

    /// Stack pointer at the firing (for entry probes: points at the
    /// return address).
    fn stack_pointer(&self) -> u64;

    /// Return-value register (meaningful in return probes only).
    fn return_value(&self) -> u64;
}

/// One platform's argument-passing geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbiProfile {
    /// Arguments passed in registers.
    pub register_arguments: usize,
    /// Offset from the entry stack pointer to the first stack argument
    /// (past the pushed return address).
    pub stack_base_offset: u64,
    /// Distance between consecutive stack argument slots.
    pub stack_slot_stride: u64,
}

/// System V AMD64: rdi, rsi, rdx, rcx, r8, r9, then the stack starting one
/// word above the return address.
pub const SYSTEM_V_AMD64: AbiProfile = AbiProfile {
    register_arguments: 6,
    stack_base_offset: 8,
    stack_slot_stride: 8,
};

impl AbiProfile {
    /// Address of the stack slot backing logical argument `n` (1-based);
    /// `None` while `n` still lives in a register.
    #[must_use]
    pub fn stack_slot(&self, stack_pointer: u64, n: usize) -> Option<u64> {
        let spill_index = n.checked_sub(self.register_arguments + 1)?;
        Some(stack_pointer + self.stack_base_offset + self.stack_slot_stride * spill_index as u64)
    }
}

/// Resolve logical argument `n` (1-based) of the firing call.
///
/// Register arguments come straight from the snapshot; stack arguments are
/// a bounded read of one word from target stack memory. A faulted stack
/// read degrades to `Err(ReadFault)` — callers zero the field and continue.
pub fn argument<C: CallSite, M: MemoryReader>(
    call: &C,
    mem: &M,
    abi: &AbiProfile,
    n: usize,
) -> Result<u64, ReadFault> {
    debug_assert!(n >= 1, "logical argument indices are 1-based");
    match abi.stack_slot(call.stack_pointer(), n) {
        None => call.register_argument(n - 1).ok_or(ReadFault),
        Some(slot) => {
            let mut word = [0u8; 8];
            mem.read_bytes(slot, &mut word)?;
            Ok(u64::from_ne_bytes(word))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{SliceMemory, TestCallSite};
    use std::vec;
    use std::vec::Vec;

    /// The literal frame of a six-register call with two spilled arguments,
    /// as the entry probe sees it: rsp -> [return addr][arg7][arg8].
    fn spilled_frame() -> ([u64; 6], Vec<(u64, Vec<u8>)>) {
        let regs = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let mut stack = Vec::new();
        stack.extend_from_slice(&0xdead_beefu64.to_ne_bytes()); // return address
        stack.extend_from_slice(&0x77u64.to_ne_bytes()); // arg 7
        stack.extend_from_slice(&0x88u64.to_ne_bytes()); // arg 8
        (regs, vec![(0x7fff_0000, stack)])
    }

    #[test]
    fn register_arguments_come_from_registers() {
        let (regs, stack) = spilled_frame();
        let call = TestCallSite::new(4242, regs, 0x7fff_0000);
        let regions: Vec<(u64, &[u8])> =
            stack.iter().map(|(a, b)| (*a, b.as_slice())).collect();
        let mem = SliceMemory::new(&regions);

        for (n, expected) in (1..=6).zip([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]) {
            assert_eq!(argument(&call, &mem, &SYSTEM_V_AMD64, n).unwrap(), expected);
        }
    }

    #[test]
    fn seventh_argument_reads_the_first_stack_slot() {
        let (regs, stack) = spilled_frame();
        let call = TestCallSite::new(4242, regs, 0x7fff_0000);
        let regions: Vec<(u64, &[u8])> =
            stack.iter().map(|(a, b)| (*a, b.as_slice())).collect();
        let mem = SliceMemory::new(&regions);

        assert_eq!(argument(&call, &mem, &SYSTEM_V_AMD64, 7).unwrap(), 0x77);
        assert_eq!(argument(&call, &mem, &SYSTEM_V_AMD64, 8).unwrap(), 0x88);
    }

    #[test]
    fn stack_mutation_only_affects_spilled_arguments() {
        let (regs, mut stack) = spilled_frame();
        // Overwrite the first spilled slot only.
        stack[0].1[8..16].copy_from_slice(&0x9999u64.to_ne_bytes());

        let call = TestCallSite::new(4242, regs, 0x7fff_0000);
        let regions: Vec<(u64, &[u8])> =
            stack.iter().map(|(a, b)| (*a, b.as_slice())).collect();
        let mem = SliceMemory::new(&regions);

        assert_eq!(argument(&call, &mem, &SYSTEM_V_AMD64, 6).unwrap(), 0x66);
        assert_eq!(argument(&call, &mem, &SYSTEM_V_AMD64, 7).unwrap(), 0x9999);
    }

    #[test]
    fn unmapped_stack_slot_is_a_recoverable_fault() {
        let call = TestCallSite::new(1, [1, 2, 3, 4, 5, 6], 0x1000);
        let mem = SliceMemory::new(&[]);
        assert_eq!(argument(&call, &mem, &SYSTEM_V_AMD64, 7), Err(ReadFault));
        // Registers still resolve without memory.
        assert_eq!(argument(&call, &mem, &SYSTEM_V_AMD64, 2).unwrap(), 2);
    }

    #[test]
    fn narrow_register_profile_spills_earlier() {
        // A synthetic ABI with two register arguments and 4-byte slots.
        let abi = AbiProfile { register_arguments: 2, stack_base_offset: 4, stack_slot_stride: 4 };
        assert_eq!(abi.stack_slot(0x100, 2), None);
        assert_eq!(abi.stack_slot(0x100, 3), Some(0x104));
        assert_eq!(abi.stack_slot(0x100, 5), Some(0x10c));
    }
}
