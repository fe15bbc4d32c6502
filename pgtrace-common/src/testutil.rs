//! Host-side doubles for the probe environment: literal register files,
//! byte-image memory and a recording channel. Unit tests drive the real
//! encoders through these.

use crate::abi::CallSite;
use crate::events::{parse, Event};
use crate::mem::{MemoryReader, ReadFault};
use crate::sink::{ChannelFull, EventSink, Record};
use core::cell::{Cell, RefCell};
use std::vec::Vec;

/// A captured register file: six argument registers, a stack pointer and a
/// return value, plus fixed process identity and clock.
pub struct TestCallSite {
    pub pid: u32,
    pub timestamp_ns: u64,
    pub regs: [u64; 6],
    pub sp: u64,
    pub ret: u64,
}

impl TestCallSite {
    pub fn new(pid: u32, regs: [u64; 6], sp: u64) -> Self {
        Self { pid, timestamp_ns: 1_700_000_000, regs, sp, ret: 0 }
    }
}

impl CallSite for TestCallSite {
    fn process_id(&self) -> u32 {
        self.pid
    }

    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn register_argument(&self, slot: usize) -> Option<u64> {
        self.regs.get(slot).copied()
    }

    fn stack_pointer(&self) -> u64 {
        self.sp
    }

    fn return_value(&self) -> u64 {
        self.ret
    }
}

/// Target memory as explicit address-ranged byte images; anything outside
/// a region is an unmapped page.
pub struct SliceMemory<'a> {
    regions: &'a [(u64, &'a [u8])],
}

impl<'a> SliceMemory<'a> {
    pub fn new(regions: &'a [(u64, &'a [u8])]) -> Self {
        Self { regions }
    }

    fn region_from(&self, addr: u64) -> Option<&'a [u8]> {
        self.regions.iter().find_map(|&(base, bytes)| {
            let end = base + bytes.len() as u64;
            (addr >= base && addr < end).then(|| &bytes[(addr - base) as usize..])
        })
    }
}

impl MemoryReader for SliceMemory<'_> {
    fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadFault> {
        let src = self.region_from(addr).ok_or(ReadFault)?;
        if src.len() < dst.len() {
            return Err(ReadFault);
        }
        dst.copy_from_slice(&src[..dst.len()]);
        Ok(())
    }

    fn read_cstr(&self, addr: u64, dst: &mut [u8]) -> Result<usize, ReadFault> {
        let Some(src) = self.region_from(addr) else {
            if let Some(first) = dst.first_mut() {
                *first = 0;
            }
            return Err(ReadFault);
        };
        let cap = dst.len().saturating_sub(1);
        let len = src
            .iter()
            .take(cap)
            .position(|&b| b == 0)
            .unwrap_or_else(|| src.len().min(cap));
        dst[..len].copy_from_slice(&src[..len]);
        dst[len] = 0;
        Ok(len)
    }
}

/// Channel double: records what was published, in order, optionally
/// refusing everything past a fixed capacity to simulate saturation.
pub struct RecordingSink {
    events: RefCell<Vec<Event>>,
    capacity: Option<usize>,
    dropped: Cell<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self { events: RefCell::new(Vec::new()), capacity: None, dropped: Cell::new(0) }
    }

    pub fn saturating_after(capacity: usize) -> Self {
        Self { events: RefCell::new(Vec::new()), capacity: Some(capacity), dropped: Cell::new(0) }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn dropped(&self) -> usize {
        self.dropped.get()
    }
}

impl EventSink for RecordingSink {
    fn publish<R: Record>(&self, record: &R) -> Result<(), ChannelFull> {
        if let Some(cap) = self.capacity {
            if self.events.borrow().len() >= cap {
                self.dropped.set(self.dropped.get() + 1);
                return Err(ChannelFull);
            }
        }
        // Round-trip through the wire bytes so tests observe exactly what
        // the collaborator would.
        #[allow(unsafe_code)]
        let bytes = unsafe {
            core::slice::from_raw_parts(
                (record as *const R).cast::<u8>(),
                core::mem::size_of::<R>(),
            )
        };
        let event = parse(bytes).expect("published record must parse");
        self.events.borrow_mut().push(event);
        Ok(())
    }
}

/// Stack capturer returning a fixed id per site, recording which sites
/// were asked for.
pub struct TestStacks {
    pub id: i32,
    pub requested: RefCell<Vec<crate::stacks::StackSite>>,
}

impl TestStacks {
    pub fn new(id: i32) -> Self {
        Self { id, requested: RefCell::new(Vec::new()) }
    }
}

impl crate::stacks::StackCapture for TestStacks {
    fn capture(&self, site: crate::stacks::StackSite) -> i32 {
        self.requested.borrow_mut().push(site);
        self.id
    }
}
