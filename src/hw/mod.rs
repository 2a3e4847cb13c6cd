//! Hardware collaborator interfaces
//!
//! The status ring and the DMA layer belong to the platform; the pipeline
//! only talks to them through these traits. [`sim`] provides a software
//! model used by tests and the replay tool.

pub mod sim;

use crate::buffer::StatusBuffer;
use crate::Result;

/// One status ring slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingEntry {
    /// Device address of the armed buffer, 0 when the slot is empty
    pub addr: u64,
    /// Descriptor cookie (pool index)
    pub cookie: u32,
    /// Ownership tag of the software that armed the slot
    pub owner: u8,
}

impl RingEntry {
    pub fn new(addr: u64, cookie: u32, owner: u8) -> Self {
        Self { addr, cookie, owner }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

/// Software view of the hardware status ring.
///
/// The software pointer only moves through [`advance`](Self::advance).
/// Slots between it and the hardware pointer have been released by the
/// hardware and may be inspected and re-armed.
pub trait StatusSrng {
    /// Begin an access window; fails if the ring is not usable.
    fn access_start(&mut self) -> Result<()>;

    /// End the access window and publish the software pointer.
    fn access_end(&mut self);

    /// Slot at the software pointer, if the hardware has released it.
    fn peek_next(&self) -> Option<RingEntry>;

    /// Slot after the software pointer, if that one is released too.
    fn peek_next_next(&self) -> Option<RingEntry>;

    /// Overwrite the slot at the software pointer.
    fn write_next(&mut self, entry: RingEntry);

    /// Hand the slot at the software pointer back to the hardware.
    fn advance(&mut self);

    /// Slots currently released to software.
    fn num_avail(&self) -> usize;

    fn num_entries(&self) -> usize;
}

/// Buffer allocation and streaming DMA mapping.
pub trait DmaOps {
    /// Allocate a buffer of `size` bytes and map it for device writes.
    /// Allocation failures are `RxMonError::Alloc`, mapping failures
    /// `RxMonError::Map`.
    fn alloc_map(&mut self, size: usize) -> Result<StatusBuffer>;

    /// Make device writes visible to the CPU.
    fn sync_for_cpu(&mut self, buf: &mut StatusBuffer);

    fn unmap(&mut self, buf: &mut StatusBuffer);
}
