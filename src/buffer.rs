//! Status buffers and the parse queue
//!
//! A [`StatusBuffer`] is the DMA target the hardware writes status TLVs
//! into. Once reaped it is frozen into a [`FilledBuffer`] whose bytes can
//! be shared with consumers as cheap `Bytes` views.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;

/// Writable status buffer owned by a descriptor while armed in the ring
#[derive(Debug)]
pub struct StatusBuffer {
    paddr: u64,
    data: BytesMut,
    mapped: bool,
}

impl StatusBuffer {
    /// Zeroed buffer of `size` bytes at device address `paddr`
    pub fn new(paddr: u64, size: usize) -> Self {
        Self {
            paddr,
            data: BytesMut::zeroed(size),
            mapped: false,
        }
    }

    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn set_mapped(&mut self, mapped: bool) {
        self.mapped = mapped;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Stop writing; the bytes become shareable.
    pub fn freeze(self) -> FilledBuffer {
        FilledBuffer {
            paddr: self.paddr,
            data: self.data.freeze(),
        }
    }
}

/// Reaped status buffer, immutable from here on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilledBuffer {
    pub paddr: u64,
    pub data: Bytes,
}

impl FilledBuffer {
    pub fn new(paddr: u64, data: Bytes) -> Self {
        Self { paddr, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shared view of the whole buffer
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Shared view of a sub-range, clamped to the buffer.
    pub fn slice(&self, range: Range<usize>) -> Bytes {
        let end = range.end.min(self.data.len());
        let start = range.start.min(end);
        self.data.slice(start..end)
    }
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub flushed: u64,
}

/// FIFO of reaped buffers waiting to be parsed
#[derive(Debug, Default)]
pub struct StatusQueue {
    buffers: VecDeque<FilledBuffer>,
    stats: QueueStats,
}

impl StatusQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: FilledBuffer) {
        self.buffers.push_back(buffer);
        self.stats.enqueued += 1;
    }

    pub fn pop(&mut self) -> Option<FilledBuffer> {
        let buffer = self.buffers.pop_front()?;
        self.stats.dequeued += 1;
        Some(buffer)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drop everything still queued, returning how many were dropped.
    pub fn flush(&mut self) -> usize {
        let n = self.buffers.len();
        self.buffers.clear();
        self.stats.flushed += n as u64;
        n
    }

    pub fn get_stats(&self) -> &QueueStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_buffer_freeze() {
        let mut buf = StatusBuffer::new(0x4000, 32);
        assert_eq!(buf.len(), 32);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
        buf.as_mut_slice()[..3].copy_from_slice(&[1, 2, 3]);
        buf.set_mapped(true);
        assert!(buf.is_mapped());

        let filled = buf.freeze();
        assert_eq!(filled.paddr, 0x4000);
        assert_eq!(&filled.data[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_filled_buffer_slice_is_clamped() {
        let filled = FilledBuffer::new(1, Bytes::from_static(&[0, 1, 2, 3, 4, 5]));
        assert_eq!(filled.slice(2..4), Bytes::from_static(&[2, 3]));
        assert_eq!(filled.slice(4..100), Bytes::from_static(&[4, 5]));
        assert!(filled.slice(10..12).is_empty());
    }

    #[test]
    fn test_queue_order_and_stats() {
        let mut q = StatusQueue::new();
        q.push(FilledBuffer::new(1, Bytes::new()));
        q.push(FilledBuffer::new(2, Bytes::new()));
        q.push(FilledBuffer::new(3, Bytes::new()));
        assert_eq!(q.pop().map(|b| b.paddr), Some(1));
        assert_eq!(q.len(), 2);
        assert_eq!(q.flush(), 2);
        assert!(q.pop().is_none());

        let stats = q.get_stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dequeued, 1);
        assert_eq!(stats.flushed, 2);
    }
}
